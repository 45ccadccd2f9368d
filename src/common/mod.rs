pub mod error;
pub mod types;

pub use error::LoadBalancerError;
pub use types::ProxyBody;
