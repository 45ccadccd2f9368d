pub mod common;
pub mod configuration;
pub mod proxy;
pub mod selection_method;
pub mod utils;

pub mod prelude {
    pub use crate::common::{LoadBalancerError, ProxyBody};
    pub use crate::configuration::Settings;
    pub use crate::proxy::{Backend, Dispatcher, LoadBalancer, Upstream};
}
