pub mod backend;
pub mod dispatcher;
pub mod load_balancer;

pub use backend::{Backend, Upstream};
pub use dispatcher::Dispatcher;
pub use load_balancer::LoadBalancer;
