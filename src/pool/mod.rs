pub mod backend;
pub mod health;
#[allow(clippy::module_inception)]
pub mod pool;

pub use backend::{Backend, InFlightGuard};
pub use health::HealthChecker;
pub use pool::UpstreamPool;
