pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod proxy;
pub mod server;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use server::Supervisor;
