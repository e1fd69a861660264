pub mod breaker;
pub mod clients;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod metrics;
pub mod redis;
pub mod saga;

pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker, Counts};
pub use config::AppConfig;
pub use context::RequestContext;
pub use error::{Error, Result};
pub use saga::Saga;
