//! Core utilities, configuration, and common functionality

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod rate_limiter;
pub mod types;

// Re-exports for convenience
pub use config::SchedulerConfig;
pub use error::{QuotaViolation, SchedulerError, SchedulerResult};
pub use logging::{init_logger, log_startup_configuration};
pub use types::{ItemStatus, Requester, TaskPriority};
