//! Download management and processing

pub mod error;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod quota;
pub mod source;
pub mod tool_errors;

// Re-exports for convenience
pub use error::DownloadError;
pub use manager::{DownloadManager, DownloadResult};
pub use queue::{QueueEvent, QueueItem, QueueManager, QueueSnapshot};
pub use quota::{QuotaLimits, QuotaManager, QuotaRecord, Reservation};
pub use source::{DownloadStrategy, Platform, SelectedStrategy, StrategyMode, StrategySelector};
