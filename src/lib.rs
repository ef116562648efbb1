//! boss-dl - bounded download scheduler for chat-bot media downloads
//!
//! This library provides the download core of a media bot: a bounded
//! priority queue, a worker pool with a fixed number of slots, per-user
//! storage quotas and a strategy selector that routes URLs to direct HTTP
//! downloads or to CLI tools, with one CLI retry when an API download fails.
//!
//! # Module Structure
//!
//! - `core`: Configuration, errors, logging, metrics and shared types
//! - `download`: Queue, download manager, quotas and strategies
//! - `scheduler`: Facade wiring the components together
//! - `commands`: Command channel and the line-oriented console
//! - `cli`: Command-line interface of the `boss-dl` binary

pub mod cli;
pub mod commands;
pub mod core;
pub mod download;
pub mod scheduler;

// Re-export commonly used types for convenience
pub use core::{config, SchedulerConfig, SchedulerError};
pub use download::{DownloadManager, DownloadResult, QueueManager, QuotaManager, StrategySelector};
pub use scheduler::Scheduler;
