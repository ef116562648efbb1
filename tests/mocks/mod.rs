//! Mock implementations for scheduler tests
//!
//! Strategies that simulate downloads without network or subprocess access.

pub mod mock_strategy;

pub use mock_strategy::{MockStrategy, MockStrategyConfig};
