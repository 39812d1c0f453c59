//! Shared domain types for MarketFlow.
//!
//! Workflow definitions, execution state, recovery taxonomy, lifecycle
//! events and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod recovery;
pub mod workflow;
