//! In-process storage backends.

pub mod workflow;

pub use workflow::InMemoryWorkflowStore;
