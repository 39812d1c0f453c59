//! Workflow engine: definitions, dependency resolution, execution and recovery.
//!
//! - `definition` -- YAML parsing, validation, optimization analysis
//! - `dag` -- dependency graph, cycle detection, ready/blocked resolution
//! - `expression` -- JEXL evaluation for preconditions, guards and criteria
//! - `context` -- ambient context providers
//! - `executor` -- step executor port and registry
//! - `step_runner` -- single attempts under timeout, built-in executors
//! - `limiter` -- concurrency bounding for parallel groups
//! - `retry` -- retry schedules and backoff
//! - `recovery` -- error-kind driven remediation and escalation
//! - `checkpoint` -- execution snapshots
//! - `rollback` -- compensation planning and execution
//! - `coordinator` -- the `WorkflowEngine` that drives executions

pub mod checkpoint;
pub mod context;
pub mod coordinator;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod limiter;
pub mod recovery;
pub mod retry;
pub mod rollback;
pub mod step_runner;

pub use coordinator::{EngineError, ExecutionHandle, WorkflowEngine};
