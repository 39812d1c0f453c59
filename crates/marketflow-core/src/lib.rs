//! Orchestration logic and port trait definitions for MarketFlow.
//!
//! This crate defines the ports (persistence, notification, step execution,
//! context) that the infrastructure layer implements. It depends only on
//! `marketflow-types` -- never on `marketflow-infra` or any storage crate.

pub mod event;
pub mod repository;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
