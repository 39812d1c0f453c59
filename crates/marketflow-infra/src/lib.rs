//! Infrastructure layer for MarketFlow.
//!
//! Contains implementations of the ports defined in `marketflow-core`: the
//! in-memory persistence store and the `config.toml` loader.

pub mod config;
pub mod memory;
