//! Observability setup for MarketFlow: tracing subscriber installation and
//! the attribute names used on workflow spans.

pub mod attrs;
pub mod tracing_setup;
