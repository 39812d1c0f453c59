//! Lifecycle notification port and the broadcast bus implementing it.

pub mod bus;

pub use bus::{EventBus, NotificationSink};
