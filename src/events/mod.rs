//! In-process publish/subscribe broadcast of lifecycle events.

pub mod bus;

pub use bus::{EventBus, Subscription};
