//! Event system module
//!
//! Provides the typed pub/sub bus used by every component, the wildcard
//! envelope tap, and the bridge that persists lifecycle events.

mod bus;
mod recorder;

pub use bus::{Event, EventBus, EventEnvelope, Topic};
pub use recorder::spawn_recorder;
