//! fbuild Events - in-process event bus for the daemon.
//!
//! Managers publish [`DaemonEvent`]s when state changes; the message router
//! subscribes once and fans matching events out to wire subscribers. The
//! bus is broadcast-only: a slow receiver lags and drops, it never blocks a
//! publisher.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod bus;
mod event;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::DaemonEvent;
