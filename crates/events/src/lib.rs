//! Typed events and the observer bus.
//!
//! Components publish `Event` values through an [`EventBus`]; registered
//! [`EventSink`] observers receive them on a dedicated dispatch worker.
//! Publishing never blocks: when the queue is full the event is dropped and
//! counted, protecting the RF path from slow observers.

pub mod bus;
pub mod event;
pub mod shutdown;

pub use bus::{EventBus, EventSink};
pub use event::Event;
pub use shutdown::ShutdownSignal;
