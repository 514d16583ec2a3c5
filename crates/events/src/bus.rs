//! Fire-and-forget delivery of events to observers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::event::Event;
use crate::shutdown::ShutdownSignal;

/// An observer of stack events.
///
/// Sinks run on the dispatch worker. A sink that panics is reported and the
/// remaining sinks still receive the event; nothing propagates back to the
/// publisher.
pub trait EventSink: Send + Sync {
    /// Observer name used in failure reports.
    fn name(&self) -> &str {
        "sink"
    }

    /// Handle one event.
    fn on_event(&self, event: &Event);
}

/// Handle for publishing events. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
    shutdown: ShutdownSignal,
}

impl EventBus {
    /// Start the bus with a bounded queue and a fixed observer set, spawning
    /// the dispatch worker.
    pub fn start(capacity: usize, sinks: Vec<Box<dyn EventSink>>) -> EventBus {
        let (tx, rx) = mpsc::channel(capacity);
        let shutdown = ShutdownSignal::new();
        let bus = EventBus {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(dispatch_loop(rx, sinks, shutdown));
        bus
    }

    /// A bus with no observers, for components under test.
    pub fn noop() -> EventBus {
        let (tx, _rx) = mpsc::channel(1);
        EventBus {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Publish an event. Never blocks; drops and counts when the queue is
    /// full or the bus has shut down.
    pub fn publish(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(name = event.name(), "event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the dispatch worker after it drains queued events. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<Event>,
    sinks: Vec<Box<dyn EventSink>>,
    shutdown: ShutdownSignal,
) {
    debug!(sinks = sinks.len(), "event dispatch worker starting");
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => dispatch(&sinks, &event),
                None => break,
            },
            _ = shutdown.wait() => {
                // Drain whatever is already queued, then stop.
                while let Ok(event) = rx.try_recv() {
                    dispatch(&sinks, &event);
                }
                break;
            }
        }
    }
    debug!("event dispatch worker finished");
}

fn dispatch(sinks: &[Box<dyn EventSink>], event: &Event) {
    for sink in sinks {
        let result = catch_unwind(AssertUnwindSafe(|| sink.on_event(event)));
        if result.is_err() {
            warn!(
                sink = sink.name(),
                event = event.name(),
                "observer panicked handling event"
            );
        }
    }
}
