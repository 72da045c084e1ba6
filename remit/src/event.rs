//! Engine events.
//!
//! The engine emits a tagged [`EngineEvent`] for every significant
//! transition. Embedders register listeners either per [`EventKind`] or as a
//! single sink; white-box tests use the same stream in place of sleeps.
//! Listener panics are caught and logged, never fatal.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use common::envelope::EnvelopeKind;
use common::ids::{IdentityKey, ThreadId};
use common::thread::{Direction, ThreadRole, ThreadState};
use tracing::warn;

/// A significant engine transition. Records are immutable snapshots; no
/// thread internals are ever handed to listeners.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    ThreadCreated {
        thread_id: ThreadId,
        counterparty: IdentityKey,
        my_role: ThreadRole,
    },
    StateChanged {
        thread_id: ThreadId,
        from: ThreadState,
        to: ThreadState,
        reason: String,
    },
    EnvelopeSent {
        thread_id: ThreadId,
        kind: EnvelopeKind,
        transport_message_id: String,
    },
    EnvelopeReceived {
        thread_id: ThreadId,
        kind: EnvelopeKind,
        transport_message_id: String,
    },
    IdentityRequested {
        thread_id: ThreadId,
        direction: Direction,
    },
    IdentityResponded {
        thread_id: ThreadId,
        direction: Direction,
    },
    IdentityAcknowledged {
        thread_id: ThreadId,
        direction: Direction,
    },
    InvoiceSent { thread_id: ThreadId },
    InvoiceReceived { thread_id: ThreadId },
    SettlementSent { thread_id: ThreadId },
    SettlementReceived { thread_id: ThreadId },
    ReceiptSent { thread_id: ThreadId },
    ReceiptReceived { thread_id: ThreadId },
    TerminationSent { thread_id: ThreadId },
    TerminationReceived { thread_id: ThreadId },
    Error {
        thread_id: Option<ThreadId>,
        message: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ThreadCreated { .. } => EventKind::ThreadCreated,
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::EnvelopeSent { .. } => EventKind::EnvelopeSent,
            Self::EnvelopeReceived { .. } => EventKind::EnvelopeReceived,
            Self::IdentityRequested { .. } => EventKind::IdentityRequested,
            Self::IdentityResponded { .. } => EventKind::IdentityResponded,
            Self::IdentityAcknowledged { .. } =>
                EventKind::IdentityAcknowledged,
            Self::InvoiceSent { .. } => EventKind::InvoiceSent,
            Self::InvoiceReceived { .. } => EventKind::InvoiceReceived,
            Self::SettlementSent { .. } => EventKind::SettlementSent,
            Self::SettlementReceived { .. } => EventKind::SettlementReceived,
            Self::ReceiptSent { .. } => EventKind::ReceiptSent,
            Self::ReceiptReceived { .. } => EventKind::ReceiptReceived,
            Self::TerminationSent { .. } => EventKind::TerminationSent,
            Self::TerminationReceived { .. } => EventKind::TerminationReceived,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// The thread this event concerns, if any.
    pub fn thread_id(&self) -> Option<&ThreadId> {
        match self {
            Self::ThreadCreated { thread_id, .. }
            | Self::StateChanged { thread_id, .. }
            | Self::EnvelopeSent { thread_id, .. }
            | Self::EnvelopeReceived { thread_id, .. }
            | Self::IdentityRequested { thread_id, .. }
            | Self::IdentityResponded { thread_id, .. }
            | Self::IdentityAcknowledged { thread_id, .. }
            | Self::InvoiceSent { thread_id }
            | Self::InvoiceReceived { thread_id }
            | Self::SettlementSent { thread_id }
            | Self::SettlementReceived { thread_id }
            | Self::ReceiptSent { thread_id }
            | Self::ReceiptReceived { thread_id }
            | Self::TerminationSent { thread_id }
            | Self::TerminationReceived { thread_id } => Some(thread_id),
            Self::Error { thread_id, .. } => thread_id.as_ref(),
        }
    }
}

/// The tag of an [`EngineEvent`], for per-kind listener registration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    ThreadCreated,
    StateChanged,
    EnvelopeSent,
    EnvelopeReceived,
    IdentityRequested,
    IdentityResponded,
    IdentityAcknowledged,
    InvoiceSent,
    InvoiceReceived,
    SettlementSent,
    SettlementReceived,
    ReceiptSent,
    ReceiptReceived,
    TerminationSent,
    TerminationReceived,
    Error,
}

/// A registered event callback.
///
/// Listeners run synchronously on the emitting task and must not block or
/// call back into the engine; hand events off to a channel for anything
/// heavier.
pub type EventListener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// The listener registry.
#[derive(Default)]
pub(crate) struct EventListeners {
    sinks: Mutex<Vec<EventListener>>,
    by_kind: Mutex<HashMap<EventKind, Vec<EventListener>>>,
}

impl EventListeners {
    pub(crate) fn add_sink(&self, listener: EventListener) {
        self.sinks.lock().unwrap().push(listener);
    }

    pub(crate) fn add_listener(
        &self,
        kind: EventKind,
        listener: EventListener,
    ) {
        self.by_kind
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(listener);
    }

    pub(crate) fn emit(&self, event: &EngineEvent) {
        let sinks = self.sinks.lock().unwrap().clone();
        let for_kind = self
            .by_kind
            .lock()
            .unwrap()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for listener in sinks.iter().chain(for_kind.iter()) {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                warn!(kind = ?event.kind(), "Event listener panicked");
            }
        }
    }

    pub(crate) fn emit_all(&self, events: &[EngineEvent]) {
        for event in events {
            self.emit(event);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn sink_and_kind_listeners_both_fire() {
        let listeners = EventListeners::default();
        let sink_count = Arc::new(AtomicUsize::new(0));
        let kind_count = Arc::new(AtomicUsize::new(0));

        let c = sink_count.clone();
        listeners.add_sink(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = kind_count.clone();
        listeners.add_listener(
            EventKind::InvoiceSent,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let thread_id = ThreadId::from("t-1");
        listeners.emit(&EngineEvent::InvoiceSent {
            thread_id: thread_id.clone(),
        });
        listeners.emit(&EngineEvent::ReceiptSent { thread_id });

        assert_eq!(sink_count.load(Ordering::SeqCst), 2);
        assert_eq!(kind_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_is_contained() {
        let listeners = EventListeners::default();
        let count = Arc::new(AtomicUsize::new(0));

        listeners.add_sink(Arc::new(|_| panic!("listener bug")));
        let c = count.clone();
        listeners.add_sink(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.emit(&EngineEvent::Error {
            thread_id: None,
            message: "boom".to_owned(),
        });

        // The panic was contained and later listeners still ran.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
