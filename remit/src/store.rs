//! The in-memory thread store and its snapshot/restore logic.

use std::collections::HashMap;

use common::ids::{OptionId, ThreadId};
use common::persist::{PersistedState, STATE_VERSION};
use common::thread::{Thread, ThreadRole};
use common::time::TimestampMs;
use tracing::debug;

use crate::error::Error;

/// Holds every [`Thread`] the engine knows about. Only ever touched behind
/// the engine-wide lock; threads are never destroyed, terminal states just
/// freeze them.
#[derive(Debug)]
pub(crate) struct ThreadStore {
    threads: HashMap<ThreadId, Thread>,
    default_payment_option_id: Option<OptionId>,
}

impl ThreadStore {
    pub(crate) fn new(default_payment_option_id: Option<OptionId>) -> Self {
        Self {
            threads: HashMap::new(),
            default_payment_option_id,
        }
    }

    /// Rebuilds the store from a persisted snapshot.
    ///
    /// Fails fast on a version mismatch. Threads persisted without a state
    /// get one derived from their contents; threads persisted *with* a
    /// state are validated against the same derivation.
    pub(crate) fn restore(
        persisted: PersistedState,
        fallback_default_option: Option<OptionId>,
    ) -> Result<Self, Error> {
        if persisted.v != STATE_VERSION {
            return Err(Error::config(format!(
                "Unsupported persisted state version {} (expected {})",
                persisted.v, STATE_VERSION,
            )));
        }

        let mut threads = HashMap::with_capacity(persisted.threads.len());
        for mut thread in persisted.threads {
            let derived = thread.derived_state();
            match thread.state {
                None => {
                    debug!(
                        thread_id = %thread.thread_id,
                        state = %derived,
                        "Deriving state for legacy persisted thread",
                    );
                    thread.state = Some(derived);
                }
                Some(stored) if stored != derived => {
                    return Err(Error::config(format!(
                        "Persisted thread {} is inconsistent: stored state \
                         {stored} but contents imply {derived}",
                        thread.thread_id,
                    )));
                }
                Some(_) => {}
            }
            if thread.their_role != thread.my_role.opposite() {
                return Err(Error::config(format!(
                    "Persisted thread {} has non-opposite roles",
                    thread.thread_id,
                )));
            }
            let thread_id = thread.thread_id.clone();
            if threads.insert(thread_id.clone(), thread).is_some() {
                return Err(Error::config(format!(
                    "Persisted state contains duplicate thread {thread_id}",
                )));
            }
        }

        Ok(Self {
            threads,
            default_payment_option_id: persisted
                .default_payment_option_id
                .or(fallback_default_option),
        })
    }

    /// Snapshots the store for the persistence callback. The result is a
    /// deep copy, isolated from all subsequent engine mutations; threads are
    /// ordered by creation time for stable output.
    pub(crate) fn snapshot(&self) -> PersistedState {
        let mut threads = self.threads.values().cloned().collect::<Vec<_>>();
        threads.sort_by(|a, b| {
            (a.created_at, &a.thread_id).cmp(&(b.created_at, &b.thread_id))
        });
        PersistedState::new(threads, self.default_payment_option_id.clone())
    }

    pub(crate) fn get(&self, thread_id: &ThreadId) -> Option<&Thread> {
        self.threads.get(thread_id)
    }

    pub(crate) fn get_mut(
        &mut self,
        thread_id: &ThreadId,
    ) -> Option<&mut Thread> {
        self.threads.get_mut(thread_id)
    }

    pub(crate) fn get_or_err(
        &self,
        thread_id: &ThreadId,
    ) -> Result<&Thread, Error> {
        self.get(thread_id)
            .ok_or_else(|| Error::precondition(format!("Unknown thread {thread_id}")))
    }

    pub(crate) fn get_mut_or_err(
        &mut self,
        thread_id: &ThreadId,
    ) -> Result<&mut Thread, Error> {
        self.threads
            .get_mut(thread_id)
            .ok_or_else(|| Error::precondition(format!("Unknown thread {thread_id}")))
    }

    pub(crate) fn contains(&self, thread_id: &ThreadId) -> bool {
        self.threads.contains_key(thread_id)
    }

    /// Registers a brand-new thread. Thread id reuse is a protocol error.
    pub(crate) fn insert(&mut self, thread: Thread) -> Result<(), Error> {
        let thread_id = thread.thread_id.clone();
        if self.threads.insert(thread_id.clone(), thread).is_some() {
            return Err(Error::Protocol(format!(
                "Thread id {thread_id} already exists",
            )));
        }
        Ok(())
    }

    pub(crate) fn default_payment_option_id(&self) -> Option<&OptionId> {
        self.default_payment_option_id.as_ref()
    }

    /// Invoices we could pay: we are taker, an invoice is present and
    /// unexpired, and we haven't settled or hit a terminal state.
    pub(crate) fn payable_invoices(&self, now: TimestampMs) -> Vec<Thread> {
        let mut threads = self
            .threads
            .values()
            .filter(|t| {
                t.my_role == ThreadRole::Taker
                    && t.settlement.is_none()
                    && !t.is_terminal()
                    && t.invoice
                        .as_ref()
                        .is_some_and(|invoice| !invoice.is_expired(now))
            })
            .cloned()
            .collect::<Vec<_>>();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        threads
    }

    /// Invoices we issued and are still awaiting settlement for.
    pub(crate) fn receivable_invoices(&self) -> Vec<Thread> {
        let mut threads = self
            .threads
            .values()
            .filter(|t| {
                t.my_role == ThreadRole::Maker
                    && t.invoice.is_some()
                    && t.settlement.is_none()
                    && !t.is_terminal()
            })
            .cloned()
            .collect::<Vec<_>>();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        threads
    }
}

#[cfg(test)]
mod test {
    use common::ids::IdentityKey;
    use common::thread::ThreadState;

    use super::*;

    fn thread(id: &str, role: ThreadRole) -> Thread {
        Thread::new(
            ThreadId::from(id),
            IdentityKey::from("k-peer"),
            role,
            TimestampMs::from(1_000u32),
        )
    }

    #[test]
    fn insert_rejects_thread_id_reuse() {
        let mut store = ThreadStore::new(None);
        store.insert(thread("t-1", ThreadRole::Maker)).unwrap();
        let err = store.insert(thread("t-1", ThreadRole::Taker)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn restore_rejects_version_mismatch() {
        let persisted = PersistedState {
            v: 2,
            threads: Vec::new(),
            default_payment_option_id: None,
        };
        let err = ThreadStore::restore(persisted, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn restore_derives_missing_states() {
        let mut legacy = thread("t-1", ThreadRole::Maker);
        legacy.state = None;
        legacy.identity.request_sent = true;

        let persisted = PersistedState::new(vec![legacy], None);
        let store = ThreadStore::restore(persisted, None).unwrap();
        let restored = store.get(&ThreadId::from("t-1")).unwrap();
        assert_eq!(restored.state(), ThreadState::IdentityRequested);
    }

    #[test]
    fn restore_rejects_inconsistent_state() {
        let mut bad = thread("t-1", ThreadRole::Maker);
        // Claims settled, but carries no settlement.
        bad.state = Some(ThreadState::Settled);

        let persisted = PersistedState::new(vec![bad], None);
        let err = ThreadStore::restore(persisted, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn snapshot_roundtrips_through_restore() {
        let mut store = ThreadStore::new(Some(OptionId::from("M")));
        store.insert(thread("t-1", ThreadRole::Maker)).unwrap();
        store.insert(thread("t-2", ThreadRole::Taker)).unwrap();

        let snapshot = store.snapshot();
        let restored = ThreadStore::restore(snapshot.clone(), None).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(
            restored.default_payment_option_id(),
            Some(&OptionId::from("M")),
        );
    }

    #[test]
    fn snapshot_is_isolated_from_later_mutations() {
        let mut store = ThreadStore::new(None);
        store.insert(thread("t-1", ThreadRole::Maker)).unwrap();

        let snapshot = store.snapshot();
        store
            .get_mut(&ThreadId::from("t-1"))
            .unwrap()
            .flags
            .has_invoiced = true;

        assert!(!snapshot.threads[0].flags.has_invoiced);
    }
}
