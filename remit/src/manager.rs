//! The [`RemittanceManager`]: the top-level, cloneable actor which exposes
//! the main entrypoints for driving a remittance exchange.
//!
//! The manager's primary responsibility is to coordinate shared access to
//! the underlying thread state machine: all thread mutations, persistence
//! calls, and waiter wakeups are serialized behind one engine-wide (Tokio)
//! lock, so callers, the dispatcher, and the persister can never race.
//!
//! Every state update follows the same shape:
//!
//! 1) Check: validate the proposed step against the thread's state.
//! 2) Mutate: apply the step and append to the audit logs.
//! 3) Persist: offer the updated snapshot to the storage callback.
//! 4) Notify: wake waiters and emit events, strictly after the write.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use common::envelope::{Receipt, Settlement};
use common::ids::{IdentityKey, ModuleId, ThreadId};
use common::thread::{InvalidTransition, Thread, ThreadRole, ThreadState};
use common::time::{Clock, SystemClock, TimestampMs};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::Error;
use crate::event::{EngineEvent, EventKind, EventListener, EventListeners};
use crate::store::ThreadStore;
use crate::traits::{
    CommsLayer, IdFactory, IdentityLayer, RemittanceModule, StateStorage,
    UuidFactory, Wallet,
};

/// Everything needed to construct a [`RemittanceManager`]. All collaborators
/// arrive here; the engine reads no environment and keeps no global state.
pub struct ManagerParams {
    pub config: EngineConfig,
    pub comms: Arc<dyn CommsLayer>,
    pub wallet: Arc<dyn Wallet>,
    pub identity_layer: Option<Arc<dyn IdentityLayer>>,
    pub modules: Vec<Arc<dyn RemittanceModule>>,
    pub storage: Option<Arc<dyn StateStorage>>,
    pub clock: Arc<dyn Clock>,
    pub id_factory: Arc<dyn IdFactory>,
}

impl ManagerParams {
    pub fn new(comms: Arc<dyn CommsLayer>, wallet: Arc<dyn Wallet>) -> Self {
        Self {
            config: EngineConfig::default(),
            comms,
            wallet,
            identity_layer: None,
            modules: Vec::new(),
            storage: None,
            clock: Arc::new(SystemClock),
            id_factory: Arc::new(UuidFactory),
        }
    }
}

/// The mutable engine state guarded by the single-writer lock: the thread
/// store plus the per-thread change-notification channels that back waiters.
pub(crate) struct EngineState {
    pub(crate) store: ThreadStore,
    watches: HashMap<ThreadId, watch::Sender<u64>>,
}

impl EngineState {
    /// Subscribe to change notifications for a thread. Any commit after the
    /// subscription marks the receiver changed, so wakeups cannot be missed
    /// as long as the subscription and the initial check share one lock
    /// acquisition.
    pub(crate) fn subscribe(
        &mut self,
        thread_id: &ThreadId,
    ) -> watch::Receiver<u64> {
        self.watches
            .entry(thread_id.clone())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Wake all waiters on a thread.
    pub(crate) fn notify(&mut self, thread_id: &ThreadId) {
        if let Some(tx) = self.watches.get(thread_id) {
            tx.send_modify(|version| *version += 1);
        }
    }
}

pub(crate) struct ManagerInner {
    pub(crate) config: EngineConfig,
    pub(crate) comms: Arc<dyn CommsLayer>,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) identity_layer: Option<Arc<dyn IdentityLayer>>,
    pub(crate) modules: BTreeMap<ModuleId, Arc<dyn RemittanceModule>>,
    pub(crate) storage: Option<Arc<dyn StateStorage>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) id_factory: Arc<dyn IdFactory>,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) events: EventListeners,
    /// Lazily-populated cache of our own identity key (see the wallet).
    identity_key: RwLock<Option<IdentityKey>>,
}

/// The peer-to-peer remittance protocol engine. Cheaply cloneable; all
/// clones share one underlying state machine.
#[derive(Clone)]
pub struct RemittanceManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl RemittanceManager {
    /// Constructs the engine, loading persisted state (if a storage
    /// collaborator is supplied) exactly once.
    pub async fn init(params: ManagerParams) -> Result<Self, Error> {
        let default_option = params.config.default_payment_option_id.clone();
        let store = match &params.storage {
            Some(storage) => {
                let loaded = storage.load().await.map_err(|err| {
                    Error::transport("Failed to load persisted state", err)
                })?;
                match loaded {
                    Some(persisted) =>
                        ThreadStore::restore(persisted, default_option)?,
                    None => ThreadStore::new(default_option),
                }
            }
            None => ThreadStore::new(default_option),
        };

        let mut modules = BTreeMap::new();
        for module in params.modules {
            let module_id = module.id();
            if modules.insert(module_id.clone(), module).is_some() {
                return Err(Error::config(format!(
                    "Duplicate remittance module id {module_id}",
                )));
            }
        }

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config: params.config,
                comms: params.comms,
                wallet: params.wallet,
                identity_layer: params.identity_layer,
                modules,
                storage: params.storage,
                clock: params.clock,
                id_factory: params.id_factory,
                state: Mutex::new(EngineState {
                    store,
                    watches: HashMap::new(),
                }),
                events: EventListeners::default(),
                identity_key: RwLock::new(None),
            }),
        })
    }

    // --- Small shared helpers --- //

    pub(crate) fn now(&self) -> TimestampMs {
        self.inner.clock.now()
    }

    pub(crate) fn next_id(&self) -> String {
        self.inner.id_factory.next_id()
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn module(
        &self,
        module_id: &ModuleId,
    ) -> Option<Arc<dyn RemittanceModule>> {
        self.inner.modules.get(module_id).cloned()
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().await
    }

    /// Offers the current snapshot to the storage callback. The snapshot is
    /// an isolated deep copy; the engine is free to mutate the store again
    /// as soon as this returns.
    pub(crate) async fn persist(
        &self,
        store: &ThreadStore,
    ) -> Result<(), Error> {
        if let Some(storage) = &self.inner.storage {
            storage.save(store.snapshot()).await.map_err(|err| {
                Error::transport("Failed to save persisted state", err)
            })?;
        }
        Ok(())
    }

    pub(crate) fn emit_events(&self, events: Vec<EngineEvent>) {
        self.inner.events.emit_all(&events);
    }

    /// Advances a thread's state, recording the audit log entry and queueing
    /// the `StateChanged` event on actual change.
    pub(crate) fn transition(
        &self,
        thread: &mut Thread,
        to: ThreadState,
        reason: &str,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), InvalidTransition> {
        let from = thread.state();
        if thread.transition_to(to, reason, self.now())? {
            events.push(EngineEvent::StateChanged {
                thread_id: thread.thread_id.clone(),
                from,
                to,
                reason: reason.to_owned(),
            });
        }
        Ok(())
    }

    /// Registers a brand-new thread.
    pub(crate) fn create_thread(
        &self,
        state: &mut EngineState,
        thread_id: ThreadId,
        counterparty: IdentityKey,
        my_role: ThreadRole,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), Error> {
        let thread = Thread::new(
            thread_id.clone(),
            counterparty.clone(),
            my_role,
            self.now(),
        );
        state.store.insert(thread)?;
        events.push(EngineEvent::ThreadCreated {
            thread_id,
            counterparty,
            my_role,
        });
        Ok(())
    }

    // --- Identity key caching --- //

    /// Re-checks and lazily populates the cached local identity key. Called
    /// by every public entry point; absence is only an error for the
    /// outbound steps that actually need the key.
    pub(crate) async fn refresh_identity_key(
        &self,
    ) -> Result<Option<IdentityKey>, Error> {
        if let Some(cached) = self.inner.identity_key.read().unwrap().clone() {
            return Ok(Some(cached));
        }
        let fetched =
            self.inner.wallet.identity_public_key().await.map_err(|err| {
                Error::transport(
                    "Failed to fetch identity key from wallet",
                    err,
                )
            })?;
        if let Some(key) = &fetched {
            *self.inner.identity_key.write().unwrap() = Some(key.clone());
        }
        Ok(fetched)
    }

    pub(crate) async fn require_identity_key(
        &self,
    ) -> Result<IdentityKey, Error> {
        self.refresh_identity_key().await?.ok_or_else(|| {
            Error::config("Wallet yielded no identity public key")
        })
    }

    // --- Waiters --- //

    /// Waits until `check` returns `Some` for the thread, waking on thread
    /// commits and falling back to polling `sync_threads` (which is what
    /// drives plain store-and-forward transports).
    ///
    /// The check runs before the terminal-state guard, so waiting *for* a
    /// terminal state works; reaching any other terminal state rejects the
    /// wait with [`Error::Terminal`]. The timeout is hard: in-flight
    /// transport or module calls are not cancelled and may still land their
    /// state updates later.
    pub(crate) async fn wait_for_thread<T>(
        &self,
        thread_id: &ThreadId,
        timeout: Duration,
        poll_interval: Duration,
        check: impl Fn(&Thread) -> Option<T>,
    ) -> Result<T, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = {
            let mut state = self.lock_state().await;
            // Validate the thread exists before settling in to wait.
            state.store.get_or_err(thread_id)?;
            state.subscribe(thread_id)
        };

        loop {
            {
                let state = self.lock_state().await;
                let thread = state.store.get_or_err(thread_id)?;
                if let Some(out) = check(thread) {
                    return Ok(out);
                }
                if thread.is_terminal() {
                    return Err(Error::terminal(format!(
                        "Thread {thread_id} reached terminal state '{}' \
                         while waiting",
                        thread.state(),
                    )));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::timeout(format!(
                    "Timed out after {timeout:?} waiting on thread \
                     {thread_id}",
                )));
            }
            let sleep_for = poll_interval.min(deadline - now);

            tokio::select! {
                changed = rx.changed() => {
                    // A commit touched this thread; re-check. A closed
                    // channel can't happen while the engine is alive, but
                    // fall through to the poll path if it somehow does.
                    if changed.is_err() {
                        tokio::time::sleep(sleep_for).await;
                    }
                }
                () = tokio::time::sleep(sleep_for) => {
                    // Poll fallback for transports without live pushes.
                    if let Err(err) = self.sync_threads(None).await {
                        warn!("Sync poll while waiting failed: {err:#}");
                    }
                }
            }
        }
    }

    /// Waits for the thread to reach exactly `target`.
    pub async fn wait_for_state(
        &self,
        thread_id: &ThreadId,
        target: ThreadState,
        timeout: Duration,
    ) -> Result<(), Error> {
        let poll_interval = self.config().receipt_poll_interval;
        self.wait_for_thread(thread_id, timeout, poll_interval, |thread| {
            (thread.state() == target).then_some(())
        })
        .await
    }

    /// Maker-side helper: waits for a settlement to arrive.
    pub async fn wait_for_settlement(
        &self,
        thread_id: &ThreadId,
        timeout: Duration,
    ) -> Result<Settlement, Error> {
        let poll_interval = self.config().receipt_poll_interval;
        self.wait_for_thread(thread_id, timeout, poll_interval, |thread| {
            thread.settlement.clone()
        })
        .await
    }

    /// Payer-side helper: waits for a receipt to arrive.
    pub async fn wait_for_receipt(
        &self,
        thread_id: &ThreadId,
        timeout: Duration,
    ) -> Result<Receipt, Error> {
        let poll_interval = self.config().receipt_poll_interval;
        self.wait_for_thread(thread_id, timeout, poll_interval, |thread| {
            thread.receipt.clone()
        })
        .await
    }

    // --- Getters --- //

    pub async fn get_thread(&self, thread_id: &ThreadId) -> Option<Thread> {
        self.lock_state().await.store.get(thread_id).cloned()
    }

    pub async fn get_thread_or_err(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Thread, Error> {
        self.lock_state()
            .await
            .store
            .get_or_err(thread_id)
            .map(Thread::clone)
    }

    /// Threads where we are taker with an unexpired, unpaid invoice.
    pub async fn payable_invoices(&self) -> Vec<Thread> {
        let now = self.now();
        self.lock_state().await.store.payable_invoices(now)
    }

    /// Threads where we are maker, still awaiting settlement.
    pub async fn receivable_invoices(&self) -> Vec<Thread> {
        self.lock_state().await.store.receivable_invoices()
    }

    // --- Event listener registration --- //

    /// Registers a sink receiving every [`EngineEvent`].
    pub fn add_event_sink(&self, listener: EventListener) {
        self.inner.events.add_sink(listener);
    }

    /// Registers a listener for one [`EventKind`].
    pub fn add_event_listener(&self, kind: EventKind, listener: EventListener) {
        self.inner.events.add_listener(kind, listener);
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::sync::atomic::Ordering;

    use common::amount::Amount;
    use common::envelope::Termination;
    use common::persist::PersistedState;

    use super::*;
    use crate::error::Error;
    use crate::outbound::{InvoiceInput, PayOutcome};
    use crate::test_support::{
        pump, InMemoryBus, MemoryStorage, PeerBuilder, TestModule,
    };

    fn invoice_input() -> InvoiceInput {
        InvoiceInput::new(Amount::from_str("1000 bsv:sat").unwrap())
    }

    #[tokio::test]
    async fn persisted_state_roundtrips_through_restart() {
        let bus = InMemoryBus::new();
        let storage = MemoryStorage::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .storage(storage.clone())
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;

        // Run a full exchange so the snapshot is non-trivial.
        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();
        taker.sync().await;
        let _maker_pump = pump(&maker);
        let outcome = taker.manager.pay(&thread_id, None).await.unwrap();
        assert!(matches!(outcome, PayOutcome::Receipt(_)));
        drop(_maker_pump);

        assert!(storage.saves.load(Ordering::SeqCst) > 0);
        let before = maker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(before.state(), ThreadState::Receipted);

        // Boot a fresh engine from the same storage.
        let restarted = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .storage(storage.clone())
            .build(&bus)
            .await;
        let after = restarted.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(before, after);

        // The restarted engine still behaves: filters see the same world.
        assert!(restarted.manager.receivable_invoices().await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_persisted_version_fails_init() {
        let bus = InMemoryBus::new();
        let storage = MemoryStorage::preloaded(PersistedState {
            v: 2,
            threads: Vec::new(),
            default_payment_option_id: None,
        });

        let err = PeerBuilder::new("maker")
            .storage(storage)
            .try_build(&bus)
            .await
            .err()
            .expect("init should fail");
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn operations_do_not_leak_across_threads() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;
        let taker_a = PeerBuilder::new("taker-a")
            .module(TestModule::new("M"))
            .config(|config| config.receipt_provided = false)
            .build(&bus)
            .await;
        let taker_b = PeerBuilder::new("taker-b")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;

        let handle_a = maker
            .manager
            .send_invoice(taker_a.key.clone(), invoice_input())
            .await
            .unwrap();
        let handle_b = maker
            .manager
            .send_invoice(taker_b.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_b_before = maker
            .manager
            .get_thread(handle_b.thread_id())
            .await
            .unwrap();

        // Drive thread A to settled; thread B must not move.
        taker_a.sync().await;
        taker_a
            .manager
            .pay(handle_a.thread_id(), None)
            .await
            .unwrap();
        maker.sync().await;

        let thread_a = maker
            .manager
            .get_thread(handle_a.thread_id())
            .await
            .unwrap();
        let thread_b_after = maker
            .manager
            .get_thread(handle_b.thread_id())
            .await
            .unwrap();
        assert_eq!(thread_a.state(), ThreadState::Receipted);
        assert_eq!(thread_b_before, thread_b_after);
    }

    #[tokio::test]
    async fn waiters_reject_on_terminal_states() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();

        // Wait for a settlement that will never come: the thread gets
        // terminated instead.
        let waiting_manager = maker.manager.clone();
        let waiting_thread_id = thread_id.clone();
        let waiter = tokio::spawn(async move {
            waiting_manager
                .wait_for_settlement(
                    &waiting_thread_id,
                    Duration::from_secs(3),
                )
                .await
        });

        taker.sync().await;
        // Inject a termination from the taker side.
        let termination = Termination::new("changedMind", "Not buying");
        let envelope = common::envelope::Envelope::new(
            "e-term",
            common::envelope::EnvelopeKind::Termination,
            thread_id.clone(),
            TimestampMs::from(2_000u32),
            &termination,
        );
        bus.inject(
            &taker.key,
            &maker.key,
            "remittance_inbox",
            &envelope.serialize(),
        );
        maker.sync().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Terminal(_))));

        // Waiting *for* the terminal state itself succeeds.
        maker
            .manager
            .wait_for_state(
                &thread_id,
                ThreadState::Terminated,
                Duration::from_millis(100),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn waiter_times_out() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker").build(&bus).await;

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();

        let err = maker
            .manager
            .wait_for_settlement(
                handle.thread_id(),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn get_thread_or_err_reports_unknown_threads() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker").build(&bus).await;
        let err = maker
            .manager
            .get_thread_or_err(&ThreadId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn payable_and_receivable_filters() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .config(|config| config.invoice_expiry_seconds = 60)
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        taker.sync().await;

        assert_eq!(maker.manager.receivable_invoices().await.len(), 1);
        assert_eq!(taker.manager.payable_invoices().await.len(), 1);
        assert!(maker.manager.payable_invoices().await.is_empty());
        assert!(taker.manager.receivable_invoices().await.is_empty());

        // Expired invoices drop out of the payable list.
        taker.clock.advance_ms(120_000);
        assert!(taker.manager.payable_invoices().await.is_empty());

        let _ = handle;
    }

    #[tokio::test]
    async fn thread_watch_wakes_subscribers() {
        use tokio_test::{assert_pending, assert_ready};

        let mut state = EngineState {
            store: ThreadStore::new(None),
            watches: HashMap::new(),
        };
        let thread_id = ThreadId::from("t-1");

        let mut rx = state.subscribe(&thread_id);
        let mut task = tokio_test::task::spawn(async move {
            rx.changed().await.map(|()| ())
        });
        assert_pending!(task.poll());

        state.notify(&thread_id);
        assert_ready!(task.poll()).unwrap();
    }

    #[tokio::test]
    async fn duplicate_module_ids_fail_init() {
        let bus = InMemoryBus::new();
        let err = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .module(TestModule::new("M"))
            .try_build(&bus)
            .await
            .err()
            .expect("init should fail");
        assert!(matches!(err, Error::Config(_)));
    }
}
