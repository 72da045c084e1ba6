//! Shared white-box test fixtures: an in-memory message bus, configurable
//! test collaborators, and a two-peer harness for driving full exchanges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::envelope::{
    Certificate, Envelope, EnvelopeKind, IdentityVerificationRequest,
    IdentityVerificationResponse, Invoice, Termination,
};
use common::ids::{IdentityKey, ModuleId, ThreadId};
use common::persist::PersistedState;
use common::time::{ManualClock, TimestampMs};
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::manager::{ManagerParams, RemittanceManager};
use crate::traits::{
    AcceptOutcome, AcceptSettlement, BuildSettlement, CertificateAssessment,
    CommsLayer, IdFactory, IdentityLayer, IdentityResponseAction, PeerMessage,
    ProcessReceipt, ProcessTermination, RemittanceModule, SettlementOutcome,
    StateStorage, Wallet,
};

// --- In-memory message bus --- //

struct StoredMessage {
    message: PeerMessage,
    acked: bool,
}

struct BusInner {
    boxes: HashMap<IdentityKey, Vec<StoredMessage>>,
    live: HashMap<IdentityKey, mpsc::Sender<PeerMessage>>,
    sent_log: Vec<PeerMessage>,
}

/// A store-and-forward message bus shared by every peer in a test.
pub(crate) struct InMemoryBus {
    inner: Mutex<BusInner>,
    next_message_id: AtomicU64,
}

impl InMemoryBus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                boxes: HashMap::new(),
                live: HashMap::new(),
                sent_log: Vec::new(),
            }),
            next_message_id: AtomicU64::new(1),
        })
    }

    /// Delivers a raw body into `recipient`'s box, returning the transport
    /// message id. Also usable directly by tests to inject crafted frames.
    pub(crate) fn inject(
        &self,
        sender: &IdentityKey,
        recipient: &IdentityKey,
        message_box: &str,
        body: &str,
    ) -> String {
        let n = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message_id = format!("m-{n}");
        let message = PeerMessage {
            message_id: message_id.clone(),
            sender: sender.clone(),
            recipient: recipient.clone(),
            message_box: message_box.to_owned(),
            body: body.to_owned(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.sent_log.push(message.clone());
        inner
            .boxes
            .entry(recipient.clone())
            .or_default()
            .push(StoredMessage {
                message,
                acked: false,
            });
        message_id
    }

    /// Every envelope kind ever put on the bus, in send order.
    pub(crate) fn sent_kinds(&self) -> Vec<EnvelopeKind> {
        self.inner
            .lock()
            .unwrap()
            .sent_log
            .iter()
            .filter_map(|m| Envelope::parse(&m.body))
            .map(|envelope| envelope.kind)
            .collect()
    }

    pub(crate) fn is_acked(&self, message_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .boxes
            .values()
            .flatten()
            .any(|stored| stored.message.message_id == message_id && stored.acked)
    }

    /// Marks a message unacked again, simulating transport redelivery.
    pub(crate) fn redeliver(&self, message_id: &str) {
        for stored in self.inner.lock().unwrap().boxes.values_mut().flatten() {
            if stored.message.message_id == message_id {
                stored.acked = false;
            }
        }
    }
}

/// One peer's view of the bus.
pub(crate) struct BusComms {
    bus: Arc<InMemoryBus>,
    me: IdentityKey,
    pub(crate) fail_sends: AtomicBool,
    /// Flips this peer into a live-capable transport.
    pub(crate) live_enabled: AtomicBool,
}

#[async_trait]
impl CommsLayer for BusComms {
    async fn send_message(
        &self,
        recipient: &IdentityKey,
        message_box: &str,
        body: &str,
        _host_override: Option<&str>,
    ) -> anyhow::Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("503 Service Unavailable: bus is down");
        }
        Ok(self.bus.inject(&self.me, recipient, message_box, body))
    }

    async fn list_messages(
        &self,
        message_box: &str,
        _host_override: Option<&str>,
    ) -> anyhow::Result<Vec<PeerMessage>> {
        let inner = self.bus.inner.lock().unwrap();
        Ok(inner
            .boxes
            .get(&self.me)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|s| !s.acked && s.message.message_box == message_box)
                    .map(|s| s.message.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn acknowledge_messages(
        &self,
        message_ids: &[String],
    ) -> anyhow::Result<()> {
        let mut inner = self.bus.inner.lock().unwrap();
        if let Some(stored) = inner.boxes.get_mut(&self.me) {
            for s in stored.iter_mut() {
                if message_ids.contains(&s.message.message_id) {
                    s.acked = true;
                }
            }
        }
        Ok(())
    }

    fn supports_live_messages(&self) -> bool {
        self.live_enabled.load(Ordering::SeqCst)
    }

    async fn send_live_message(
        &self,
        recipient: &IdentityKey,
        message_box: &str,
        body: &str,
        _host_override: Option<&str>,
    ) -> anyhow::Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("503 Service Unavailable: bus is down");
        }
        let live_tx = self
            .bus
            .inner
            .lock()
            .unwrap()
            .live
            .get(recipient)
            .cloned();
        let Some(live_tx) = live_tx else {
            anyhow::bail!("Recipient {recipient} has no live connection");
        };

        let n = self.bus.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message_id = format!("m-live-{n}");
        let message = PeerMessage {
            message_id: message_id.clone(),
            sender: self.me.clone(),
            recipient: recipient.clone(),
            message_box: message_box.to_owned(),
            body: body.to_owned(),
        };
        self.bus.inner.lock().unwrap().sent_log.push(message.clone());
        live_tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("Live connection dropped"))?;
        Ok(message_id)
    }

    async fn subscribe_live_messages(
        &self,
        _message_box: &str,
        _host_override: Option<&str>,
    ) -> anyhow::Result<mpsc::Receiver<PeerMessage>> {
        let (tx, rx) = mpsc::channel(32);
        self.bus.inner.lock().unwrap().live.insert(self.me.clone(), tx);
        self.live_enabled.store(true, Ordering::SeqCst);
        Ok(rx)
    }
}

// --- Test wallet --- //

pub(crate) struct TestWallet {
    key: Option<IdentityKey>,
}

#[async_trait]
impl Wallet for TestWallet {
    async fn identity_public_key(&self) -> anyhow::Result<Option<IdentityKey>> {
        Ok(self.key.clone())
    }
}

// --- Test module --- //

pub(crate) enum BuildBehavior {
    Settle(serde_json::Value),
    Terminate(Termination),
    Fail(String),
}

pub(crate) enum AcceptBehavior {
    Accept(Option<serde_json::Value>),
    Terminate(Termination),
    Fail(String),
}

/// A configurable settlement module that records its hook invocations.
pub(crate) struct TestModule {
    id: ModuleId,
    pub(crate) allow_unsolicited: bool,
    /// `Some` means the module declares an option on every invoice.
    pub(crate) option_terms: Option<serde_json::Value>,
    pub(crate) build: Mutex<BuildBehavior>,
    pub(crate) accept: Mutex<AcceptBehavior>,
    pub(crate) receipts_processed: AtomicUsize,
    pub(crate) terminations_processed: AtomicUsize,
}

impl TestModule {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ModuleId::from(id),
            allow_unsolicited: false,
            option_terms: Some(serde_json::json!({ "rail": "test" })),
            build: Mutex::new(BuildBehavior::Settle(
                serde_json::json!({ "tx": "deadbeef" }),
            )),
            accept: Mutex::new(AcceptBehavior::Accept(Some(
                serde_json::json!({ "confirmed": true }),
            ))),
            receipts_processed: AtomicUsize::new(0),
            terminations_processed: AtomicUsize::new(0),
        })
    }

    pub(crate) fn new_unsolicited(id: &str) -> Arc<Self> {
        let mut module = Self::new(id);
        Arc::get_mut(&mut module).unwrap().allow_unsolicited = true;
        module
    }

    pub(crate) fn set_build(&self, behavior: BuildBehavior) {
        *self.build.lock().unwrap() = behavior;
    }

    pub(crate) fn set_accept(&self, behavior: AcceptBehavior) {
        *self.accept.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl RemittanceModule for TestModule {
    fn id(&self) -> ModuleId {
        self.id.clone()
    }

    fn name(&self) -> &str {
        "Test settlement module"
    }

    fn allow_unsolicited_settlements(&self) -> bool {
        self.allow_unsolicited
    }

    async fn create_option(
        &self,
        _thread_id: &ThreadId,
        _invoice: &Invoice,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.option_terms.clone())
    }

    async fn build_settlement(
        &self,
        _request: BuildSettlement,
    ) -> anyhow::Result<SettlementOutcome> {
        match &*self.build.lock().unwrap() {
            BuildBehavior::Settle(artifact) =>
                Ok(SettlementOutcome::Settle {
                    artifact: artifact.clone(),
                }),
            BuildBehavior::Terminate(termination) =>
                Ok(SettlementOutcome::Terminate(termination.clone())),
            BuildBehavior::Fail(message) => anyhow::bail!("{message}"),
        }
    }

    async fn accept_settlement(
        &self,
        _request: AcceptSettlement,
    ) -> anyhow::Result<AcceptOutcome> {
        match &*self.accept.lock().unwrap() {
            AcceptBehavior::Accept(receipt_data) => Ok(AcceptOutcome::Accept {
                receipt_data: receipt_data.clone(),
            }),
            AcceptBehavior::Terminate(termination) =>
                Ok(AcceptOutcome::Terminate(termination.clone())),
            AcceptBehavior::Fail(message) => anyhow::bail!("{message}"),
        }
    }

    async fn process_receipt(
        &self,
        _request: ProcessReceipt,
    ) -> anyhow::Result<()> {
        self.receipts_processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process_termination(
        &self,
        _request: ProcessTermination,
    ) -> anyhow::Result<()> {
        self.terminations_processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// --- Test identity layer --- //

pub(crate) fn dummy_certificate(subject: &IdentityKey) -> Certificate {
    Certificate {
        cert_type: "kyc".to_owned(),
        certifier: IdentityKey::from("k-certifier"),
        subject: subject.clone(),
        fields: [("name".to_owned(), "656e637279707465640a".to_owned())]
            .into_iter()
            .collect(),
        signature: "3045022100...".to_owned(),
        serial_number: "serial-1".to_owned(),
        revocation_outpoint: "deadbeef:0".to_owned(),
        keyring: [("verifier".to_owned(), "6b6579".to_owned())]
            .into_iter()
            .collect(),
    }
}

/// Responds with one dummy certificate and accepts whatever it receives,
/// unless told otherwise.
pub(crate) struct TestIdentityLayer {
    me: IdentityKey,
    pub(crate) assessment: Mutex<CertificateAssessment>,
}

impl TestIdentityLayer {
    pub(crate) fn new(me: &IdentityKey) -> Arc<Self> {
        Arc::new(Self {
            me: me.clone(),
            assessment: Mutex::new(CertificateAssessment::Acknowledge),
        })
    }
}

#[async_trait]
impl IdentityLayer for TestIdentityLayer {
    async fn determine_certificates_to_request(
        &self,
        _counterparty: &IdentityKey,
        _thread_id: &ThreadId,
    ) -> anyhow::Result<IdentityVerificationRequest> {
        Ok(IdentityVerificationRequest {
            certificate_types: [("kyc".to_owned(), vec!["name".to_owned()])]
                .into_iter()
                .collect(),
            certifiers: vec![IdentityKey::from("k-certifier")],
        })
    }

    async fn respond_to_request(
        &self,
        _counterparty: &IdentityKey,
        _thread_id: &ThreadId,
        _request: &IdentityVerificationRequest,
    ) -> anyhow::Result<IdentityResponseAction> {
        Ok(IdentityResponseAction::Respond(
            IdentityVerificationResponse {
                certificates: vec![dummy_certificate(&self.me)],
            },
        ))
    }

    async fn assess_received_certificate_sufficiency(
        &self,
        _counterparty: &IdentityKey,
        _response: &IdentityVerificationResponse,
        _thread_id: &ThreadId,
    ) -> anyhow::Result<CertificateAssessment> {
        Ok(self.assessment.lock().unwrap().clone())
    }
}

// --- Memory storage --- //

pub(crate) struct MemoryStorage {
    state: Mutex<Option<PersistedState>>,
    pub(crate) saves: AtomicUsize,
}

impl MemoryStorage {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            saves: AtomicUsize::new(0),
        })
    }

    pub(crate) fn preloaded(state: PersistedState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Some(state)),
            saves: AtomicUsize::new(0),
        })
    }

    pub(crate) fn current(&self) -> Option<PersistedState> {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn load(&self) -> anyhow::Result<Option<PersistedState>> {
        Ok(self.current())
    }

    async fn save(&self, state: PersistedState) -> anyhow::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = Some(state);
        Ok(())
    }
}

// --- Deterministic ids --- //

pub(crate) struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub(crate) fn new(prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.to_owned(),
            next: AtomicU64::new(1),
        })
    }
}

impl IdFactory for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}-{n}", self.prefix)
    }
}

// --- Peer harness --- //

pub(crate) struct Peer {
    pub(crate) manager: RemittanceManager,
    pub(crate) key: IdentityKey,
    pub(crate) comms: Arc<BusComms>,
    pub(crate) clock: Arc<ManualClock>,
}

impl Peer {
    /// Drains this peer's message box once, swallowing transport errors.
    pub(crate) async fn sync(&self) {
        self.manager.sync_threads(None).await.expect("sync failed");
    }
}

pub(crate) struct PeerBuilder {
    name: String,
    config: EngineConfig,
    modules: Vec<Arc<dyn RemittanceModule>>,
    identity_layer: Option<Arc<dyn IdentityLayer>>,
    storage: Option<Arc<MemoryStorage>>,
    wallet_key: bool,
}

impl PeerBuilder {
    pub(crate) fn new(name: &str) -> Self {
        // Tight intervals keep the polling waiters fast in tests.
        let mut config = EngineConfig::default();
        config.identity_timeout = Duration::from_secs(3);
        config.identity_poll_interval = Duration::from_millis(25);
        config.receipt_timeout = Duration::from_secs(3);
        config.receipt_poll_interval = Duration::from_millis(25);
        Self {
            name: name.to_owned(),
            config,
            modules: Vec::new(),
            identity_layer: None,
            storage: None,
            wallet_key: true,
        }
    }

    pub(crate) fn config(
        mut self,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        tweak(&mut self.config);
        self
    }

    pub(crate) fn module(mut self, module: Arc<TestModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub(crate) fn identity_layer(
        mut self,
        layer: Arc<TestIdentityLayer>,
    ) -> Self {
        self.identity_layer = Some(layer);
        self
    }

    pub(crate) fn storage(mut self, storage: Arc<MemoryStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub(crate) fn without_wallet_key(mut self) -> Self {
        self.wallet_key = false;
        self
    }

    pub(crate) async fn build(self, bus: &Arc<InMemoryBus>) -> Peer {
        self.try_build(bus).await.expect("Manager init failed")
    }

    pub(crate) async fn try_build(
        self,
        bus: &Arc<InMemoryBus>,
    ) -> Result<Peer, crate::error::Error> {
        let key = IdentityKey::from(format!("k-{}", self.name));
        let comms = Arc::new(BusComms {
            bus: bus.clone(),
            me: key.clone(),
            fail_sends: AtomicBool::new(false),
            live_enabled: AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock::new(TimestampMs::from(1_000u32)));
        let wallet = Arc::new(TestWallet {
            key: self.wallet_key.then(|| key.clone()),
        });

        let mut params = ManagerParams::new(comms.clone(), wallet);
        params.config = self.config;
        params.modules = self.modules;
        params.identity_layer =
            self.identity_layer.map(|l| l as Arc<dyn IdentityLayer>);
        params.storage = self.storage.map(|s| s as Arc<dyn StateStorage>);
        params.clock = clock.clone();
        params.id_factory = SequentialIds::new(&self.name);

        let manager = RemittanceManager::init(params).await?;
        Ok(Peer {
            manager,
            key,
            comms,
            clock,
        })
    }
}

/// Spawns a background task that keeps draining `peer`'s message box, for
/// scenarios where one side is blocked inside a waiter. Returns a guard
/// which stops the pump when dropped.
pub(crate) fn pump(peer: &Peer) -> PumpGuard {
    let manager = peer.manager.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                () = tokio::time::sleep(Duration::from_millis(10)) => {
                    let _ = manager.sync_threads(None).await;
                }
            }
        }
    });
    PumpGuard {
        _stop: stop_tx,
        _handle: handle,
    }
}

pub(crate) struct PumpGuard {
    _stop: mpsc::Sender<()>,
    _handle: tokio::task::JoinHandle<()>,
}
