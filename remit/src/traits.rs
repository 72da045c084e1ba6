//! Collaborator traits.
//!
//! The engine drives the protocol; everything with real-world side effects
//! lives behind one of these seams. Wire transports implement
//! [`CommsLayer`], settlement mechanics implement [`RemittanceModule`],
//! certificate policy implements [`IdentityLayer`], key custody implements
//! [`Wallet`], and durable storage implements [`StateStorage`].

use async_trait::async_trait;
use common::envelope::{
    Invoice, IdentityVerificationRequest, IdentityVerificationResponse,
    Settlement, Termination,
};
use common::ids::{IdentityKey, ModuleId, ThreadId};
use common::persist::PersistedState;
use tokio::sync::mpsc;

// --- Comms layer --- //

/// One message pulled from (or pushed by) the message channel.
#[derive(Clone, Debug)]
pub struct PeerMessage {
    /// Transport-level message id; the engine's dedupe key.
    pub message_id: String,
    pub sender: IdentityKey,
    pub recipient: IdentityKey,
    pub message_box: String,
    /// The opaque body; hopefully a serialized envelope.
    pub body: String,
}

/// A store-and-forward (and optionally live-streaming) message channel.
///
/// Implementations are assumed thread-safe. The engine assumes FIFO ordering
/// only within a single delivery; dedupe and state-machine guards handle
/// everything else.
#[async_trait]
pub trait CommsLayer: Send + Sync + 'static {
    /// Sends a message into the recipient's message box, returning the
    /// transport message id.
    async fn send_message(
        &self,
        recipient: &IdentityKey,
        message_box: &str,
        body: &str,
        host_override: Option<&str>,
    ) -> anyhow::Result<String>;

    /// Whether this transport can push messages to connected recipients in
    /// real time. Gated on before any [`send_live_message`] /
    /// [`subscribe_live_messages`] attempt.
    ///
    /// [`send_live_message`]: CommsLayer::send_live_message
    /// [`subscribe_live_messages`]: CommsLayer::subscribe_live_messages
    fn supports_live_messages(&self) -> bool {
        false
    }

    /// Sends a message over the live transport. The engine falls back to
    /// [`send_message`] when this fails.
    ///
    /// [`send_message`]: CommsLayer::send_message
    async fn send_live_message(
        &self,
        recipient: &IdentityKey,
        message_box: &str,
        body: &str,
        host_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let _ = (recipient, message_box, body, host_override);
        anyhow::bail!("This comms layer does not support live messages")
    }

    /// Lists the pending (unacknowledged) messages in our message box.
    async fn list_messages(
        &self,
        message_box: &str,
        host_override: Option<&str>,
    ) -> anyhow::Result<Vec<PeerMessage>>;

    /// Acknowledges messages so the transport stops redelivering them.
    async fn acknowledge_messages(
        &self,
        message_ids: &[String],
    ) -> anyhow::Result<()>;

    /// Subscribes to live pushes for our message box. Each received
    /// [`PeerMessage`] runs through the same dispatcher as listed ones.
    async fn subscribe_live_messages(
        &self,
        message_box: &str,
        host_override: Option<&str>,
    ) -> anyhow::Result<mpsc::Receiver<PeerMessage>> {
        let _ = (message_box, host_override);
        anyhow::bail!("This comms layer does not support live messages")
    }
}

// --- Identity layer --- //

/// The responder's answer to an identity verification request.
#[derive(Clone, Debug)]
pub enum IdentityResponseAction {
    Respond(IdentityVerificationResponse),
    Terminate(Termination),
}

/// The requester's verdict on a received response.
#[derive(Clone, Debug)]
pub enum CertificateAssessment {
    Acknowledge,
    Terminate(Termination),
}

/// Decides which certificates to request and whether received certificates
/// suffice. What makes a certificate sufficient is entirely this layer's
/// business; the engine only routes its decisions.
#[async_trait]
pub trait IdentityLayer: Send + Sync + 'static {
    async fn determine_certificates_to_request(
        &self,
        counterparty: &IdentityKey,
        thread_id: &ThreadId,
    ) -> anyhow::Result<IdentityVerificationRequest>;

    async fn respond_to_request(
        &self,
        counterparty: &IdentityKey,
        thread_id: &ThreadId,
        request: &IdentityVerificationRequest,
    ) -> anyhow::Result<IdentityResponseAction>;

    async fn assess_received_certificate_sufficiency(
        &self,
        counterparty: &IdentityKey,
        response: &IdentityVerificationResponse,
        thread_id: &ThreadId,
    ) -> anyhow::Result<CertificateAssessment>;
}

// --- Remittance modules --- //

/// Inputs to [`RemittanceModule::build_settlement`].
#[derive(Clone, Debug)]
pub struct BuildSettlement {
    pub thread_id: ThreadId,
    /// Absent for unsolicited settlements.
    pub invoice: Option<Invoice>,
    /// The module-defined option terms being settled against.
    pub option: serde_json::Value,
    pub note: Option<String>,
}

/// Inputs to [`RemittanceModule::accept_settlement`].
#[derive(Clone, Debug)]
pub struct AcceptSettlement {
    pub thread_id: ThreadId,
    pub invoice: Option<Invoice>,
    pub settlement: Settlement,
    /// The payer.
    pub sender: IdentityKey,
}

/// Inputs to [`RemittanceModule::process_receipt`].
#[derive(Clone, Debug)]
pub struct ProcessReceipt {
    pub thread_id: ThreadId,
    pub invoice: Option<Invoice>,
    pub receipt_data: serde_json::Value,
    /// The payee who issued the receipt.
    pub sender: IdentityKey,
}

/// Inputs to [`RemittanceModule::process_termination`].
#[derive(Clone, Debug)]
pub struct ProcessTermination {
    pub thread_id: ThreadId,
    pub invoice: Option<Invoice>,
    pub settlement: Option<Settlement>,
    pub termination: Termination,
    pub sender: IdentityKey,
}

/// The payer-side outcome of building a settlement.
#[derive(Clone, Debug)]
pub enum SettlementOutcome {
    Settle { artifact: serde_json::Value },
    Terminate(Termination),
}

/// The payee-side outcome of accepting a settlement.
#[derive(Clone, Debug)]
pub enum AcceptOutcome {
    Accept {
        receipt_data: Option<serde_json::Value>,
    },
    Terminate(Termination),
}

/// A pluggable settlement system. Its payment mechanics (transaction
/// construction, signatures, broadcast) are opaque to the engine; the engine
/// only carries the module's option terms, artifacts, and receipt data.
#[async_trait]
pub trait RemittanceModule: Send + Sync + 'static {
    fn id(&self) -> ModuleId;

    fn name(&self) -> &str;

    /// Whether this module accepts settlements for threads with no invoice.
    fn allow_unsolicited_settlements(&self) -> bool {
        false
    }

    /// The terms to offer on an invoice. `Ok(None)` means this module
    /// declares no option for the invoice.
    async fn create_option(
        &self,
        thread_id: &ThreadId,
        invoice: &Invoice,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let _ = (thread_id, invoice);
        Ok(None)
    }

    /// Builds the settlement artifact on the payer side.
    async fn build_settlement(
        &self,
        request: BuildSettlement,
    ) -> anyhow::Result<SettlementOutcome>;

    /// Validates (and applies) an incoming settlement on the payee side.
    async fn accept_settlement(
        &self,
        request: AcceptSettlement,
    ) -> anyhow::Result<AcceptOutcome>;

    /// Payer-side hook invoked when a receipt arrives.
    async fn process_receipt(
        &self,
        request: ProcessReceipt,
    ) -> anyhow::Result<()> {
        let _ = request;
        Ok(())
    }

    /// Hook invoked when a termination arrives for a settled thread.
    async fn process_termination(
        &self,
        request: ProcessTermination,
    ) -> anyhow::Result<()> {
        let _ = request;
        Ok(())
    }
}

// --- Wallet --- //

/// The ambient wallet. Key derivation and transaction building happen in
/// module land; the engine only ever asks for its own identity key.
#[async_trait]
pub trait Wallet: Send + Sync + 'static {
    /// Our long-lived identity public key, if the wallet has one.
    async fn identity_public_key(&self) -> anyhow::Result<Option<IdentityKey>>;
}

// --- State storage --- //

/// The embedder-supplied persistence callbacks. `load` runs once during
/// initialization; `save` runs after every successful state-changing
/// operation and receives an isolated snapshot.
#[async_trait]
pub trait StateStorage: Send + Sync + 'static {
    async fn load(&self) -> anyhow::Result<Option<PersistedState>>;

    async fn save(&self, state: PersistedState) -> anyhow::Result<()>;
}

// --- Id factory --- //

/// Mints thread and envelope ids. Injectable for test determinism.
pub trait IdFactory: Send + Sync + 'static {
    fn next_id(&self) -> String;
}

/// The default [`IdFactory`], minting random v4 UUIDs.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidFactory;

impl IdFactory for UuidFactory {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
