//! Runtime configuration. Everything arrives through the constructor; the
//! engine reads no environment and keeps no global state.

use std::time::Duration;

use common::ids::OptionId;
use common::thread::ThreadRole;

/// The default comms-layer message box the engine sends to and drains.
pub const DEFAULT_MESSAGE_BOX: &str = "remittance_inbox";

/// When (if ever) a given role initiates identity verification.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum IdentityRequestPhase {
    #[default]
    Never,
    /// The maker verifies the taker before issuing an invoice, or the
    /// taker verifies the maker before paying one.
    BeforeInvoicing,
    BeforeSettlement,
}

impl IdentityRequestPhase {
    pub fn is_never(self) -> bool {
        matches!(self, Self::Never)
    }
}

/// Per-role identity verification policy.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IdentityOptions {
    /// When we request identity verification in threads where we are maker.
    pub maker_request_identity: IdentityRequestPhase,
    /// When we request identity verification in threads where we are taker.
    pub taker_request_identity: IdentityRequestPhase,
}

impl IdentityOptions {
    pub fn phase_for(&self, role: ThreadRole) -> IdentityRequestPhase {
        match role {
            ThreadRole::Maker => self.maker_request_identity,
            ThreadRole::Taker => self.taker_request_identity,
        }
    }
}

/// All runtime knobs for a [`RemittanceManager`].
///
/// [`RemittanceManager`]: crate::manager::RemittanceManager
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// The comms-layer message box name.
    pub message_box: String,
    pub identity_options: IdentityOptions,
    /// Whether settlements are answered with receipts at all. When false,
    /// the payer's `pay` returns as soon as the settlement is sent.
    pub receipt_provided: bool,
    /// Whether the payee automatically sends the receipt envelope after a
    /// module accepts a settlement.
    pub auto_issue_receipt: bool,
    /// Invoice lifetime in whole seconds. Negative means no expiry.
    pub invoice_expiry_seconds: i64,
    /// Max wait for an identity acknowledgment.
    pub identity_timeout: Duration,
    /// Poll interval while waiting for an identity acknowledgment.
    pub identity_poll_interval: Duration,
    /// Max wait in `pay` for a receipt or termination.
    pub receipt_timeout: Duration,
    /// Poll interval while waiting for a receipt or termination.
    pub receipt_poll_interval: Duration,
    /// The option `pay` falls back to when the caller passes none.
    /// Carried in persisted snapshots.
    pub default_payment_option_id: Option<OptionId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            message_box: DEFAULT_MESSAGE_BOX.to_owned(),
            identity_options: IdentityOptions::default(),
            receipt_provided: true,
            auto_issue_receipt: true,
            invoice_expiry_seconds: -1,
            identity_timeout: Duration::from_secs(30),
            identity_poll_interval: Duration::from_millis(500),
            receipt_timeout: Duration::from_secs(30),
            receipt_poll_interval: Duration::from_millis(500),
            default_payment_option_id: None,
        }
    }
}
