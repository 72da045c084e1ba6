//! The per-exchange thread record and its state machine.
//!
//! A [`Thread`] is the engine's full record of one commercial exchange with
//! one counterparty: every envelope sent or received, every state taken, and
//! the settlement artifacts accumulated along the way.
//!
//! States advance monotonically along the exchange ladder. A requested
//! transition that would move *backwards* (e.g. an identity exchange running
//! on a thread that is already invoiced) is a no-op rather than an error;
//! a transition the table forbids outright is a protocol error which the
//! engine routes into [`ThreadState::Errored`].

use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::envelope::{
    Certificate, Envelope, Invoice, Receipt, Settlement, Termination,
};
use crate::ids::{IdentityKey, ThreadId};
use crate::time::TimestampMs;

// --- Roles --- //

/// Which side of the exchange we are on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum ThreadRole {
    /// The party who issues the invoice; typically the payee.
    Maker,
    /// The party who pays the invoice; typically the payer.
    Taker,
}

impl ThreadRole {
    pub fn opposite(self) -> Self {
        match self {
            Self::Maker => Self::Taker,
            Self::Taker => Self::Maker,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Maker => "maker",
            Self::Taker => "taker",
        }
    }
}

impl Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ThreadRole {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "maker" => Ok(Self::Maker),
            "taker" => Ok(Self::Taker),
            _ => Err(anyhow::anyhow!("Unknown thread role: '{s}'")),
        }
    }
}

// --- States --- //

/// Where a thread is along the exchange ladder.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum ThreadState {
    New,
    IdentityRequested,
    IdentityResponded,
    IdentityAcknowledged,
    Invoiced,
    Settled,
    Receipted,
    Terminated,
    Errored,
}

impl ThreadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::IdentityRequested => "identityRequested",
            Self::IdentityResponded => "identityResponded",
            Self::IdentityAcknowledged => "identityAcknowledged",
            Self::Invoiced => "invoiced",
            Self::Settled => "settled",
            Self::Receipted => "receipted",
            Self::Terminated => "terminated",
            Self::Errored => "errored",
        }
    }

    /// Terminal states freeze the thread; no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Errored)
    }

    fn is_identity_step(self) -> bool {
        matches!(
            self,
            Self::IdentityRequested
                | Self::IdentityResponded
                | Self::IdentityAcknowledged
        )
    }

    /// Position along the (non-terminal) exchange ladder. Transitions that
    /// would not advance this rank are skipped rather than rejected.
    fn progress_rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::IdentityRequested => 1,
            Self::IdentityResponded => 2,
            Self::IdentityAcknowledged => 3,
            Self::Invoiced => 4,
            Self::Settled => 5,
            Self::Receipted => 6,
            // Terminal states are reachable from anywhere and never ranked.
            Self::Terminated | Self::Errored => u8::MAX,
        }
    }

    /// The allowed-transition table.
    pub fn can_transition_to(self, to: ThreadState) -> bool {
        use ThreadState::*;
        match self {
            New => matches!(
                to,
                IdentityRequested | IdentityResponded | Invoiced | Settled
                    | Receipted | Terminated | Errored
            ),
            IdentityRequested => matches!(
                to,
                IdentityResponded | IdentityAcknowledged | Terminated | Errored
            ),
            IdentityResponded => matches!(
                to,
                IdentityAcknowledged | Invoiced | Terminated | Errored
            ),
            IdentityAcknowledged =>
                matches!(to, Invoiced | Settled | Terminated | Errored),
            Invoiced => matches!(to, Settled | Terminated | Errored),
            Settled => matches!(to, Receipted | Terminated | Errored),
            Receipted => matches!(to, Terminated | Errored),
            Terminated | Errored => false,
        }
    }
}

impl Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ThreadState {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "new" => Ok(Self::New),
            "identityRequested" => Ok(Self::IdentityRequested),
            "identityResponded" => Ok(Self::IdentityResponded),
            "identityAcknowledged" => Ok(Self::IdentityAcknowledged),
            "invoiced" => Ok(Self::Invoiced),
            "settled" => Ok(Self::Settled),
            "receipted" => Ok(Self::Receipted),
            "terminated" => Ok(Self::Terminated),
            "errored" => Ok(Self::Errored),
            _ => Err(anyhow::anyhow!("Unknown thread state: '{s}'")),
        }
    }
}

/// A transition the table in [`ThreadState::can_transition_to`] forbids.
#[derive(Copy, Clone, Debug, thiserror::Error)]
#[error("Invalid thread state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ThreadState,
    pub to: ThreadState,
}

// --- Audit log entries --- //

/// One entry in a thread's state audit log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateLogEntry {
    pub at: TimestampMs,
    pub from: ThreadState,
    pub to: ThreadState,
    pub reason: String,
}

/// Which way an envelope travelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "in" => Ok(Self::Inbound),
            "out" => Ok(Self::Outbound),
            _ => Err(anyhow::anyhow!("Unknown direction: '{s}'")),
        }
    }
}

/// One entry in a thread's protocol log: every envelope sent or received.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolLogEntry {
    pub direction: Direction,
    pub envelope: Envelope,
    pub transport_message_id: String,
}

// --- Identity sub-record --- //

/// Bookkeeping for the identity verification exchange on one thread.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityExchange {
    /// Certificates we disclosed (responder side).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sent_certificates: Vec<Certificate>,
    /// Certificates the counterparty disclosed (requester side).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub received_certificates: Vec<Certificate>,
    pub request_sent: bool,
    pub response_sent: bool,
    pub acknowledgment_sent: bool,
    pub acknowledgment_received: bool,
}

// --- Flags --- //

/// Milestone flags, each mirroring the presence of the corresponding field.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadFlags {
    pub has_identified: bool,
    pub has_invoiced: bool,
    pub has_paid: bool,
    pub has_receipted: bool,
    pub error: bool,
}

// --- Thread --- //

/// The engine's full record of one commercial exchange.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub thread_id: ThreadId,
    pub counterparty: IdentityKey,
    pub my_role: ThreadRole,
    pub their_role: ThreadRole,
    /// Current state; always equal to [`Thread::derived_state`] at rest.
    /// Persisted snapshots from older engines may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ThreadState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_log: Vec<StateLogEntry>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    /// Transport message ids already applied; the dedupe key.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub processed_message_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocol_log: Vec<ProtocolLogEntry>,
    #[serde(default)]
    pub identity: IdentityExchange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<Invoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Settlement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    #[serde(default)]
    pub flags: ThreadFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Thread {
    pub fn new(
        thread_id: ThreadId,
        counterparty: IdentityKey,
        my_role: ThreadRole,
        now: TimestampMs,
    ) -> Self {
        Self {
            thread_id,
            counterparty,
            my_role,
            their_role: my_role.opposite(),
            state: Some(ThreadState::New),
            state_log: Vec::new(),
            created_at: now,
            updated_at: now,
            processed_message_ids: BTreeSet::new(),
            protocol_log: Vec::new(),
            identity: IdentityExchange::default(),
            invoice: None,
            settlement: None,
            receipt: None,
            termination: None,
            flags: ThreadFlags::default(),
            last_error: None,
        }
    }

    /// The current state. Threads restored from snapshots which predate the
    /// `state` field fall back to the derived state.
    pub fn state(&self) -> ThreadState {
        self.state.unwrap_or_else(|| self.derived_state())
    }

    /// Recomputes the state implied by the thread's contents, in monotone
    /// order: termination dominates, then the error flag, then the furthest
    /// settlement artifact, then identity progress.
    pub fn derived_state(&self) -> ThreadState {
        if self.termination.is_some() {
            ThreadState::Terminated
        } else if self.flags.error {
            ThreadState::Errored
        } else if self.receipt.is_some() {
            ThreadState::Receipted
        } else if self.settlement.is_some() {
            ThreadState::Settled
        } else if self.invoice.is_some() {
            ThreadState::Invoiced
        } else if self.identity.acknowledgment_sent
            || self.identity.acknowledgment_received
        {
            ThreadState::IdentityAcknowledged
        } else if self.identity.response_sent
            || !self.identity.received_certificates.is_empty()
        {
            ThreadState::IdentityResponded
        } else if self.identity.request_sent {
            ThreadState::IdentityRequested
        } else {
            ThreadState::New
        }
    }

    /// Attempts to advance the thread to `to`, appending to the state log.
    ///
    /// Returns `Ok(true)` if the state changed, `Ok(false)` if the request
    /// was a no-op (already there, or a non-terminal step the thread has
    /// already progressed past), and [`InvalidTransition`] if the table
    /// forbids the move.
    pub fn transition_to(
        &mut self,
        to: ThreadState,
        reason: &str,
        now: TimestampMs,
    ) -> Result<bool, InvalidTransition> {
        let from = self.state();
        if from == to {
            return Ok(false);
        }
        if from.is_terminal() {
            return Err(InvalidTransition { from, to });
        }
        // Identity steps running on a thread that already progressed past
        // them (identity exchange after invoicing) leave the state alone.
        // Anything else moving backwards falls through to the table, which
        // rejects it.
        if to.is_identity_step() && to.progress_rank() <= from.progress_rank()
        {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        self.state_log.push(StateLogEntry {
            at: now,
            from,
            to,
            reason: reason.to_owned(),
        });
        self.state = Some(to);
        Ok(true)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn assert_invariants(&self) {
        assert_eq!(self.state(), self.derived_state());
        assert_eq!(self.their_role, self.my_role.opposite());
        assert_eq!(self.flags.has_invoiced, self.invoice.is_some());
        assert_eq!(self.flags.has_paid, self.settlement.is_some());
        assert_eq!(self.flags.has_receipted, self.receipt.is_some());
        assert_eq!(
            self.flags.has_identified,
            self.identity.acknowledgment_sent
                || self.identity.acknowledgment_received,
        );
        if self.flags.error {
            assert!(self.last_error.is_some());
        }
    }

    /// Debug-only invariant checks, run before committing a mutated thread.
    pub fn debug_assert_invariants(&self) {
        if cfg!(debug_assertions) {
            self.assert_invariants();
        }
    }
}
