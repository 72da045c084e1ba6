//! The typed errors surfaced by user-initiated engine calls.
//!
//! Inbound dispatch never surfaces these: errors raised while applying a
//! peer message are written into the thread (`last_error`, the `error` flag,
//! the `errored` state) and the message is left unacknowledged instead.

/// Everything that can go wrong in a user-initiated engine call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The engine or a collaborator is misconfigured: no identity layer
    /// where one is required, an unsupported persisted-state version, an
    /// unknown option or module id, an invoice without options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation does not apply to the thread in its current shape:
    /// unknown thread, wrong role, already invoiced/settled, errored.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The invoice's expiry is in the past.
    #[error("Invoice expired: {0}")]
    Expired(String),

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A collaborator call (comms layer, wallet, identity layer, state
    /// storage) failed.
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// A protocol violation: malformed envelope, invalid state transition,
    /// unknown envelope kind.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A wait was attempted (or resolved) against a thread that has reached
    /// `terminated` or `errored`.
    #[error("Thread reached a terminal state: {0}")]
    Terminal(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub(crate) fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub(crate) fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub(crate) fn transport(
        context: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }
}
