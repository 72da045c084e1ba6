//! The typed, versioned wire envelope and its kind-typed payloads.
//!
//! Envelopes are the only thing the engine ever puts on (or takes off) the
//! message channel. The body is JSON; module-defined terms, artifacts, and
//! receipt data ride along as opaque [`serde_json::Value`]s which the engine
//! never introspects.
//!
//! Parsing is two-staged: [`Envelope::parse`] only validates the envelope
//! frame (version, id, kind, thread id). Whether the payload matches the
//! declared kind is the dispatcher's problem, via [`Envelope::payload_as`].

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::amount::Amount;
use crate::ids::{IdentityKey, ModuleId, OptionId, ThreadId};
use crate::time::TimestampMs;

/// The protocol version this engine speaks. Any other value fails parse.
pub const PROTOCOL_VERSION: u8 = 1;

// --- Envelope --- //

/// One step of the protocol: identity verification, invoice, settlement,
/// receipt, or termination.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Protocol version; always [`PROTOCOL_VERSION`].
    pub v: u8,
    /// Envelope id. Used only as an application-level idempotency hint;
    /// transport-level dedupe keys on the transport message id instead.
    pub id: String,
    pub kind: EnvelopeKind,
    pub thread_id: ThreadId,
    pub created_at: TimestampMs,
    /// The kind-typed payload, undecoded.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(
        id: impl Into<String>,
        kind: EnvelopeKind,
        thread_id: ThreadId,
        created_at: TimestampMs,
        payload: &impl Serialize,
    ) -> Self {
        let payload = serde_json::to_value(payload)
            .expect("Payload serialization always succeeds");
        Self {
            v: PROTOCOL_VERSION,
            id: id.into(),
            kind,
            thread_id,
            created_at,
            payload,
        }
    }

    /// Attempts to decode an opaque message body as an [`Envelope`].
    ///
    /// Returns [`None`] on decode failure, a non-object body, a version
    /// mismatch, or a missing/empty `id`, `kind`, or `threadId`. An
    /// unrecognized `kind` string *passes* parse (as
    /// [`EnvelopeKind::Unknown`]); so does a payload which doesn't match its
    /// kind. Both are rejected downstream by the dispatcher, which by then
    /// has a thread to record the error on.
    pub fn parse(body: &str) -> Option<Self> {
        let envelope = serde_json::from_str::<Self>(body).ok()?;
        if envelope.v != PROTOCOL_VERSION {
            return None;
        }
        if envelope.id.is_empty()
            || envelope.kind.as_str().is_empty()
            || envelope.thread_id.is_empty()
        {
            return None;
        }
        Some(envelope)
    }

    /// Produces the canonical body handed to the comms layer.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self)
            .expect("Envelope serialization always succeeds")
    }

    /// Decodes the payload as the given kind-typed payload struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.payload.clone())
            .context("Envelope payload did not match its declared kind")
    }
}

// --- EnvelopeKind --- //

/// The set of protocol steps, plus [`Unknown`] for forwards compatibility.
///
/// [`Unknown`]: EnvelopeKind::Unknown
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub enum EnvelopeKind {
    IdentityVerificationRequest,
    IdentityVerificationResponse,
    IdentityVerificationAcknowledgment,
    Invoice,
    Settlement,
    Receipt,
    Termination,
    /// A kind this version of the engine does not recognize. Carried as-is
    /// so the dispatcher can record a protocol error against the thread.
    Unknown(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::IdentityVerificationRequest => "identityVerificationRequest",
            Self::IdentityVerificationResponse =>
                "identityVerificationResponse",
            Self::IdentityVerificationAcknowledgment =>
                "identityVerificationAcknowledgment",
            Self::Invoice => "invoice",
            Self::Settlement => "settlement",
            Self::Receipt => "receipt",
            Self::Termination => "termination",
            Self::Unknown(other) => other,
        }
    }
}

impl Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "identityVerificationRequest" => Self::IdentityVerificationRequest,
            "identityVerificationResponse" =>
                Self::IdentityVerificationResponse,
            "identityVerificationAcknowledgment" =>
                Self::IdentityVerificationAcknowledgment,
            "invoice" => Self::Invoice,
            "settlement" => Self::Settlement,
            "receipt" => Self::Receipt,
            "termination" => Self::Termination,
            other => Self::Unknown(other.to_owned()),
        };
        Ok(kind)
    }
}

// --- Settlement payloads --- //

/// One line of an invoice. Free-form; the engine only carries it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
}

/// A request for payment, issued by the maker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub payee: IdentityKey,
    pub payer: IdentityKey,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub line_items: Vec<LineItem>,
    pub total: Amount,
    pub invoice_number: String,
    pub created_at: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<TimestampMs>,
    /// Module-defined settlement terms, keyed by the offering module.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<ModuleId, serde_json::Value>,
}

impl Invoice {
    /// Whether this invoice's expiry, if any, is strictly in the past.
    pub fn is_expired(&self, now: TimestampMs) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at.is_before(now),
            None => false,
        }
    }
}

/// The payer's settlement for an invoice (or an unsolicited one).
/// The `artifact` is module-defined and opaque to the engine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub thread_id: ThreadId,
    pub module_id: ModuleId,
    pub option_id: OptionId,
    /// The payer's identity key.
    pub sender: IdentityKey,
    pub created_at: TimestampMs,
    pub artifact: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The payee's acknowledgment that a settlement was accepted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub thread_id: ThreadId,
    pub module_id: ModuleId,
    pub option_id: OptionId,
    pub payee: IdentityKey,
    pub payer: IdentityKey,
    pub created_at: TimestampMs,
    pub receipt_data: serde_json::Value,
}

/// Ends a thread, in either direction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Termination {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Termination {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

// --- Identity payloads --- //

/// What the requester wants to see: certificate types (each with the field
/// names that must be revealed) and the certifier keys it will accept.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityVerificationRequest {
    /// Certificate type -> required field names.
    pub certificate_types: BTreeMap<String, Vec<String>>,
    /// Acceptable certifier identity keys.
    pub certifiers: Vec<IdentityKey>,
}

/// One certificate disclosed in an identity verification response. All
/// cryptographic material is opaque to the engine; the identity layer is the
/// only collaborator that interprets it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde(rename = "type")]
    pub cert_type: String,
    pub certifier: IdentityKey,
    pub subject: IdentityKey,
    /// Field name -> encrypted field value.
    pub fields: BTreeMap<String, String>,
    pub signature: String,
    pub serial_number: String,
    pub revocation_outpoint: String,
    /// Per-verifier key material for the disclosed fields.
    pub keyring: BTreeMap<String, String>,
}

/// The certificates disclosed in response to a request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityVerificationResponse {
    pub certificates: Vec<Certificate>,
}

/// The requester's acknowledgment that the response sufficed. Carries
/// nothing beyond the enclosing envelope's thread id.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IdentityVerificationAcknowledgment {}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use proptest::test_runner::Config;

    use super::*;
    use crate::test_utils::{arbitrary, roundtrip};

    fn any_known_kind() -> impl Strategy<Value = EnvelopeKind> {
        prop_oneof![
            Just(EnvelopeKind::IdentityVerificationRequest),
            Just(EnvelopeKind::IdentityVerificationResponse),
            Just(EnvelopeKind::IdentityVerificationAcknowledgment),
            Just(EnvelopeKind::Invoice),
            Just(EnvelopeKind::Settlement),
            Just(EnvelopeKind::Receipt),
            Just(EnvelopeKind::Termination),
        ]
    }

    fn any_envelope() -> impl Strategy<Value = Envelope> {
        (
            "[a-z0-9-]{1,12}",
            any_known_kind(),
            "[a-z0-9-]{1,12}",
            0u32..u32::MAX,
            arbitrary::json_value(),
        )
            .prop_map(|(id, kind, thread_id, created_at, payload)| Envelope {
                v: PROTOCOL_VERSION,
                id,
                kind,
                thread_id: ThreadId::from(thread_id),
                created_at: TimestampMs::from(created_at),
                payload,
            })
    }

    #[test]
    fn envelope_serde_roundtrip() {
        roundtrip::json_value_custom(any_envelope(), Config::with_cases(64));
    }

    #[test]
    fn envelope_body_roundtrip() {
        proptest!(Config::with_cases(64), |(envelope in any_envelope())| {
            let body = envelope.serialize();
            let parsed = Envelope::parse(&body).unwrap();
            prop_assert_eq!(envelope, parsed);
        });
    }

    #[test]
    fn kind_wire_strings() {
        let cases = [
            (
                EnvelopeKind::IdentityVerificationRequest,
                "identityVerificationRequest",
            ),
            (
                EnvelopeKind::IdentityVerificationResponse,
                "identityVerificationResponse",
            ),
            (
                EnvelopeKind::IdentityVerificationAcknowledgment,
                "identityVerificationAcknowledgment",
            ),
            (EnvelopeKind::Invoice, "invoice"),
            (EnvelopeKind::Settlement, "settlement"),
            (EnvelopeKind::Receipt, "receipt"),
            (EnvelopeKind::Termination, "termination"),
        ];
        for (kind, s) in cases {
            assert_eq!(kind.as_str(), s);
            assert_eq!(EnvelopeKind::from_str(s).unwrap(), kind);
        }
        assert_eq!(
            EnvelopeKind::from_str("escrow").unwrap(),
            EnvelopeKind::Unknown("escrow".to_owned()),
        );
    }

    #[test]
    fn parse_rejects_malformed_frames() {
        // Not JSON at all
        assert!(Envelope::parse("not json").is_none());
        // Not an object
        assert!(Envelope::parse("42").is_none());
        assert!(Envelope::parse("[1, 2]").is_none());
        // Wrong version
        assert!(Envelope::parse(
            r#"{"v":2,"id":"a","kind":"invoice","threadId":"t","createdAt":1}"#
        )
        .is_none());
        // Missing / empty frame fields
        assert!(Envelope::parse(
            r#"{"v":1,"kind":"invoice","threadId":"t","createdAt":1}"#
        )
        .is_none());
        assert!(Envelope::parse(
            r#"{"v":1,"id":"","kind":"invoice","threadId":"t","createdAt":1}"#
        )
        .is_none());
        assert!(Envelope::parse(
            r#"{"v":1,"id":"a","kind":"","threadId":"t","createdAt":1}"#
        )
        .is_none());
        assert!(Envelope::parse(
            r#"{"v":1,"id":"a","kind":"invoice","threadId":"","createdAt":1}"#
        )
        .is_none());
    }

    #[test]
    fn parse_passes_unknown_kind_and_odd_payloads() {
        // Unrecognized kinds and mismatched payload shapes are dispatcher
        // problems, not parse failures.
        let envelope = Envelope::parse(
            r#"{"v":1,"id":"a","kind":"escrow","threadId":"t","createdAt":1,"payload":[1,2,3]}"#,
        )
        .unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Unknown("escrow".to_owned()));
        assert!(envelope.payload_as::<Invoice>().is_err());

        // Missing payload parses as null.
        let envelope = Envelope::parse(
            r#"{"v":1,"id":"a","kind":"invoice","threadId":"t","createdAt":1}"#,
        )
        .unwrap();
        assert_eq!(envelope.payload, serde_json::Value::Null);
    }
}
