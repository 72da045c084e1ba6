//! The `common` crate contains the wire and domain types shared between the
//! remittance engine and its embedders: identifiers, amounts, timestamps,
//! protocol envelopes, and the per-exchange thread record.

/// Amounts and currency units.
pub mod amount;
/// Protocol envelopes and kind-typed payloads.
pub mod envelope;
/// Opaque identifier newtypes.
pub mod ids;
/// Persisted engine state.
pub mod persist;
/// Proptest roundtrip helpers.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
/// Exchange threads and their state machine.
pub mod thread;
/// Unix-millisecond timestamps and the injectable clock.
pub mod time;
