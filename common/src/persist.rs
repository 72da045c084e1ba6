//! The versioned snapshot handed to (and taken from) the embedder's
//! persistence callbacks. The engine treats the storage itself as opaque;
//! only the record layout here is its concern.

use serde::{Deserialize, Serialize};

use crate::ids::OptionId;
use crate::thread::Thread;

/// The persisted-state layout version this engine reads and writes.
/// Loading any other version fails fast.
pub const STATE_VERSION: u8 = 1;

/// Everything the engine needs to resume after a restart.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub v: u8,
    pub threads: Vec<Thread>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_payment_option_id: Option<OptionId>,
}

impl PersistedState {
    pub fn new(
        threads: Vec<Thread>,
        default_payment_option_id: Option<OptionId>,
    ) -> Self {
        Self {
            v: STATE_VERSION,
            threads,
            default_payment_option_id,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_field_serializes() {
        let state = PersistedState::new(Vec::new(), None);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["v"], 1);
        assert!(json.get("defaultPaymentOptionId").is_none());
    }
}
