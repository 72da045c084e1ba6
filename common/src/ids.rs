//! Opaque identifier newtypes.
//!
//! All of these are carried as opaque strings on the wire; the engine never
//! inspects their contents. Newtypes keep them from being confused for one
//! another at API boundaries.

use std::fmt::{self, Display};
use std::str::FromStr;

#[cfg(any(test, feature = "test-utils"))]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};

/// An opaque string identifying a peer's long-lived public identity key.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[serde(transparent)]
pub struct IdentityKey(String);

/// An opaque string identifying one commercial exchange. Globally unique.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[serde(transparent)]
pub struct ThreadId(String);

/// An opaque string naming a settlement module.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[serde(transparent)]
pub struct ModuleId(String);

/// An opaque string naming a settlement option offered on an invoice.
/// Usually, but not necessarily, equal to the offering module's [`ModuleId`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "test-utils"), derive(Arbitrary))]
#[serde(transparent)]
pub struct OptionId(String);

macro_rules! impl_string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(inner: impl Into<String>) -> Self {
                Self(inner.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

impl_string_id!(IdentityKey);
impl_string_id!(ThreadId);
impl_string_id!(ModuleId);
impl_string_id!(OptionId);

impl From<&OptionId> for ModuleId {
    /// Options are resolved to modules by their raw string name.
    fn from(option_id: &OptionId) -> Self {
        Self(option_id.0.clone())
    }
}

impl From<&ModuleId> for OptionId {
    fn from(module_id: &ModuleId) -> Self {
        Self(module_id.0.clone())
    }
}
