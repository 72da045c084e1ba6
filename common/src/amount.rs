//! Monetary amounts carried through the protocol.
//!
//! An [`Amount`] is a decimal string plus the unit it is denominated in. The
//! engine treats amounts as opaque: it never performs arithmetic on them and
//! never converts between units. Construction merely validates that the value
//! parses as a decimal, so malformed strings are rejected at the edges.
//!
//! ### Parsing and displaying [`Amount`]s
//!
//! The canonical human-readable form is `"<value> <namespace>:<code>"`:
//!
//! ```
//! # use std::str::FromStr;
//! # use common::amount::Amount;
//! let amount = Amount::from_str("1000 bsv:sat").unwrap();
//! assert_eq!(amount.value(), "1000");
//! assert_eq!(amount.to_string(), "1000 bsv:sat");
//! ```

use std::fmt::{self, Display};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Errors that can occur when attempting to construct an [`Amount`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Amount value is not a valid decimal string")]
    InvalidValue,
    #[error("Amount string must look like \"<value> <namespace>:<code>\"")]
    InvalidForm,
    #[error("Currency unit namespace and code must be non-empty")]
    EmptyUnit,
}

/// The unit an [`Amount`] is denominated in, e.g. `bsv:sat` or `fiat:usd`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CurrencyUnit {
    /// The unit family, e.g. `"bsv"` or `"fiat"`.
    pub namespace: String,
    /// The unit name within its namespace, e.g. `"sat"` or `"usd"`.
    pub code: String,
    /// The number of decimal places a display layer may assume. Optional;
    /// the engine never uses it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
}

impl CurrencyUnit {
    pub fn new(
        namespace: impl Into<String>,
        code: impl Into<String>,
    ) -> Result<Self, Error> {
        let namespace = namespace.into();
        let code = code.into();
        if namespace.is_empty() || code.is_empty() {
            return Err(Error::EmptyUnit);
        }
        Ok(Self {
            namespace,
            code,
            decimals: None,
        })
    }
}

impl Display for CurrencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.code)
    }
}

/// A monetary amount: a validated decimal string plus its [`CurrencyUnit`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct Amount {
    value: String,
    unit: CurrencyUnit,
}

impl Amount {
    /// Construct an [`Amount`], validating that `value` parses as a decimal.
    pub fn new(
        value: impl Into<String>,
        unit: CurrencyUnit,
    ) -> Result<Self, Error> {
        let value = value.into();
        Decimal::from_str(&value).map_err(|_| Error::InvalidValue)?;
        Ok(Self { value, unit })
    }

    /// The decimal string, exactly as constructed.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn unit(&self) -> &CurrencyUnit {
        &self.unit
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Parses the `"<value> <namespace>:<code>"` form.
impl FromStr for Amount {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, unit) = s.split_once(' ').ok_or(Error::InvalidForm)?;
        let (namespace, code) = unit.split_once(':').ok_or(Error::InvalidForm)?;
        Self::new(value, CurrencyUnit::new(namespace, code)?)
    }
}

/// Enforces that the deserialized value string parses as a decimal.
impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawAmount {
            value: String,
            unit: CurrencyUnit,
        }
        let raw = RawAmount::deserialize(deserializer)?;
        Amount::new(raw.value, raw.unit).map_err(serde::de::Error::custom)
    }
}
