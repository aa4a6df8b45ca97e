use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::borrow::Borrow;

/// Case-insensitive market-data symbol, normalised to uppercase at
/// construction so every downstream key lookup is consistent regardless of
/// how the symbol arrived (ingested frame, config file, API call).
///
/// ### Notes
/// The original casing is not retained — spec.md §9 "Case-insensitive
/// symbol keying" only requires preserving original casing on records where
/// it is already stored verbatim (e.g. a raw provider frame), not on this
/// canonical key type.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display)]
#[serde(transparent)]
pub struct Symbol(SmolStr);

impl Symbol {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(SmolStr::new(raw.as_ref().to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Symbol::new(value)
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        self.0.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalises_case() {
        assert_eq!(Symbol::from("aapl"), Symbol::from("AAPL"));
        assert_eq!(Symbol::from("Msft").as_str(), "MSFT");
    }
}
