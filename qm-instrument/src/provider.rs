use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};

/// Index into a provider table.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Constructor,
)]
pub struct ProviderIndex(pub usize);

impl ProviderIndex {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ProviderIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProviderIndex({})", self.0)
    }
}

/// Short identifier for an external market-data provider (e.g. `polygon`).
///
/// ### Notes
/// A provider may offer both a live streaming feed and a distinct historical
/// backfill API; these are represented as separate variants since their
/// rate limits and failure modes differ.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename = "provider", rename_all = "snake_case")]
pub enum Provider {
    Other,
    Mock,
    Polygon,
    PolygonDelayed,
    PolygonHistorical,
    Tiingo,
    AlphaVantage,
}

impl Provider {
    /// Return the `&str` representation of this [`Provider`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Other => "other",
            Provider::Mock => "mock",
            Provider::Polygon => "polygon",
            Provider::PolygonDelayed => "polygon_delayed",
            Provider::PolygonHistorical => "polygon_historical",
            Provider::Tiingo => "tiingo",
            Provider::AlphaVantage => "alpha_vantage",
        }
    }
}

/// Feed kind used to resolve a streaming endpoint (spec §6 wire protocol).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    Stocks,
    Options,
    Forex,
    Crypto,
}

impl Feed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Stocks => "stocks",
            Feed::Options => "options",
            Feed::Forex => "forex",
            Feed::Crypto => "crypto",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_de_provider() {
        assert_eq!(
            serde_json::from_str::<Provider>(r#""polygon""#).unwrap(),
            Provider::Polygon
        );
    }

    #[test]
    fn test_feed_as_str() {
        assert_eq!(Feed::Crypto.as_str(), "crypto");
        assert_eq!(Feed::Stocks.as_str(), "stocks");
    }
}
