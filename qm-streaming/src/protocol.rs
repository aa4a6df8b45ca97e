//! The framed JSON wire protocol consumed from the streaming provider
//! (spec.md §6). Frames arrive as a JSON array of objects discriminated by
//! an `ev` field; unknown fields are ignored, and unknown `ev` values are
//! dropped after a debug log.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound control frame (spec.md §6: auth / subscribe / unsubscribe).
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub action: &'static str,
    pub params: String,
}

impl OutboundFrame {
    pub fn auth(api_key: &str) -> Self {
        Self {
            action: "auth",
            params: api_key.to_string(),
        }
    }

    pub fn subscribe(channels: &str) -> Self {
        Self {
            action: "subscribe",
            params: channels.to_string(),
        }
    }

    pub fn unsubscribe(channels: &str) -> Self {
        Self {
            action: "unsubscribe",
            params: channels.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Raw inbound element, parsed loosely so a single malformed element does
/// not poison the whole frame (spec.md §7 "parse errors on single frames
/// log a truncated preview and continue").
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub ev: String,
    #[serde(flatten)]
    pub fields: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStatus {
    pub status: String,
    #[allow(dead_code)]
    pub message: Option<String>,
}

/// Status values recognised during the connect handshake (spec.md §6).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatusValue {
    Connected,
    AuthSuccess,
    AuthFailed,
    Success,
    Other,
}

impl From<&str> for StatusValue {
    fn from(value: &str) -> Self {
        match value {
            "connected" => StatusValue::Connected,
            "auth_success" => StatusValue::AuthSuccess,
            "auth_failed" => StatusValue::AuthFailed,
            "success" => StatusValue::Success,
            _ => StatusValue::Other,
        }
    }
}

/// Raw trade element (spec.md §6 `T`).
#[derive(Debug, Clone, Deserialize)]
pub struct RawTrade {
    pub sym: String,
    pub p: Decimal,
    pub s: u64,
    pub t: i64,
    #[serde(default)]
    pub i: Option<String>,
    #[serde(default)]
    pub x: Option<u32>,
    #[serde(default)]
    pub c: Vec<u32>,
}

/// Raw quote element (spec.md §6 `Q`).
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuote {
    pub sym: String,
    pub bp: Decimal,
    pub bs: u64,
    pub ap: Decimal,
    #[serde(rename = "as")]
    pub ask_size: u64,
    pub t: i64,
    #[serde(default)]
    pub x: Option<u32>,
}

/// Raw aggregate element (spec.md §6 `A`/`AM`).
#[derive(Debug, Clone, Deserialize)]
pub struct RawAggregate {
    pub sym: String,
    pub o: Decimal,
    pub h: Decimal,
    pub l: Decimal,
    pub c: Decimal,
    pub v: u64,
    #[serde(default)]
    pub vw: Option<Decimal>,
    pub s: i64,
    #[serde(default)]
    pub e: Option<i64>,
    #[serde(default)]
    pub n: Option<u64>,
}

/// Closed table mapping Polygon exchange codes to names (spec.md §4.L).
/// Unknown codes fall back to `EX_<code>`.
pub fn exchange_name(code: u32) -> String {
    match code {
        1 => "NYSE",
        2 => "AMEX",
        3 => "ARCA",
        4 => "NASDAQ",
        5 => "NASDAQ_BX",
        6 => "NASDAQ_PSX",
        7 => "BATS_Y",
        8 => "BATS",
        9 => "IEX",
        10 => "EDGX",
        11 => "EDGA",
        12 => "CHX",
        13 => "NSX",
        14 => "FINRA_ADF",
        15 => "CBOE",
        16 => "MEMX",
        17 => "MIAX",
        19 => "LTSE",
        _ => return format!("EX_{code}"),
    }
    .to_string()
}

/// Trade condition codes that indicate the resting side was the seller
/// (spec.md §4.L closed table); all others map to `Unknown`.
const SELLER_INITIATED_CONDITION_CODES: [u32; 5] = [29, 30, 31, 32, 33];

pub fn aggressor_from_conditions(conditions: &[u32]) -> qm_quality::types::Aggressor {
    if conditions
        .iter()
        .any(|c| SELLER_INITIATED_CONDITION_CODES.contains(c))
    {
        qm_quality::types::Aggressor::Sell
    } else {
        qm_quality::types::Aggressor::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_name_known_codes() {
        assert_eq!(exchange_name(1), "NYSE");
        assert_eq!(exchange_name(9), "IEX");
        assert_eq!(exchange_name(19), "LTSE");
    }

    #[test]
    fn test_exchange_name_unknown_code_falls_back() {
        assert_eq!(exchange_name(255), "EX_255");
    }

    #[test]
    fn test_aggressor_from_conditions() {
        assert_eq!(
            aggressor_from_conditions(&[29]),
            qm_quality::types::Aggressor::Sell
        );
        assert_eq!(
            aggressor_from_conditions(&[1, 2]),
            qm_quality::types::Aggressor::Unknown
        );
        assert_eq!(
            aggressor_from_conditions(&[]),
            qm_quality::types::Aggressor::Unknown
        );
    }

    #[test]
    fn test_status_value_parsing() {
        assert_eq!(StatusValue::from("auth_failed"), StatusValue::AuthFailed);
        assert_eq!(StatusValue::from("weird"), StatusValue::Other);
    }

    #[test]
    fn test_outbound_frame_serializes() {
        let frame = OutboundFrame::subscribe("T.AAPL,Q.AAPL");
        assert_eq!(
            frame.to_json(),
            r#"{"action":"subscribe","params":"T.AAPL,Q.AAPL"}"#
        );
    }
}
