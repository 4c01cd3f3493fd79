//! Gateway payload decoding
//!
//! Gateways publish either a single JSON object (one reading, or a wrapper
//! with a `readings`/`devices` array) or a bare JSON array of typed records.

use serde_json::{Map, Value};
use thiserror::Error;

/// Tag MAC aliases, highest priority first
pub const TAG_MAC_KEYS: &[&str] = &["tag_mac", "tag", "tagMac", "mac"];
pub const RSSI_KEYS: &[&str] = &["rssi", "RSSI"];
pub const GATEWAY_MAC_KEYS: &[&str] = &["gateway_mac", "gateway", "gw_mac", "device_mac"];
/// Wrapper keys whose array value holds the readings
const BATCH_KEYS: &[&str] = &["readings", "devices"];
/// Record `type` values that always denote a tag reading
const TAG_RECORD_TYPES: &[&str] = &["ibeacon", "beacon", "tag"];

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected JSON root: expected object or array")]
    UnexpectedRoot,
}

/// One tag reading
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub tag_mac: String,
    pub rssi: Option<i32>,
    /// Original record, kept as sample evidence
    pub raw: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPayload {
    /// Gateway MAC reported inside the payload, refining the topic id
    pub gateway_mac: Option<String>,
    pub detections: Vec<Detection>,
}

/// Decode a gateway payload into ordered detections
pub fn decode_payload(bytes: &[u8]) -> Result<DecodedPayload, PayloadError> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value {
        Value::Object(obj) => Ok(decode_object(obj)),
        Value::Array(records) => Ok(decode_records(records, None)),
        _ => Err(PayloadError::UnexpectedRoot),
    }
}

fn decode_object(mut obj: Map<String, Value>) -> DecodedPayload {
    let gateway_mac = first_string(&obj, GATEWAY_MAC_KEYS);

    for key in BATCH_KEYS {
        if let Some(Value::Array(records)) = obj.remove(*key) {
            return decode_records(records, gateway_mac);
        }
    }

    let mut out = DecodedPayload { gateway_mac, detections: Vec::new() };
    if let Some(tag_mac) = first_string(&obj, TAG_MAC_KEYS) {
        let rssi = first_rssi(&obj);
        out.detections.push(Detection { tag_mac, rssi, raw: Value::Object(obj) });
    }
    out
}

fn decode_records(records: Vec<Value>, gateway_mac: Option<String>) -> DecodedPayload {
    let mut out = DecodedPayload { gateway_mac, detections: Vec::with_capacity(records.len()) };

    for record in records {
        let Value::Object(obj) = record else { continue };
        let record_type = obj.get("type").and_then(Value::as_str).map(str::to_ascii_lowercase);

        if record_type.as_deref() == Some("gateway") {
            let mac = first_string(&obj, &["mac"]).or_else(|| first_string(&obj, GATEWAY_MAC_KEYS));
            if mac.is_some() {
                out.gateway_mac = mac;
            }
            continue;
        }

        let tag_mac = first_string(&obj, TAG_MAC_KEYS);
        let rssi = first_rssi(&obj);
        let is_tag_type = record_type.as_deref().is_some_and(|t| TAG_RECORD_TYPES.contains(&t));
        let looks_like_reading = tag_mac.is_some() && rssi.is_some();

        if !(is_tag_type || looks_like_reading) {
            continue;
        }
        let Some(tag_mac) = tag_mac else { continue };
        out.detections.push(Detection { tag_mac, rssi, raw: Value::Object(obj) });
    }
    out
}

/// First alias holding a non-empty string (or number, stringified)
fn first_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn first_rssi(obj: &Map<String, Value>) -> Option<i32> {
    let value = RSSI_KEYS.iter().find_map(|key| match obj.get(*key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    })?;
    i32::try_from(value).ok()
}
