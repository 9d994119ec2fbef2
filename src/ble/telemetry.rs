//! Decoding for the telemetry notifications the landslide station streams
//! over its GATT characteristic. Payloads are base64-transported UTF-8 text:
//! `key:value` float pairs, JSON objects as a fallback, or the literal
//! burst marker `END`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, warn};
use serde_json::Value;

const END_MARKER: &str = "END";

/// Canonical field vocabulary after alias resolution. Unrecognized keys are
/// preserved under `Other` so new firmware fields flow through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKey {
    Elevation,
    Distance,
    Latitude,
    Longitude,
    Other(String),
}

impl FieldKey {
    pub fn canonical_name(&self) -> &str {
        match self {
            FieldKey::Elevation => "elevation",
            FieldKey::Distance => "distance",
            FieldKey::Latitude => "lat",
            FieldKey::Longitude => "lon",
            FieldKey::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryFrame {
    /// One or more sensor fields to fold into the live reading.
    Fields(Vec<(FieldKey, f64)>),
    /// End-of-burst marker; recognized but carries no data.
    EndOfBurst,
}

/// Maps a raw telemetry key to its canonical field. Returns `None` for keys
/// the peripheral is not authoritative for: `azimuth` always comes from the
/// phone compass, never from the station.
fn classify_key(key: &str) -> Option<FieldKey> {
    match key {
        "elevation" | "altitude" | "alt" | "angle" => Some(FieldKey::Elevation),
        "distance" | "slopeDistance" | "dist" | "range" => Some(FieldKey::Distance),
        "lat" => Some(FieldKey::Latitude),
        "lon" => Some(FieldKey::Longitude),
        "azimuth" => None,
        other => Some(FieldKey::Other(other.to_string())),
    }
}

/// Decodes one notification payload. Malformed payloads are logged and
/// dropped (`None`); the monitoring session never aborts on bad input.
pub fn decode(payload: &[u8]) -> Option<TelemetryFrame> {
    let text = match decode_text(payload) {
        Some(text) => text,
        None => {
            warn!("telemetry payload is not decodable text ({} bytes)", payload.len());
            return None;
        }
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == END_MARKER {
        return Some(TelemetryFrame::EndOfBurst);
    }

    if let Some(frame) = parse_key_value(trimmed) {
        return Some(frame);
    }
    if let Some(frame) = parse_json_object(trimmed) {
        return Some(frame);
    }

    warn!("unrecognized telemetry payload: {trimmed:?}");
    None
}

/// The station firmware sends raw UTF-8, but transports that base64-wrap
/// characteristic values exist too. Base64 is tried first; the alphabets
/// cannot collide because every real frame contains `:` or `{`.
fn decode_text(payload: &[u8]) -> Option<String> {
    if let Ok(decoded) = BASE64.decode(payload) {
        if let Ok(text) = String::from_utf8(decoded) {
            return Some(text);
        }
    }
    String::from_utf8(payload.to_vec()).ok()
}

fn parse_key_value(text: &str) -> Option<TelemetryFrame> {
    let (key, raw_value) = text.split_once(':')?;
    let value: f64 = raw_value.trim().parse().ok()?;
    match classify_key(key.trim()) {
        Some(field) => Some(TelemetryFrame::Fields(vec![(field, value)])),
        None => {
            debug!("discarding peripheral azimuth value {value}");
            Some(TelemetryFrame::Fields(Vec::new()))
        }
    }
}

fn parse_json_object(text: &str) -> Option<TelemetryFrame> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    let object = parsed.as_object()?;

    let mut fields = Vec::with_capacity(object.len());
    for (key, value) in object {
        let Some(number) = value.as_f64() else {
            warn!("skipping non-numeric telemetry field {key:?}");
            continue;
        };
        match classify_key(key) {
            Some(field) => fields.push((field, number)),
            None => debug!("discarding peripheral azimuth value {number}"),
        }
    }

    Some(TelemetryFrame::Fields(fields))
}
