//! Line-based result protocol spoken by model executables.
//!
//! A model process reports to the host through its stdout/stderr. Three line
//! shapes are recognised, tested in this order:
//!
//! 1. `…RunResult[<id>][<base64 json>]` – the final result of call `<id>`.
//! 2. `…Result[<id>][<anything>]` – a liveness beacon for call `<id>`.
//! 3. `AigcPanelRunResult '<json>'` – legacy single-line form using single
//!    quotes instead of double quotes.
//!
//! Everything else is log noise.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

/// Prefix of the legacy single-line result form.
pub const LEGACY_PREFIX: &str = "AigcPanelRunResult";

/// Key reported for liveness beacons in the map view of a marker.
pub const ALIVE_KEY: &str = "_alive";

/// A recognised protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    /// The call finished. A payload that failed to decode is reported as
    /// `{"error": <message>}` so the caller stops waiting either way.
    Final(Map<String, Value>),
    /// The process is still working on the call.
    Alive,
}

impl Marker {
    pub fn is_final(&self) -> bool {
        matches!(self, Marker::Final(_))
    }

    /// Map view of the marker: the payload, or `{"_alive": true}`.
    pub fn into_map(self) -> Map<String, Value> {
        match self {
            Marker::Final(map) => map,
            Marker::Alive => {
                let mut map = Map::new();
                map.insert(ALIVE_KEY.to_owned(), Value::Bool(true));
                map
            }
        }
    }
}

/// Recognise a protocol line for the call identified by `task_id`.
///
/// Returns `None` for noise and for markers addressed to other calls.
pub fn extract(task_id: &str, line: &str) -> Option<Marker> {
    if let Some(payload) = bracketed(line, &format!("RunResult[{task_id}][")) {
        return Some(Marker::Final(decode_payload(payload)));
    }
    if bracketed(line, &format!("Result[{task_id}][")).is_some() {
        return Some(Marker::Alive);
    }
    legacy(line).map(Marker::Final)
}

/// Text between `open` and the next `]`, if both are present.
fn bracketed<'a>(line: &'a str, open: &str) -> Option<&'a str> {
    let start = line.find(open)? + open.len();
    let len = line[start..].find(']')?;
    Some(&line[start..start + len])
}

fn decode_payload(encoded: &str) -> Map<String, Value> {
    let bytes = match STANDARD.decode(encoded.trim()) {
        Ok(b) => b,
        Err(e) => return error_map(format!("failed to decode base64 result: {e}")),
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => map,
        Ok(other) => error_map(format!("result payload is not an object: {other}")),
        Err(e) => error_map(format!("failed to parse JSON result: {e}")),
    }
}

fn legacy(line: &str) -> Option<Map<String, Value>> {
    let rest = line.trim_start().strip_prefix(LEGACY_PREFIX)?;
    // `RunResult[` lines share the prefix and were handled above.
    let body = rest.trim();
    if !body.starts_with(['\'', '{']) {
        return None;
    }
    let body = body.strip_prefix('\'').unwrap_or(body);
    let body = body.strip_suffix('\'').unwrap_or(body);
    match serde_json::from_str::<Value>(&body.replace('\'', "\"")) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn error_map(message: String) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("error".to_owned(), Value::String(message));
    map
}
