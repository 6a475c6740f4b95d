//! Normalization of inbound agent payloads.
//!
//! Agents post loosely shaped JSON. This module turns one payload into a
//! [`SanitizedFrame`] with a deterministic dedup key, or rejects it when the
//! nested `frame.data` object is missing. It never touches queue state.

use crate::clock::EpochMillis;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Keys shorter than this are too weak to deduplicate on.
pub const MIN_FRAME_KEY_LEN: usize = 3;

const DEFAULT_SOURCE: &str = "local-be";
const KEY_SEPARATOR: &str = "|";

/// Reasons a payload cannot be admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanitizeError {
    #[error("Invalid frame payload (frame key {frame_key:?})")]
    InvalidFrame { frame_key: String },
}

impl SanitizeError {
    /// Wire reason reported back to the pushing agent.
    pub fn reason(&self) -> &'static str {
        match self {
            SanitizeError::InvalidFrame { .. } => "invalid_frame",
        }
    }

    pub fn frame_key(&self) -> &str {
        match self {
            SanitizeError::InvalidFrame { frame_key } => frame_key,
        }
    }
}

/// Canonical form of a pushed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedFrame {
    /// Producer tag, `local-be` unless the agent says otherwise
    pub source: String,
    pub source_url: String,
    pub table_url: String,
    pub table_id: String,
    /// Agent-reported receive time, or admission time when absent
    pub received_at: EpochMillis,
    /// Dedup key
    pub frame_key: String,
    /// `idTable|idDeck|idRound` unless supplied
    pub round_key: String,
    pub id_table: String,
    pub id_deck: Option<i64>,
    pub id_round: Option<i64>,
    /// Number of log entries carried by the frame
    pub logs_len: u64,
    /// The nested `frame` object as sent
    pub frame: Value,
    /// The whole inbound payload as sent
    pub raw_payload: Value,
}

/// Sanitize one inbound payload.
///
/// `now` is only used as the fallback `receivedAt`.
pub fn sanitize_payload(input: &Value, now: EpochMillis) -> Result<SanitizedFrame, SanitizeError> {
    let empty = Map::new();
    let payload = input.as_object().unwrap_or(&empty);

    let frame = payload.get("frame").filter(|v| v.is_object());
    let frame_data = frame
        .and_then(|f| f.get("data"))
        .and_then(Value::as_object);

    let id_table = match frame_data {
        Some(data) => loose_string(data.get("idTable")),
        None => loose_string(payload.get("idTable")),
    };
    let id_deck = frame_data.and_then(|data| key_int(data.get("idDeck")));
    let id_round = frame_data.and_then(|data| key_int(data.get("idRound")));

    let logs = frame_data
        .and_then(|data| data.get("logs"))
        .and_then(Value::as_array);
    let logs_len = match logs {
        Some(logs) => logs.len() as u64,
        None => loose_int(payload.get("logsLen"))
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0),
    };
    let last_log = match logs {
        Some(logs) => logs.last().and_then(Value::as_object),
        None => payload.get("lastLog").and_then(Value::as_object),
    };

    let deck_part = id_deck.map(|n| n.to_string()).unwrap_or_default();
    let round_part = id_round.map(|n| n.to_string()).unwrap_or_default();

    let explicit_key = loose_string(payload.get("frameKey")).trim().to_string();
    let frame_key = if explicit_key.is_empty() {
        let log_field = |name: &str| loose_string(last_log.and_then(|log| log.get(name)));
        [
            id_table.clone(),
            deck_part.clone(),
            round_part.clone(),
            logs_len.to_string(),
            log_field("m"),
            log_field("s"),
            log_field("d"),
        ]
        .join(KEY_SEPARATOR)
    } else {
        explicit_key
    };

    if frame_data.is_none() || frame_key.chars().count() < MIN_FRAME_KEY_LEN {
        return Err(SanitizeError::InvalidFrame { frame_key });
    }

    let round_key = match loose_string(payload.get("roundKey")) {
        key if key.is_empty() => [id_table.as_str(), &deck_part, &round_part].join(KEY_SEPARATOR),
        key => key,
    };

    let url = loose_string(payload.get("url"));
    let or_url = |field: &str| match loose_string(payload.get(field)) {
        value if value.is_empty() => url.clone(),
        value => value,
    };

    let source = match loose_string(payload.get("source")) {
        s if s.is_empty() => DEFAULT_SOURCE.to_string(),
        s => s,
    };

    let received_at = loose_int(payload.get("receivedAt"))
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(now);

    Ok(SanitizedFrame {
        source,
        source_url: or_url("sourceUrl"),
        table_url: or_url("tableUrl"),
        table_id: loose_string(payload.get("tableId")),
        received_at,
        frame_key,
        round_key,
        id_table,
        id_deck,
        id_round,
        logs_len,
        frame: frame.cloned().unwrap_or(Value::Null),
        raw_payload: input.clone(),
    })
}

/// Stringify a loosely typed field. Absent and falsy values become empty.
fn loose_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => String::new(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Read an integer from a JSON number or numeric string.
fn loose_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

/// Numeric coercion for the key segments. A present but empty value (`null`,
/// `false`, blank string) reads as zero and `true` as one; only an absent
/// field or a non-numeric value leaves the segment empty.
fn key_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Null | Value::Bool(false) => Some(0),
        Value::Bool(true) => Some(1),
        Value::String(s) if s.trim().is_empty() => Some(0),
        other => loose_int(Some(other)),
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then(|| f as i64)
}
