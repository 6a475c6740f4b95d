//! Latest list of live table URLs reported by the tracking agent.
//!
//! The agent periodically posts the full list it is watching together with
//! sync metadata. The document is replaced wholesale on every post and kept
//! on disk so the list survives restarts.

use crate::clock::{Clock, EpochMillis};
use crate::persist::{read_json, write_json_atomic, StateError};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_META_SOURCE: &str = "remote_agent";

/// Sync metadata attached to the URL list.
///
/// Everything except `ts` is reported by the agent and kept as sent, so an
/// unexpected type on one field never costs the rest of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TablesMeta {
    /// Time the list was last replaced
    #[serde(deserialize_with = "lenient_millis")]
    pub ts: EpochMillis,
    pub final_count: Value,
    /// Duration of the agent's last scan
    pub last_ms: Value,
    pub last_error: Value,
    pub last_error_code: Value,
    pub last_run_id: Value,
    pub source: Value,
    /// Agent fields this service does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TablesMeta {
    fn default() -> Self {
        Self {
            ts: 0,
            final_count: Value::from(0),
            last_ms: Value::from(0),
            last_error: Value::Null,
            last_error_code: Value::Null,
            last_run_id: Value::Null,
            source: Value::Null,
            extra: Map::new(),
        }
    }
}

impl TablesMeta {
    /// The agent's last error, unless it reported an empty one.
    pub fn reported_error(&self) -> Option<&Value> {
        Some(&self.last_error).filter(|v| is_truthy(v))
    }
}

fn lenient_millis<'de, D>(deserializer: D) -> Result<EpochMillis, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveTablesDoc {
    pub urls: Vec<String>,
    pub meta: TablesMeta,
    pub refreshing: bool,
}

/// File-backed holder of the active table list.
pub struct ActiveTables {
    path: PathBuf,
    doc: Mutex<ActiveTablesDoc>,
    clock: Arc<dyn Clock>,
}

impl ActiveTables {
    /// Load the document at `path`, writing defaults when it is missing or
    /// unreadable.
    pub fn load(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, StateError> {
        let path = path.into();

        let doc = match read_json::<Value>(&path) {
            Some(Value::Object(raw)) => ActiveTablesDoc {
                urls: sanitize_urls(raw.get("urls")),
                meta: parse_meta(raw.get("meta")),
                refreshing: false,
            },
            _ => {
                let doc = ActiveTablesDoc::default();
                write_json_atomic(&path, &doc)?;
                doc
            }
        };

        info!(path = %path.display(), tables = doc.urls.len(), "Loaded active tables");

        Ok(Self {
            path,
            doc: Mutex::new(doc),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> ActiveTablesDoc {
        ActiveTablesDoc {
            refreshing: false,
            ..self.doc.lock().clone()
        }
    }

    /// Replace the list and metadata from an agent post and persist it.
    pub fn set_from_incoming(&self, payload: &Value) -> Result<ActiveTablesDoc, StateError> {
        let urls = sanitize_urls(payload.get("urls"));
        let mut meta = parse_meta(payload.get("meta"));
        meta.ts = self.clock.now_ms();
        if !is_truthy(&meta.source) {
            meta.source = Value::from(DEFAULT_META_SOURCE);
        }

        let mut doc = self.doc.lock();
        *doc = ActiveTablesDoc {
            urls,
            meta,
            refreshing: false,
        };
        write_json_atomic(&self.path, &*doc)?;

        info!(tables = doc.urls.len(), source = %doc.meta.source, "Active tables updated");
        Ok(doc.clone())
    }
}

/// Keep trimmed, non-empty string URLs, first occurrence wins.
pub fn sanitize_urls(value: Option<&Value>) -> Vec<String> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_string)
        .collect()
}

/// Overlay an incoming meta object on the defaults.
fn parse_meta(value: Option<&Value>) -> TablesMeta {
    match value {
        Some(meta @ Value::Object(_)) => {
            serde_json::from_value(meta.clone()).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring malformed active table metadata");
                TablesMeta::default()
            })
        }
        _ => TablesMeta::default(),
    }
}
