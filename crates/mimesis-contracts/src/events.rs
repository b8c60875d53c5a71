use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only `events.jsonl` log for one analysis session.
///
/// Every line is a compact JSON object with default fields `type`,
/// `session_id`, and `ts`; the caller payload is merged last and may
/// override any of them.
#[derive(Debug, Clone)]
pub struct SessionLog {
    shared: Arc<Mutex<LogSink>>,
}

#[derive(Debug)]
struct LogSink {
    path: PathBuf,
    session_id: String,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(LogSink {
                path: path.into(),
                session_id: session_id.into(),
            })),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.shared
            .lock()
            .map(|sink| sink.path.clone())
            .unwrap_or_default()
    }

    pub fn session_id(&self) -> String {
        self.shared
            .lock()
            .map(|sink| sink.session_id.clone())
            .unwrap_or_default()
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let sink = self
            .shared
            .lock()
            .map_err(|_| anyhow::anyhow!("session log lock poisoned"))?;

        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(sink.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = sink.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

pub fn read_event_types(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
