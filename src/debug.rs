use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// JSONL diagnostics sink. One object per line, plus a summary of counters
/// when an export finishes.
#[derive(Clone)]
pub(crate) struct DebugLogger {
    inner: Arc<Mutex<DebugState>>,
}

struct DebugState {
    writer: BufWriter<File>,
    counters: HashMap<String, u64>,
}

impl DebugLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(DebugState {
                writer: BufWriter::new(file),
                counters: HashMap::new(),
            })),
        })
    }

    pub fn log_event(&self, event_type: &str, fields: Value) {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(event_type.to_string()));
        if let Value::Object(extra) = fields {
            object.extend(extra);
        }
        if let Ok(mut state) = self.inner.lock() {
            let _ = writeln!(state.writer, "{}", Value::Object(object));
        }
    }

    pub fn increment(&self, key: &str, amount: u64) {
        if let Ok(mut state) = self.inner.lock() {
            let entry = state.counters.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }

    pub fn emit_summary(&self, context: &str) {
        if let Ok(mut state) = self.inner.lock() {
            let mut counters: Vec<(String, u64)> = state.counters.drain().collect();
            counters.sort_by(|a, b| a.0.cmp(&b.0));
            let counts: Map<String, Value> = counters
                .into_iter()
                .map(|(key, value)| (key, Value::from(value)))
                .collect();
            let json = serde_json::json!({
                "type": "export.summary",
                "context": context,
                "counts": counts,
            });
            let _ = writeln!(state.writer, "{json}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_log_path(tag: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "fieldexport_{tag}_{}_{}.jsonl",
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn events_and_summary_are_one_json_object_per_line() {
        let path = temp_log_path("debug");
        let logger = DebugLogger::new(&path).expect("create log");
        logger.log_event(
            "export.page_break",
            serde_json::json!({"reason": "force \"page\" break", "to_page": 2}),
        );
        logger.increment("export.page_break", 1);
        logger.increment("export.page_break", 2);
        logger.emit_summary("unit");
        logger.flush();

        let text = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "export.page_break");
        assert_eq!(lines[0]["reason"], "force \"page\" break");
        assert_eq!(lines[1]["counts"]["export.page_break"], 3);
        let _ = std::fs::remove_file(path);
    }
}
