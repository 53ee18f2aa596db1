use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Line-oriented JSON trace of breaking passes. One object per line; enabled
/// through the engine builder and shared across breaker invocations.
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

    pub fn log_pass(
        &self,
        flow_id: Option<usize>,
        kind: &str,
        parts: usize,
        nodes_created: u64,
        nodes_pruned: u64,
        fallback: bool,
    ) {
        let flow = flow_id
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string());
        let json = format!(
            "{{\"type\":\"break.pass\",\"flow\":{},\"kind\":\"{}\",\"parts\":{},\"nodes_created\":{},\"nodes_pruned\":{},\"fallback\":{}}}",
            flow,
            json_escape(kind),
            parts,
            nodes_created,
            nodes_pruned,
            fallback
        );
        self.write_line(&json);
    }

    pub fn log_event(&self, flow_id: Option<usize>, kind: &str, detail: &str) {
        let flow = flow_id
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string());
        let json = format!(
            "{{\"type\":\"break.event\",\"flow\":{},\"kind\":\"{}\",\"detail\":\"{}\"}}",
            flow,
            json_escape(kind),
            json_escape(detail)
        );
        self.write_line(&json);
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
            let counts_json = if counters.is_empty() {
                "{}".to_string()
            } else {
                let mut out = String::from("{");
                for (idx, (key, value)) in counters.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    out.push_str(&format!("\"{}\":{}", json_escape(key), value));
                }
                out.push('}');
                out
            };
            let json = format!(
                "{{\"type\":\"break.summary\",\"context\":\"{}\",\"counts\":{}}}",
                json_escape(context),
                counts_json
            );
            let _ = writeln!(state.writer, "{json}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }

    fn write_line(&self, json: &str) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = writeln!(state.writer, "{json}");
        }
    }
}

pub(crate) fn json_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_log_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "flowbreak_{tag}_{}_{}.jsonl",
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn logger_writes_pass_records_and_summary() {
        let path = temp_log_path("debug");
        let logger = DebugLogger::new(&path).expect("create log");
        logger.log_pass(Some(0), "normal", 3, 12, 4, false);
        logger.log_event(None, "redo", "last page");
        logger.increment("nodes", 12);
        logger.emit_summary("flow 0");
        logger.flush();
        let contents = std::fs::read_to_string(&path).expect("read log");
        assert!(contents.contains("\"type\":\"break.pass\""));
        assert!(contents.contains("\"kind\":\"redo\""));
        assert!(contents.contains("\"nodes\":12"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn json_escape_handles_quotes_and_control_chars() {
        assert_eq!(json_escape("a\"b"), "a\\\"b");
        assert_eq!(json_escape("a\nb"), "a\\nb");
        assert_eq!(json_escape("\u{1}"), "\\u0001");
    }
}
