//! Operation history.
//!
//! Every scheduled operation is recorded twice: once when it is issued and
//! once when it completes. Nemesis operations complete as `info`; client
//! operations complete as `ok`, `fail`, or `info` when the outcome is unknown.
//! The history is written as JSON lines for an external checker.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::Result;
use super::operation::Action;

/// The type of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Invoke,
    Ok,
    Fail,
    Info,
}

/// A single entry in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Position in the history.
    pub index: u64,
    /// Milliseconds since the history was created.
    pub time_ms: u64,
    /// `nemesis` or `client-<n>`.
    pub process: String,
    pub kind: EntryKind,
    pub action: Action,
    #[serde(default)]
    pub payload: Value,
}

/// Append-only list of entries.
#[derive(Debug)]
pub struct History {
    started: Instant,
    entries: Vec<HistoryEntry>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        History {
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    /// Append an entry stamped with the current time. Returns its index.
    pub fn record(
        &mut self,
        process: impl Into<String>,
        kind: EntryKind,
        action: Action,
        payload: Value,
    ) -> u64 {
        let index = self.entries.len() as u64;
        self.entries.push(HistoryEntry {
            index,
            time_ms: self.started.elapsed().as_millis() as u64,
            process: process.into(),
            kind,
            action,
            payload,
        });
        index
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries recorded by one process, in order.
    pub fn by_process<'a>(&'a self, process: &'a str) -> impl Iterator<Item = &'a HistoryEntry> {
        self.entries.iter().filter(move |e| e.process == process)
    }

    /// Write one JSON object per line.
    pub fn write_jsonl(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for entry in &self.entries {
            serde_json::to_writer(&mut out, entry)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Thread-safe history shared by the nemesis and client threads.
#[derive(Debug, Clone, Default)]
pub struct SharedHistory {
    inner: Arc<Mutex<History>>,
}

impl SharedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(
        &self,
        process: impl Into<String>,
        kind: EntryKind,
        action: Action,
        payload: Value,
    ) -> u64 {
        self.lock().record(process, kind, action, payload)
    }

    /// Copy of every entry recorded so far.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn write_jsonl(&self, path: &Path) -> Result<()> {
        self.lock().write_jsonl(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_recording() {
        let mut history = History::new();

        assert_eq!(history.record("nemesis", EntryKind::Invoke, Action::Decommission, Value::Null), 0);
        assert_eq!(
            history.record("nemesis", EntryKind::Info, Action::Decommission, json!({"outcome": "noop"})),
            1
        );
        history.record("client-0", EntryKind::Invoke, Action::Read, Value::Null);

        assert_eq!(history.len(), 3);
        assert_eq!(history.by_process("nemesis").count(), 2);
        assert_eq!(history.entries()[2].process, "client-0");
        assert!(history.entries()[0].time_ms <= history.entries()[2].time_ms);
    }

    #[test]
    fn test_shared_history_across_threads() {
        let history = SharedHistory::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let history = history.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        history.record(format!("client-{}", i), EntryKind::Invoke, Action::Write, json!(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = history.snapshot();
        assert_eq!(entries.len(), 40);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, i as u64);
        }
    }

    #[test]
    fn test_write_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let history = SharedHistory::new();
        history.record("client-1", EntryKind::Invoke, Action::Cas, json!([1, 2]));
        history.record("client-1", EntryKind::Fail, Action::Cas, json!([1, 2]));
        history.write_jsonl(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: HistoryEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.kind, EntryKind::Fail);
        assert_eq!(second.action, Action::Cas);
        assert_eq!(second.payload, json!([1, 2]));
        assert!(lines[0].contains("\"kind\":\"invoke\""));
    }
}
