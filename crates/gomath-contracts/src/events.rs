//! Activity log for one chat session, one JSON object per line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Something that happened during a chat session.
///
/// Serialized with a snake_case `type` tag next to the variant's fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        status: String,
    },
    ProblemRecognized {
        image_path: String,
        history_id: String,
        text: String,
    },
    RecognitionFailed {
        image_path: String,
        error: String,
    },
    ExplanationStored {
        task_id: String,
        history_id: String,
        steps: usize,
    },
    ExplanationFailed {
        error: String,
    },
    HistoryDeleted {
        history_id: String,
    },
    SessionEnded,
}

#[derive(Serialize)]
struct Record<'a> {
    session_id: &'a str,
    ts: String,
    #[serde(flatten)]
    event: &'a SessionEvent,
}

/// Append-only `events.jsonl` writer shared by everything in a session.
#[derive(Debug)]
pub struct SessionLog {
    session_id: String,
    file: Mutex<File>,
}

impl SessionLog {
    /// Opens `path` for appending, creating it and its parent directory.
    pub fn open(path: impl AsRef<Path>, session_id: impl Into<String>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            session_id: session_id.into(),
            file: Mutex::new(file),
        })
    }

    pub fn record(&self, event: &SessionEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&Record {
            session_id: &self.session_id,
            ts: now_utc_iso(),
            event,
        })?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::{SessionEvent, SessionLog};

    #[test]
    fn record_writes_tagged_line_with_ids() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("session").join("events.jsonl");
        let log = SessionLog::open(&path, "session-1")?;

        log.record(&SessionEvent::ExplanationStored {
            task_id: "t-1".to_string(),
            history_id: "h-1".to_string(),
            steps: 3,
        })?;
        log.record(&SessionEvent::SessionEnded)?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);

        let stored = &lines[0];
        assert_eq!(stored["type"], json!("explanation_stored"));
        assert_eq!(stored["session_id"], json!("session-1"));
        assert_eq!(stored["task_id"], json!("t-1"));
        assert_eq!(stored["history_id"], json!("h-1"));
        assert_eq!(stored["steps"], json!(3));
        DateTime::parse_from_rfc3339(stored["ts"].as_str().unwrap_or(""))?;

        let mut keys: Vec<&str> = lines[1]
            .as_object()
            .map(|object| object.keys().map(String::as_str).collect())
            .unwrap_or_default();
        keys.sort_unstable();
        assert_eq!(keys, vec!["session_id", "ts", "type"]);
        Ok(())
    }

    #[test]
    fn reopening_appends_instead_of_truncating() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        SessionLog::open(&path, "first")?.record(&SessionEvent::SessionEnded)?;
        SessionLog::open(&path, "second")?.record(&SessionEvent::SessionEnded)?;

        let sessions: Vec<String> = fs::read_to_string(&path)?
            .lines()
            .map(serde_json::from_str::<Value>)
            .map(|line| line.map(|line| line["session_id"].as_str().unwrap_or("").to_string()))
            .collect::<Result<_, _>>()?;
        assert_eq!(sessions, vec!["first", "second"]);
        Ok(())
    }

    #[test]
    fn concurrent_records_never_interleave_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = Arc::new(SessionLog::open(&path, "session-1")?);

        let handles: Vec<_> = (0..8)
            .map(|idx| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for n in 0..10 {
                        log.record(&SessionEvent::HistoryDeleted {
                            history_id: format!("{idx}-{n}"),
                        })?;
                    }
                    anyhow::Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("recording thread panicked"))??;
        }

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 80);
        for line in lines {
            let parsed: Value = serde_json::from_str(line)?;
            assert_eq!(parsed["type"], json!("history_deleted"));
        }
        Ok(())
    }
}
