//! Submission history: memory first, mirrored to a single JSON file.
//!
//! The on-disk layout is one pretty-printed array of items:
//!
//! ```text
//! [
//!   { "id": "…", "type": "upload", "path": "a1b2.jpg", "at": 1760000000000 },
//!   { "id": "…", "type": "text", "text": "x^2 = 4", "at": 1760000005000,
//!     "result": { "steps": [...] }, "task_id": "…" }
//! ]
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::steps::Explanation;

/// Upper bound on retained items; the oldest by `at` are dropped first.
pub const MAX_ITEMS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("read history {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("decode history {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Upload,
    Text,
}

impl HistoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    #[serde(default, deserialize_with = "crate::steps::null_as_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Explanation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl HistoryItem {
    pub fn upload(path: impl Into<String>, at: i64) -> Self {
        Self {
            id: String::new(),
            kind: HistoryKind::Upload,
            path: Some(path.into()),
            text: None,
            at,
            result: None,
            task_id: None,
        }
    }

    pub fn text(text: impl Into<String>, at: i64) -> Self {
        Self {
            id: String::new(),
            kind: HistoryKind::Text,
            path: None,
            text: Some(text.into()),
            at,
            result: None,
            task_id: None,
        }
    }

    /// The path for uploads, the problem text for typed submissions.
    pub fn subject(&self) -> &str {
        match self.kind {
            HistoryKind::Upload => self.path.as_deref().unwrap_or_default(),
            HistoryKind::Text => self.text.as_deref().unwrap_or_default(),
        }
    }
}

/// Bounded history log shared between request handlers.
///
/// Every mutation rewrites the backing file while the write lock is held, so
/// snapshots reach disk in the same order the mutations happened. A failed
/// write is logged and the in-memory state stays authoritative.
#[derive(Debug)]
pub struct HistoryLog {
    items: RwLock<Vec<HistoryItem>>,
    path: Option<PathBuf>,
}

impl HistoryLog {
    /// Opens the log backed by `path`. A missing or empty file is an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let items = load_items(&path)?;
        Ok(Self {
            items: RwLock::new(items),
            path: Some(path),
        })
    }

    /// A log that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            path: None,
        }
    }

    /// Appends `item`, minting an id when it has none, and returns the id.
    pub fn add(&self, mut item: HistoryItem) -> String {
        if item.id.is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        let id = item.id.clone();

        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.push(item);
        if items.len() > MAX_ITEMS {
            sort_newest_first(&mut items);
            items.truncate(MAX_ITEMS);
        }
        self.persist(&items, "add");
        id
    }

    /// Snapshot of the log, newest first.
    pub fn list(&self) -> Vec<HistoryItem> {
        let mut out = self
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        sort_newest_first(&mut out);
        out.truncate(MAX_ITEMS);
        out
    }

    pub fn get(&self, id: &str) -> Option<HistoryItem> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    /// Attaches a result (and the task it was cached under) to an existing item.
    pub fn update_result(&self, id: &str, result: &Explanation, task_id: &str) -> bool {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        item.result = Some(result.clone());
        item.task_id = (!task_id.is_empty()).then(|| task_id.to_string());
        self.persist(&items, "update_result");
        true
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let Some(idx) = items.iter().position(|item| item.id == id) else {
            return false;
        };
        items.remove(idx);
        self.persist(&items, "delete");
        true
    }

    /// Most recent upload recorded for `path`; the first one wins on equal timestamps.
    pub fn find_latest_upload_by_path(&self, path: &str) -> Option<HistoryItem> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Option<&HistoryItem> = None;
        for item in items.iter() {
            if item.kind != HistoryKind::Upload || item.path.as_deref() != Some(path) {
                continue;
            }
            if found.map_or(true, |best| item.at > best.at) {
                found = Some(item);
            }
        }
        found.cloned()
    }

    pub fn len(&self) -> usize {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, items: &[HistoryItem], op: &str) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(err) = write_items(path, items) {
            log::warn!("history save after {op} failed ({}): {err:#}", path.display());
        }
    }
}

fn sort_newest_first(items: &mut [HistoryItem]) {
    // Stable: items sharing a timestamp keep their stored relative order.
    items.sort_by(|a, b| b.at.cmp(&a.at));
}

fn load_items(path: &Path) -> Result<Vec<HistoryItem>, HistoryError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(HistoryError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let items: Option<Vec<HistoryItem>> =
        serde_json::from_str(&raw).map_err(|source| HistoryError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    let mut items = items.unwrap_or_default();
    // Records without an id would be unreachable through get/delete.
    for item in items.iter_mut().filter(|item| item.id.is_empty()) {
        item.id = Uuid::new_v4().to_string();
    }
    Ok(items)
}

fn write_items(path: &Path, items: &[HistoryItem]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(items)?)?;
    Ok(())
}
