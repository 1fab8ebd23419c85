use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("history file is malformed: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to serialize history: {0}")]
    Serialize(#[from] ron::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub prompt: String,
    pub response: String,
    pub midi_file: Option<PathBuf>,
    /// Seconds since the UNIX epoch.
    pub timestamp: u64,
}

impl ChatEntry {
    pub fn new(prompt: impl Into<String>, response: impl Into<String>, midi_file: Option<PathBuf>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            prompt: prompt.into(),
            response: response.into(),
            midi_file,
            timestamp,
        }
    }
}

/// The last [`HISTORY_CAPACITY`] prompts, oldest first.
pub struct ChatHistory {
    entries: Mutex<VecDeque<ChatEntry>>,
    path: Option<PathBuf>,
}

impl ChatHistory {
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            path: None,
        }
    }

    /// Reads `path` if it exists. Only the newest entries are kept.
    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        let mut entries = VecDeque::with_capacity(HISTORY_CAPACITY);
        if path.is_file() {
            let stored: Vec<ChatEntry> = ron::from_str(&fs::read_to_string(path)?)?;
            let skip = stored.len().saturating_sub(HISTORY_CAPACITY);
            entries.extend(stored.into_iter().skip(skip));
            debug!("loaded {} history entries from {}", entries.len(), path.display());
        }
        Ok(Self {
            entries: Mutex::new(entries),
            path: Some(path.to_path_buf()),
        })
    }

    /// Like [`ChatHistory::load`], but an unreadable file starts an empty
    /// history that still saves to `path`.
    pub fn load_or_empty(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("ignoring history at {}: {e}", path.display());
            Self {
                entries: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
                path: Some(path.to_path_buf()),
            }
        })
    }

    /// Appends `entry`, evicting the oldest entry first when full.
    pub fn add(&self, entry: ChatEntry) {
        let mut entries = self.entries.lock();
        while entries.len() >= HISTORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<ChatEntry> {
        self.entries.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Writes the whole history. No-op for an in-memory history.
    pub fn save(&self) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.entries();
        let text = ron::ser::to_string_pretty(&snapshot, ron::ser::PrettyConfig::default())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }
}
