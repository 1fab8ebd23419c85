use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::timing::{self, Note, NoteTimer, TimingParams};

/// An immutable view of the stored phrase, published to the audio thread.
#[derive(Debug, Default)]
pub struct SequenceSnapshot {
    pub generation: u64,
    pub notes: Vec<Note>,
}

/// Lock-free publication point between the store and the block driver.
pub struct SequenceHandoff {
    current: ArcSwap<SequenceSnapshot>,
}

impl SequenceHandoff {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(SequenceSnapshot::default()),
        }
    }

    /// Audio-thread-safe.
    pub fn load(&self) -> Arc<SequenceSnapshot> {
        self.current.load_full()
    }

    fn publish(&self, snapshot: SequenceSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for SequenceHandoff {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct StoreInner {
    content: String,
    notes: Vec<Note>,
    generation: u64,
}

/// Holds the most recently generated phrase, in beats.
///
/// Every accessor takes the lock for its own duration and returns copies.
pub struct SequenceStore {
    inner: Mutex<StoreInner>,
    handoff: Arc<SequenceHandoff>,
}

impl SequenceStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            handoff: Arc::new(SequenceHandoff::new()),
        }
    }

    /// Replaces the stored phrase with the notes parsed from `content` and
    /// publishes it. Returns the number of notes kept.
    pub fn set_content(&self, content: &str) -> usize {
        let notes = timing::parse_notes(content);
        let count = notes.len();

        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.content = content.to_string();
        inner.notes = notes;
        self.handoff.publish(SequenceSnapshot {
            generation: inner.generation,
            notes: inner.notes.clone(),
        });

        info!(notes = count, generation = inner.generation, "sequence stored");
        count
    }

    /// Empties the stored phrase. Used when a response carried no content.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.content.clear();
        inner.notes.clear();
        self.handoff.publish(SequenceSnapshot {
            generation: inner.generation,
            notes: Vec::new(),
        });
        debug!(generation = inner.generation, "sequence cleared");
    }

    pub fn note_count(&self) -> usize {
        self.inner.lock().notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().notes.is_empty()
    }

    pub fn notes(&self) -> Vec<Note> {
        self.inner.lock().notes.clone()
    }

    pub fn content(&self) -> String {
        self.inner.lock().content.clone()
    }

    /// Bumped on every `set_content` / `clear`.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Converts the stored phrase into timers at the given tempo and rate.
    pub fn extract_sequence(&self, params: &TimingParams) -> Vec<NoteTimer> {
        let inner = self.inner.lock();
        timing::extract_timers(&inner.notes, params).collect()
    }

    pub fn handoff(&self) -> Arc<SequenceHandoff> {
        self.handoff.clone()
    }
}

impl Default for SequenceStore {
    fn default() -> Self {
        Self::new()
    }
}
