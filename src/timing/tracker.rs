use super::NoteTimer;
use crate::events::MidiBuffer;

/// The timers of one generated phrase plus a count of how many have finished.
///
/// Owned and mutated by the block driver only.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    timers: Vec<NoteTimer>,
    completed: usize,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_timers(timers: Vec<NoteTimer>) -> Self {
        Self {
            timers,
            completed: 0,
        }
    }

    /// Replaces the timer set, keeping the existing allocation.
    pub fn rebuild<I>(&mut self, timers: I)
    where
        I: IntoIterator<Item = NoteTimer>,
    {
        self.timers.clear();
        self.timers.extend(timers);
        self.completed = 0;
    }

    pub fn clear(&mut self) {
        self.timers.clear();
        self.completed = 0;
    }

    /// Advances every timer by one block, in order, and tallies timers that
    /// finished during this block.
    pub fn process_block(&mut self, block_size: usize, buffer: &mut MidiBuffer) {
        for timer in self.timers.iter_mut() {
            timer.advance(block_size, buffer);
            if timer.is_finished() && !timer.is_counted() {
                timer.mark_counted();
                self.completed += 1;
            }
        }
    }

    /// Returns `true` once per pass, when every timer has finished.
    ///
    /// This is an edge: returning `true` zeroes the completion counter, so a
    /// caller that polls twice sees `true` then `false`.
    pub fn is_finished(&mut self) -> bool {
        if self.completed >= self.timers.len() {
            self.completed = 0;
            return true;
        }
        false
    }

    /// Rewinds every timer for a replay of the same phrase.
    pub fn reset(&mut self) {
        self.completed = 0;
        for timer in self.timers.iter_mut() {
            timer.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn timers(&self) -> &[NoteTimer] {
        &self.timers
    }
}
