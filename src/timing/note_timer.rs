use crate::events::{MidiBuffer, NoteEvent};

/// Samples left until an event fires, measured from the start of the block
/// about to be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Countdown {
    Pending(u64),
    Fired,
}

impl Countdown {
    /// Consumes one block. Returns the intra-block offset when the event
    /// lands inside it.
    fn advance(&mut self, block_size: usize) -> Option<usize> {
        let block = block_size as u64;
        match *self {
            Countdown::Pending(remaining) if remaining < block => {
                *self = Countdown::Fired;
                Some(remaining as usize)
            }
            Countdown::Pending(remaining) => {
                *self = Countdown::Pending(remaining - block);
                None
            }
            Countdown::Fired => None,
        }
    }

    fn remaining(&self) -> Option<u64> {
        match *self {
            Countdown::Pending(remaining) => Some(remaining),
            Countdown::Fired => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Pending,
    OnFired,
    Finished,
}

/// Countdown-to-on and countdown-to-off for a single note.
#[derive(Debug, Clone)]
pub struct NoteTimer {
    note: NoteEvent,
    on: Countdown,
    off: Countdown,
    original_on: u64,
    original_off: u64,
    counted: bool,
}

impl NoteTimer {
    /// # Panics
    ///
    /// Panics if `off_samples <= on_samples`. A timer needs a non-zero
    /// duration; callers clamp durations before building timers.
    pub fn new(note: NoteEvent, on_samples: u64, off_samples: u64) -> Self {
        assert!(
            off_samples > on_samples,
            "note-off ({off_samples}) must come after note-on ({on_samples})"
        );
        Self {
            note,
            on: Countdown::Pending(on_samples),
            off: Countdown::Pending(off_samples),
            original_on: on_samples,
            original_off: off_samples,
            counted: false,
        }
    }

    /// Consumes one block of `block_size` samples, appending whichever of
    /// note-on / note-off falls inside it.
    pub fn advance(&mut self, block_size: usize, buffer: &mut MidiBuffer) {
        if let Some(offset) = self.on.advance(block_size) {
            buffer.add_event(self.note.note_on(), offset);
        }
        if let Some(offset) = self.off.advance(block_size) {
            buffer.add_event(self.note.note_off(), offset);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.on == Countdown::Fired && self.off == Countdown::Fired
    }

    pub fn state(&self) -> TimerState {
        match (self.on, self.off) {
            (Countdown::Fired, Countdown::Fired) => TimerState::Finished,
            (Countdown::Fired, Countdown::Pending(_)) => TimerState::OnFired,
            _ => TimerState::Pending,
        }
    }

    pub fn is_counted(&self) -> bool {
        self.counted
    }

    pub fn mark_counted(&mut self) {
        self.counted = true;
    }

    /// Restores both countdowns so the note can be replayed.
    pub fn reset(&mut self) {
        self.on = Countdown::Pending(self.original_on);
        self.off = Countdown::Pending(self.original_off);
        self.counted = false;
    }

    pub fn note(&self) -> &NoteEvent {
        &self.note
    }

    pub fn on_countdown(&self) -> Option<u64> {
        self.on.remaining()
    }

    pub fn off_countdown(&self) -> Option<u64> {
        self.off.remaining()
    }

    pub fn original_on(&self) -> u64 {
        self.original_on
    }

    pub fn original_off(&self) -> u64 {
        self.original_off
    }
}
