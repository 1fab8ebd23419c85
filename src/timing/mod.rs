mod note_timer;
mod scheduler;
mod sequence;
mod tracker;

pub use note_timer::{NoteTimer, TimerState};
pub use scheduler::{EventProducer, SchedulerError, forward_block_events};
pub use sequence::{
    DEFAULT_TRIGGER_DELAY_SAMPLES, MAX_OFFSET_SAMPLES, Note, TimingParams, beats_to_samples,
    extract_timers, parse_notes,
};
pub use tracker::SequenceTracker;
