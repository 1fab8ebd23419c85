use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::NoteTimer;
use crate::events::NoteEvent;

/// Samples added to every note start so the first event never lands before
/// the callback that armed the sequence has returned.
pub const DEFAULT_TRIGGER_DELAY_SAMPLES: u64 = 10;

/// A note in musical time, as produced by the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: u8,
    pub velocity: u8,
    pub start_beats: f64,
    pub duration_beats: f64,
}

/// Everything needed to turn beats into samples. Only the audio side knows
/// the sample rate, so conversion happens there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingParams {
    pub bpm: f64,
    pub sample_rate: f64,
    pub trigger_delay: u64,
    pub channel: u8,
}

/// Upper bound on any sample offset or duration. Far beyond any playable
/// phrase, and small enough that sums of two offsets cannot overflow.
pub const MAX_OFFSET_SAMPLES: i64 = 1 << 52;

/// Saturates at `±MAX_OFFSET_SAMPLES`. An undefined product (e.g. zero beats
/// at an infinite rate) is zero.
pub fn beats_to_samples(beats: f64, bpm: f64, sample_rate: f64) -> i64 {
    let samples = (beats * 60.0 / bpm * sample_rate).round();
    if samples.is_nan() {
        return 0;
    }
    let limit = MAX_OFFSET_SAMPLES as f64;
    samples.clamp(-limit, limit) as i64
}

impl Note {
    /// Converts this note into a timer on the sample clock.
    ///
    /// Start and duration are each clamped to at least one sample, so the
    /// resulting timer always satisfies `off > on`.
    pub fn to_timer(&self, params: &TimingParams) -> NoteTimer {
        let delay = params.trigger_delay.min(MAX_OFFSET_SAMPLES as u64) as i64;
        let start = delay.saturating_add(beats_to_samples(
            self.start_beats,
            params.bpm,
            params.sample_rate,
        ));
        let duration = beats_to_samples(self.duration_beats, params.bpm, params.sample_rate);

        let on = start.max(1) as u64;
        let off = on.saturating_add(duration.max(1) as u64);

        NoteTimer::new(
            NoteEvent {
                channel: params.channel,
                pitch: self.pitch,
                velocity: self.velocity,
            },
            on,
            off,
        )
    }
}

/// Pure conversion of a beat-domain phrase into timers. Same inputs, same
/// timers.
pub fn extract_timers<'a>(
    notes: &'a [Note],
    params: &'a TimingParams,
) -> impl Iterator<Item = NoteTimer> + 'a {
    notes.iter().map(move |note| note.to_timer(params))
}

#[derive(Deserialize)]
struct RawNote {
    start_beats: f64,
    duration_beats: f64,
    midi_note: i64,
    velocity: i64,
}

/// Parses `{"notes": [...]}`.
///
/// Malformed entries are skipped; a missing or unparseable document yields an
/// empty phrase.
pub fn parse_notes(content: &str) -> Vec<Note> {
    let document: Value = match serde_json::from_str(content) {
        Ok(value) => value,
        Err(e) => {
            debug!("sequence content is not JSON: {e}");
            return Vec::new();
        }
    };

    let Some(entries) = document.get("notes").and_then(Value::as_array) else {
        debug!("sequence content has no notes array");
        return Vec::new();
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let note = parse_note(entry);
            if note.is_none() {
                debug!("skipping malformed note #{index}: {entry}");
            }
            note
        })
        .collect()
}

fn parse_note(entry: &Value) -> Option<Note> {
    if !entry.is_object() {
        return None;
    }
    let raw = RawNote::deserialize(entry).ok()?;

    if !raw.start_beats.is_finite() || !raw.duration_beats.is_finite() {
        return None;
    }
    let pitch = u8::try_from(raw.midi_note).ok().filter(|p| *p <= 127)?;
    let velocity = u8::try_from(raw.velocity)
        .ok()
        .filter(|v| (1..=127).contains(v))?;

    Some(Note {
        pitch,
        velocity,
        start_beats: raw.start_beats,
        duration_beats: raw.duration_beats,
    })
}
