use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use midly::num::{u4, u7, u15, u24, u28};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::timing::Note;

pub const TICKS_PER_QUARTER: u16 = 480;

const MAX_DELTA_TICKS: u64 = (1 << 28) - 1;

#[derive(Debug, Error)]
pub enum MidiFileError {
    #[error("failed to write MIDI file: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders `notes` as a format-0 Standard MIDI File.
///
/// Returns `None` for an empty phrase.
pub fn encode(notes: &[Note], bpm: f64, channel: u8) -> Result<Option<Vec<u8>>, MidiFileError> {
    if notes.is_empty() {
        return Ok(None);
    }

    let channel = u4::new(channel.clamp(1, 16) - 1);

    // (tick, note-offs before note-ons at the same tick, event)
    let mut timed: Vec<(u64, u8, MidiMessage)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let start = beats_to_ticks(note.start_beats);
        let end = beats_to_ticks(note.start_beats + note.duration_beats)
            .max(start.saturating_add(1));
        let key = u7::new(note.pitch.min(127));
        timed.push((
            start,
            1,
            MidiMessage::NoteOn {
                key,
                vel: u7::new(note.velocity.clamp(1, 127)),
            },
        ));
        timed.push((end, 0, MidiMessage::NoteOff { key, vel: u7::new(0) }));
    }
    timed.sort_by_key(|(tick, order, _)| (*tick, *order));

    let mut track: Vec<TrackEvent<'static>> = Vec::with_capacity(timed.len() + 2);
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros_per_quarter(bpm)))),
    });

    let mut last_tick = 0u64;
    for (tick, _, message) in timed {
        let delta = (tick - last_tick).min(MAX_DELTA_TICKS) as u32;
        last_tick = tick;
        track.push(TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi { channel, message },
        });
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(TICKS_PER_QUARTER))),
        tracks: vec![track],
    };

    let mut bytes = Vec::new();
    smf.write_std(&mut bytes)?;
    Ok(Some(bytes))
}

/// Clamped to what a single delta can express, so every event stays within
/// one delta of the file start.
fn beats_to_ticks(beats: f64) -> u64 {
    let ticks = (beats * TICKS_PER_QUARTER as f64).round();
    if ticks.is_nan() {
        return 0;
    }
    ticks.clamp(0.0, MAX_DELTA_TICKS as f64) as u64
}

fn micros_per_quarter(bpm: f64) -> u32 {
    let bpm = if bpm.is_finite() && bpm > 0.0 { bpm } else { 120.0 };
    ((60_000_000.0 / bpm).round() as u32).min(0x00FF_FFFF)
}

/// Writes finished phrases into a directory and deletes them again when
/// dropped.
pub struct MidiFileWriter {
    dir: PathBuf,
    created: Vec<PathBuf>,
}

impl MidiFileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            created: Vec::new(),
        }
    }

    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir())
    }

    /// Writes `notes` as `generated_sequence_<millis>.mid`. An empty phrase
    /// writes nothing.
    pub fn write(&mut self, notes: &[Note], bpm: f64, channel: u8) -> Result<Option<PathBuf>, MidiFileError> {
        let Some(bytes) = encode(notes, bpm, channel)? else {
            debug!("no notes to write to a MIDI file");
            return Ok(None);
        };

        fs::create_dir_all(&self.dir)?;
        let path = self.unique_path();
        fs::write(&path, bytes)?;
        info!("MIDI file created: {}", path.display());

        self.created.push(path.clone());
        Ok(Some(path))
    }

    pub fn created(&self) -> &[PathBuf] {
        &self.created
    }

    fn unique_path(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let mut path = self.dir.join(format!("generated_sequence_{millis}.mid"));
        let mut suffix = 1;
        while path.exists() {
            path = self.dir.join(format!("generated_sequence_{millis}_{suffix}.mid"));
            suffix += 1;
        }
        path
    }
}

impl Drop for MidiFileWriter {
    fn drop(&mut self) {
        for path in self.created.drain(..) {
            remove(&path);
        }
    }
}

fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("deleted MIDI file: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not delete {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes() -> Vec<Note> {
        vec![
            Note {
                pitch: 60,
                velocity: 100,
                start_beats: 0.0,
                duration_beats: 1.0,
            },
            Note {
                pitch: 64,
                velocity: 90,
                start_beats: 1.0,
                duration_beats: 0.5,
            },
        ]
    }

    #[test]
    fn encodes_notes_at_480_ticks_per_quarter() {
        let bytes = encode(&notes(), 120.0, 1).unwrap().unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        assert_eq!(smf.header.timing, Timing::Metrical(u15::new(480)));
        assert_eq!(smf.tracks.len(), 1);

        let mut tick = 0u32;
        let mut notes_seen = Vec::new();
        for event in &smf.tracks[0] {
            tick += event.delta.as_int();
            match event.kind {
                TrackEventKind::Midi { message, .. } => match message {
                    MidiMessage::NoteOn { key, .. } => notes_seen.push((tick, key.as_int(), true)),
                    MidiMessage::NoteOff { key, .. } => notes_seen.push((tick, key.as_int(), false)),
                    _ => {}
                },
                TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                    assert_eq!(tempo.as_int(), 500_000);
                }
                _ => {}
            }
        }

        // The note-off of the first note precedes the second note-on at 480.
        assert_eq!(
            notes_seen,
            vec![(0, 60, true), (480, 60, false), (480, 64, true), (720, 64, false)]
        );
    }

    #[test]
    fn empty_phrase_has_no_file() {
        assert!(encode(&[], 120.0, 1).unwrap().is_none());

        let dir = std::env::temp_dir().join(format!("kiwi-midi-empty-{}", std::process::id()));
        let mut writer = MidiFileWriter::new(&dir);
        assert!(writer.write(&[], 120.0, 1).unwrap().is_none());
        assert!(writer.created().is_empty());
    }

    #[test]
    fn files_are_unique_and_removed_on_drop() {
        let dir = std::env::temp_dir().join(format!("kiwi-midi-{}", std::process::id()));
        let mut writer = MidiFileWriter::new(&dir);

        let first = writer.write(&notes(), 120.0, 1).unwrap().unwrap();
        let second = writer.write(&notes(), 120.0, 1).unwrap().unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("generated_sequence_"));

        drop(writer);
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn huge_beat_values_are_clamped() {
        let notes = vec![
            Note {
                pitch: 60,
                velocity: 100,
                start_beats: 1e300,
                duration_beats: 1.0,
            },
            Note {
                pitch: 62,
                velocity: 100,
                start_beats: 0.0,
                duration_beats: 1e300,
            },
        ];
        let bytes = encode(&notes, 120.0, 1).unwrap().unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        let mut tick = 0u64;
        let mut last_on = 0u64;
        for event in &smf.tracks[0] {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Midi {
                message: MidiMessage::NoteOn { key, .. },
                ..
            } = event.kind
            {
                if key.as_int() == 60 {
                    last_on = tick;
                }
            }
        }
        assert_eq!(last_on, MAX_DELTA_TICKS);
        assert!(tick <= MAX_DELTA_TICKS + 1);
    }
}
