/// One note as read from a generated sequence. Never mutated after creation.
///
/// `channel` is 1-based (1..=16), `pitch` is 0..=127, `velocity` is 1..=127.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    pub channel: u8,
    pub pitch: u8,
    pub velocity: u8,
}

impl NoteEvent {
    pub fn note_on(&self) -> MidiMessage {
        MidiMessage::NoteOn {
            channel: self.channel,
            pitch: self.pitch,
            velocity: self.velocity,
        }
    }

    pub fn note_off(&self) -> MidiMessage {
        MidiMessage::NoteOff {
            channel: self.channel,
            pitch: self.pitch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
}

impl MidiMessage {
    /// Raw wire bytes. Channels are 1-based here and 0-based on the wire.
    pub fn to_bytes(&self) -> [u8; 3] {
        match *self {
            MidiMessage::NoteOn {
                channel,
                pitch,
                velocity,
            } => [0x90 | wire_channel(channel), pitch & 0x7F, velocity & 0x7F],
            MidiMessage::NoteOff { channel, pitch } => {
                [0x80 | wire_channel(channel), pitch & 0x7F, 0]
            }
        }
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiMessage::NoteOn { .. })
    }

    pub fn pitch(&self) -> u8 {
        match *self {
            MidiMessage::NoteOn { pitch, .. } | MidiMessage::NoteOff { pitch, .. } => pitch,
        }
    }
}

fn wire_channel(channel: u8) -> u8 {
    channel.clamp(1, 16) - 1
}

/// A message placed at a sample offset inside the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEvent {
    pub offset: usize,
    pub message: MidiMessage,
}

/// A message placed on the engine's absolute sample clock, handed from the
/// audio callback to the MIDI output thread.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledEvent {
    pub sample_timestamp: u64,
    pub message: MidiMessage,
}

/// Append-only event sink for a single block.
///
/// Allocate it once with enough capacity and `clear` it at the top of every
/// callback; pushing within capacity never reallocates.
#[derive(Debug, Default)]
pub struct MidiBuffer {
    events: Vec<BlockEvent>,
}

impl MidiBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn add_event(&mut self, message: MidiMessage, offset: usize) {
        self.events.push(BlockEvent { offset, message });
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockEvent> {
        self.events.iter()
    }

    pub fn as_slice(&self) -> &[BlockEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_channel_zero_based_on_the_wire() {
        let note = NoteEvent {
            channel: 1,
            pitch: 60,
            velocity: 100,
        };
        assert_eq!(note.note_on().to_bytes(), [0x90, 60, 100]);
        assert_eq!(note.note_off().to_bytes(), [0x80, 60, 0]);

        let last = NoteEvent {
            channel: 16,
            pitch: 127,
            velocity: 1,
        };
        assert_eq!(last.note_on().to_bytes(), [0x9F, 127, 1]);
    }

    #[test]
    fn buffer_keeps_insertion_order() {
        let note = NoteEvent {
            channel: 1,
            pitch: 64,
            velocity: 90,
        };
        let mut buffer = MidiBuffer::with_capacity(4);
        buffer.add_event(note.note_on(), 12);
        buffer.add_event(note.note_off(), 3);

        let offsets: Vec<usize> = buffer.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![12, 3]);

        buffer.clear();
        assert!(buffer.is_empty());
    }
}
