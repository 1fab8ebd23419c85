use crate::events::{MidiBuffer, ScheduledEvent};
use ringbuf::traits::Producer;
use thiserror::Error;

pub type EventProducer = ringbuf::HeapProd<ScheduledEvent>;

/// Moves one block's events onto the absolute sample clock and pushes them
/// to the MIDI output thread. Stops at the first event that does not fit.
pub fn forward_block_events(
    buffer: &MidiBuffer,
    block_start_sample: u64,
    producer: &mut EventProducer,
) -> Result<(), SchedulerError> {
    for event in buffer.iter() {
        let scheduled = ScheduledEvent {
            sample_timestamp: block_start_sample + event.offset as u64,
            message: event.message,
        };
        if producer.try_push(scheduled).is_err() {
            return Err(SchedulerError::BufferFull);
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("event ring is full")]
    BufferFull,
}
