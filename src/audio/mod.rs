mod midi_out;

pub use midi_out::{MidiForwarder, select_port};

use crate::driver::{BlockDriver, DriverWiring};
use crate::events::{MidiBuffer, ScheduledEvent};
use crate::timing::{EventProducer, forward_block_events};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::HeapRb;
use ringbuf::traits::Split;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{error, info};

const EVENT_RING_CAPACITY: usize = 4096;
const MAX_EVENTS_PER_BLOCK: usize = 256;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no audio output device")]
    NoDevice,
    #[error("failed to query output config: {0}")]
    Config(#[from] cpal::DefaultStreamConfigError),
    #[error("failed to build output stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("failed to start output stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
    #[error("MIDI output unavailable: {0}")]
    Midi(String),
}

/// Keeps the output stream and the MIDI forwarder alive.
pub struct AudioHost {
    _stream: cpal::Stream,
    _midi: MidiForwarder,
    sample_counter: Arc<AtomicU64>,
    sample_rate: f64,
}

impl AudioHost {
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Samples rendered since the stream started.
    pub fn samples_rendered(&self) -> u64 {
        self.sample_counter.load(Ordering::Relaxed)
    }
}

struct CallbackState {
    driver: BlockDriver,
    buffer: MidiBuffer,
    producer: EventProducer,
    num_channels: usize,
    /// Blocks that did not fit in the ring. Reported by the MIDI thread.
    overflows: Arc<AtomicU64>,
}

/// Opens the default output device and starts driving `wiring` from its
/// callback. The stream renders silence; its only job is the clock.
pub fn start(wiring: DriverWiring, midi_port: Option<&str>) -> Result<AudioHost, AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let config = device.default_output_config()?;
    let stream_config: cpal::StreamConfig = config.into();

    let num_channels = stream_config.channels as usize;
    let sample_rate = stream_config.sample_rate as f64;
    info!("audio output: {} channels, {} Hz", num_channels, sample_rate);

    let ring_buffer = HeapRb::<ScheduledEvent>::new(EVENT_RING_CAPACITY);
    let (producer, consumer) = ring_buffer.split();
    let overflows = Arc::new(AtomicU64::new(0));
    let midi = MidiForwarder::spawn(consumer, overflows.clone(), midi_port)?;

    let mut state = CallbackState {
        driver: wiring.into_driver(sample_rate),
        buffer: MidiBuffer::with_capacity(MAX_EVENTS_PER_BLOCK),
        producer,
        num_channels,
        overflows,
    };

    let sample_counter = Arc::new(AtomicU64::new(0));
    let counter_audio = sample_counter.clone();

    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            audio_callback(data, &mut state, &counter_audio);
        },
        |err| error!("audio stream error: {err}"),
        None,
    )?;

    stream.play()?;

    Ok(AudioHost {
        _stream: stream,
        _midi: midi,
        sample_counter,
        sample_rate,
    })
}

fn audio_callback(data: &mut [f32], state: &mut CallbackState, sample_counter: &AtomicU64) {
    data.fill(0.0);

    let num_frames = data.len() / state.num_channels.max(1);
    let block_start = sample_counter.load(Ordering::Relaxed);

    state.buffer.clear();
    state.driver.process(num_frames, &mut state.buffer);

    if forward_block_events(&state.buffer, block_start, &mut state.producer).is_err() {
        state.overflows.fetch_add(1, Ordering::Relaxed);
    }

    sample_counter.store(block_start + num_frames as u64, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PlaybackControl;
    use crate::store::SequenceStore;
    use ringbuf::traits::Consumer;

    #[test]
    fn full_ring_is_counted_and_the_clock_still_advances() {
        let store = SequenceStore::new();
        store.set_content(
            r#"{"notes":[
                {"start_beats":0,"duration_beats":1,"midi_note":60,"velocity":100},
                {"start_beats":0,"duration_beats":1,"midi_note":64,"velocity":100}
            ]}"#,
        );
        let control = Arc::new(PlaybackControl::new(120.0));
        control.request_new();
        let driver = DriverWiring {
            control,
            handoff: store.handoff(),
            notices: None,
            trigger_delay: 0,
            channel: 1,
        }
        .into_driver(1000.0);

        let (producer, mut consumer) = HeapRb::<ScheduledEvent>::new(1).split();
        let overflows = Arc::new(AtomicU64::new(0));
        let mut state = CallbackState {
            driver,
            buffer: MidiBuffer::with_capacity(8),
            producer,
            num_channels: 2,
            overflows: overflows.clone(),
        };
        let counter = AtomicU64::new(0);

        let mut data = vec![1.0f32; 128];
        audio_callback(&mut data, &mut state, &counter);

        assert!(data.iter().all(|sample| *sample == 0.0));
        assert_eq!(counter.load(Ordering::Relaxed), 64);
        assert_eq!(overflows.load(Ordering::Relaxed), 1);
        assert_eq!(consumer.try_pop().map(|e| e.sample_timestamp), Some(1));

        audio_callback(&mut data, &mut state, &counter);
        assert_eq!(counter.load(Ordering::Relaxed), 128);
        assert_eq!(overflows.load(Ordering::Relaxed), 1);
    }
}
