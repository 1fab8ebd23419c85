//! The body of the real-time callback.
//!
//! Everything in here runs on the audio thread: no locks, no I/O, no logging.
//! The only inputs from other threads are the arm cell and the tempo in
//! [`PlaybackControl`], and the phrase published through
//! [`SequenceHandoff`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crossbeam::channel::Sender;

use crate::events::MidiBuffer;
use crate::store::SequenceHandoff;
use crate::timing::{self, SequenceTracker, TimingParams};

pub const DEFAULT_BPM: f64 = 140.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmKind {
    /// Build timers from the latest published phrase.
    New,
    /// Rewind and play the current timers again.
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Armed(ArmKind),
    Running,
}

const ARM_NONE: u8 = 0;
const ARM_REPLAY: u8 = 1;
const ARM_NEW: u8 = 2;

const STATUS_IDLE: u8 = 0;
const STATUS_RUNNING: u8 = 1;

/// Small atomic cells shared between the host side and the block driver.
///
/// Writers: the host arms and sets the tempo; the driver writes the status.
/// Reader of the arm cell: the driver only, which clears it.
pub struct PlaybackControl {
    arm: AtomicU8,
    status: AtomicU8,
    bpm_bits: AtomicU64,
}

impl PlaybackControl {
    pub fn new(bpm: f64) -> Self {
        let bpm = if bpm.is_finite() && bpm > 0.0 {
            bpm
        } else {
            DEFAULT_BPM
        };
        Self {
            arm: AtomicU8::new(ARM_NONE),
            status: AtomicU8::new(STATUS_IDLE),
            bpm_bits: AtomicU64::new(bpm.to_bits()),
        }
    }

    /// Requests playback of the most recently published phrase. Takes
    /// precedence over a pending replay.
    pub fn request_new(&self) {
        self.arm.fetch_max(ARM_NEW, Ordering::AcqRel);
    }

    /// Requests the current phrase be played again without re-fetching.
    pub fn request_replay(&self) {
        self.arm.fetch_max(ARM_REPLAY, Ordering::AcqRel);
    }

    fn take_request(&self) -> Option<ArmKind> {
        decode_arm(self.arm.swap(ARM_NONE, Ordering::AcqRel))
    }

    pub fn pending_request(&self) -> Option<ArmKind> {
        decode_arm(self.arm.load(Ordering::Acquire))
    }

    pub fn state(&self) -> DriverState {
        if self.status.load(Ordering::Acquire) == STATUS_RUNNING {
            return DriverState::Running;
        }
        match self.pending_request() {
            Some(kind) => DriverState::Armed(kind),
            None => DriverState::Idle,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state() != DriverState::Idle
    }

    /// `true` when nothing is armed or running.
    pub fn is_finished(&self) -> bool {
        !self.is_playing()
    }

    pub fn bpm(&self) -> f64 {
        f64::from_bits(self.bpm_bits.load(Ordering::Relaxed))
    }

    /// Ignores non-positive or non-finite values.
    pub fn set_bpm(&self, bpm: f64) -> bool {
        if !bpm.is_finite() || bpm <= 0.0 {
            return false;
        }
        self.bpm_bits.store(bpm.to_bits(), Ordering::Relaxed);
        true
    }

    fn set_running(&self, running: bool) {
        let status = if running { STATUS_RUNNING } else { STATUS_IDLE };
        self.status.store(status, Ordering::Release);
    }
}

impl Default for PlaybackControl {
    fn default() -> Self {
        Self::new(DEFAULT_BPM)
    }
}

fn decode_arm(raw: u8) -> Option<ArmKind> {
    match raw {
        ARM_NEW => Some(ArmKind::New),
        ARM_REPLAY => Some(ArmKind::Replay),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriverNotice {
    /// `bpm` is the tempo the pass was timed with.
    SequenceFinished { generation: u64, replay: bool, bpm: f64 },
}

/// The pieces a block driver needs, minus the sample rate, which is only
/// known once the audio device is open.
pub struct DriverWiring {
    pub control: Arc<PlaybackControl>,
    pub handoff: Arc<SequenceHandoff>,
    pub notices: Option<Sender<DriverNotice>>,
    pub trigger_delay: u64,
    pub channel: u8,
}

impl DriverWiring {
    pub fn into_driver(self, sample_rate: f64) -> BlockDriver {
        BlockDriver::new(self, sample_rate)
    }
}

pub struct BlockDriver {
    control: Arc<PlaybackControl>,
    handoff: Arc<SequenceHandoff>,
    notices: Option<Sender<DriverNotice>>,
    tracker: SequenceTracker,
    state: DriverState,
    replaying: bool,
    loaded_generation: Option<u64>,
    loaded_bpm: f64,
    sample_rate: f64,
    trigger_delay: u64,
    channel: u8,
}

impl BlockDriver {
    pub fn new(wiring: DriverWiring, sample_rate: f64) -> Self {
        Self {
            control: wiring.control,
            handoff: wiring.handoff,
            notices: wiring.notices,
            tracker: SequenceTracker::new(),
            state: DriverState::Idle,
            replaying: false,
            loaded_generation: None,
            loaded_bpm: 0.0,
            sample_rate,
            trigger_delay: wiring.trigger_delay,
            channel: wiring.channel,
        }
    }

    /// Runs one block. Events are appended to `buffer` with offsets in
    /// `[0, block_size)`.
    pub fn process(&mut self, block_size: usize, buffer: &mut MidiBuffer) {
        if self.state == DriverState::Idle {
            if let Some(kind) = self.control.take_request() {
                self.state = DriverState::Armed(kind);
            }
        }

        if let DriverState::Armed(kind) = self.state {
            self.start(kind);
        }

        if self.state == DriverState::Running {
            self.tracker.process_block(block_size, buffer);
            if self.tracker.is_finished() {
                self.finish();
            }
        }
    }

    fn start(&mut self, kind: ArmKind) {
        let snapshot = self.handoff.load();
        let params = self.timing_params();
        let replay = kind == ArmKind::Replay && self.loaded_generation == Some(snapshot.generation);

        if replay && self.loaded_bpm == params.bpm {
            self.tracker.reset();
        } else {
            self.tracker
                .rebuild(timing::extract_timers(&snapshot.notes, &params));
            self.loaded_generation = Some(snapshot.generation);
            self.loaded_bpm = params.bpm;
        }

        self.replaying = replay;
        self.state = DriverState::Running;
        self.control.set_running(true);
    }

    fn finish(&mut self) {
        self.state = DriverState::Idle;
        self.control.set_running(false);

        if let (Some(notices), Some(generation)) = (&self.notices, self.loaded_generation) {
            let _ = notices.try_send(DriverNotice::SequenceFinished {
                generation,
                replay: self.replaying,
                bpm: self.loaded_bpm,
            });
        }
    }

    fn timing_params(&self) -> TimingParams {
        TimingParams {
            bpm: self.control.bpm(),
            sample_rate: self.sample_rate,
            trigger_delay: self.trigger_delay,
            channel: self.channel,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MidiMessage;
    use crate::store::SequenceStore;
    use crossbeam::channel::{Receiver, bounded};

    const PHRASE: &str = r#"{"notes":[
        {"start_beats":0,"duration_beats":0.5,"midi_note":60,"velocity":100},
        {"start_beats":0.5,"duration_beats":0.5,"midi_note":64,"velocity":90}
    ]}"#;

    struct Rig {
        store: SequenceStore,
        control: Arc<PlaybackControl>,
        driver: BlockDriver,
        notices: Receiver<DriverNotice>,
    }

    // 120 BPM at 1000 Hz: one beat is 500 samples.
    fn rig() -> Rig {
        let store = SequenceStore::new();
        let control = Arc::new(PlaybackControl::new(120.0));
        let (tx, rx) = bounded(8);
        let driver = DriverWiring {
            control: control.clone(),
            handoff: store.handoff(),
            notices: Some(tx),
            trigger_delay: 10,
            channel: 1,
        }
        .into_driver(1000.0);
        Rig {
            store,
            control,
            driver,
            notices: rx,
        }
    }

    fn run_blocks(driver: &mut BlockDriver, blocks: usize, size: usize) -> Vec<(u64, MidiMessage)> {
        let mut buffer = MidiBuffer::with_capacity(16);
        let mut events = Vec::new();
        for block in 0..blocks {
            buffer.clear();
            driver.process(size, &mut buffer);
            for event in buffer.iter() {
                assert!(event.offset < size);
                events.push(((block * size + event.offset) as u64, event.message));
            }
        }
        events
    }

    #[test]
    fn stays_idle_until_armed() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);

        let events = run_blocks(&mut rig.driver, 4, 64);
        assert!(events.is_empty());
        assert_eq!(rig.driver.state(), DriverState::Idle);
        assert_eq!(rig.control.state(), DriverState::Idle);
    }

    #[test]
    fn plays_a_new_phrase_to_completion() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);
        rig.control.request_new();
        assert_eq!(rig.control.state(), DriverState::Armed(ArmKind::New));

        let events = run_blocks(&mut rig.driver, 1, 64);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 10);
        assert_eq!(rig.driver.state(), DriverState::Running);
        assert!(rig.control.is_playing());

        // 1 beat + delay = 510; covered by 9 blocks of 64.
        let rest = run_blocks(&mut rig.driver, 8, 64);
        let times: Vec<u64> = rest.iter().map(|(t, _)| t + 64).collect();
        assert_eq!(times, vec![260, 260, 510]);

        assert_eq!(rig.driver.state(), DriverState::Idle);
        assert!(rig.control.is_finished());
        assert_eq!(
            rig.notices.try_recv().unwrap(),
            DriverNotice::SequenceFinished {
                generation: 1,
                replay: false,
                bpm: 120.0,
            }
        );
    }

    #[test]
    fn replay_reuses_timers_and_reproduces_offsets() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);

        rig.control.request_new();
        let first = run_blocks(&mut rig.driver, 12, 48);
        rig.notices.try_recv().unwrap();

        rig.control.request_replay();
        let second = run_blocks(&mut rig.driver, 12, 48);
        assert_eq!(first, second);
        assert_eq!(
            rig.notices.try_recv().unwrap(),
            DriverNotice::SequenceFinished {
                generation: 1,
                replay: true,
                bpm: 120.0,
            }
        );
    }

    #[test]
    fn replay_without_loaded_timers_builds_them() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);
        rig.control.request_replay();

        let events = run_blocks(&mut rig.driver, 10, 64);
        assert_eq!(events.len(), 4);
        assert_eq!(
            rig.notices.try_recv().unwrap(),
            DriverNotice::SequenceFinished {
                generation: 1,
                replay: false,
                bpm: 120.0,
            }
        );
    }

    #[test]
    fn requests_while_running_wait_for_idle() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);
        rig.control.request_new();
        run_blocks(&mut rig.driver, 1, 64);

        rig.control.request_replay();
        run_blocks(&mut rig.driver, 1, 64);
        assert_eq!(rig.control.pending_request(), Some(ArmKind::Replay));

        // The first pass ends in the eighth block (448..512).
        run_blocks(&mut rig.driver, 6, 64);
        rig.notices.try_recv().unwrap();
        assert_eq!(rig.driver.state(), DriverState::Idle);
        assert_eq!(rig.control.pending_request(), Some(ArmKind::Replay));

        run_blocks(&mut rig.driver, 1, 64);
        assert_eq!(rig.control.pending_request(), None);
        assert_eq!(rig.driver.state(), DriverState::Running);
    }

    #[test]
    fn new_phrase_replaces_the_old_one() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);
        rig.control.request_new();
        run_blocks(&mut rig.driver, 10, 64);
        rig.notices.try_recv().unwrap();

        rig.store.set_content(
            r#"{"notes":[{"start_beats":0,"duration_beats":0.1,"midi_note":72,"velocity":50}]}"#,
        );
        rig.control.request_replay();
        let events = run_blocks(&mut rig.driver, 2, 64);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1.pitch(), 72);
        assert_eq!(rig.driver.tracker().len(), 1);
    }

    #[test]
    fn empty_phrase_finishes_on_the_first_block() {
        let mut rig = rig();
        rig.store.clear();
        rig.control.request_new();

        let events = run_blocks(&mut rig.driver, 1, 64);
        assert!(events.is_empty());
        assert_eq!(rig.driver.state(), DriverState::Idle);
        assert_eq!(
            rig.notices.try_recv().unwrap(),
            DriverNotice::SequenceFinished {
                generation: 1,
                replay: false,
                bpm: 120.0,
            }
        );
    }

    #[test]
    fn tempo_is_read_when_the_sequence_starts() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);
        assert!(rig.control.set_bpm(60.0));
        assert!(!rig.control.set_bpm(0.0));
        rig.control.request_new();

        let events = run_blocks(&mut rig.driver, 20, 64);
        let offs: Vec<u64> = events
            .iter()
            .filter(|(_, m)| !m.is_note_on())
            .map(|(t, _)| *t)
            .collect();
        // One beat is 1000 samples at 60 BPM.
        assert_eq!(offs, vec![510, 1010]);
    }

    #[test]
    fn replay_after_tempo_change_rebuilds_timers() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);
        rig.control.request_new();
        run_blocks(&mut rig.driver, 12, 48);
        rig.notices.try_recv().unwrap();

        assert!(rig.control.set_bpm(60.0));
        rig.control.request_replay();
        let events = run_blocks(&mut rig.driver, 20, 64);
        let offs: Vec<u64> = events
            .iter()
            .filter(|(_, m)| !m.is_note_on())
            .map(|(t, _)| *t)
            .collect();
        assert_eq!(offs, vec![510, 1010]);
        assert_eq!(
            rig.notices.try_recv().unwrap(),
            DriverNotice::SequenceFinished {
                generation: 1,
                replay: true,
                bpm: 60.0,
            }
        );
    }

    #[test]
    fn near_zero_tempo_plays_without_overflow() {
        let mut rig = rig();
        rig.store.set_content(PHRASE);
        assert!(rig.control.set_bpm(1e-300));
        rig.control.request_new();

        let events = run_blocks(&mut rig.driver, 8, 64);
        assert_eq!(events.len(), 1);
        assert!(events[0].1.is_note_on());
        assert_eq!(events[0].0, 10);
        assert_eq!(rig.driver.state(), DriverState::Running);
    }

    #[test]
    fn new_request_wins_over_replay() {
        let control = PlaybackControl::default();
        control.request_replay();
        control.request_new();
        assert_eq!(control.pending_request(), Some(ArmKind::New));
        control.request_replay();
        assert_eq!(control.pending_request(), Some(ArmKind::New));
        assert_eq!(control.bpm(), DEFAULT_BPM);
    }
}
