use crate::config::Config;
use crate::driver::{DriverNotice, DriverWiring, PlaybackControl};
use crate::error::GenerateError;
use crate::generator::{Generator, Transport};
use crate::history::{ChatEntry, ChatHistory};
use crate::main_context::{self, MainLoop};
use crate::midi_file::MidiFileWriter;
use crate::store::SequenceStore;
use crossbeam::channel::{Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

const NOTICE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Generate { prompt: String },
    Replay,
    SetTempo(f64),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    GenerationStarted { prompt: String },
    GenerationFinished { note_count: usize },
    SequenceFinished { replay: bool, midi_file: Option<PathBuf> },
    Error { message: String },
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    pub control: Arc<PlaybackControl>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stops the engine thread and waits for it. Generated MIDI files are
    /// deleted on the way out.
    pub fn shutdown(mut self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("engine thread panicked");
            }
        }
    }
}

/// Starts the engine thread, which doubles as the main context.
///
/// The returned wiring becomes the block driver once the audio device's
/// sample rate is known.
pub fn spawn_engine(
    config: &Config,
    api_key: Option<String>,
    transport: Arc<dyn Transport>,
) -> (EngineHandle, DriverWiring) {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();
    let (completion_tx, completion_rx) = crossbeam::channel::unbounded();
    let (notice_tx, notice_rx) = crossbeam::channel::bounded(NOTICE_CAPACITY);
    let (context, main_loop) = main_context::main_context();

    let store = Arc::new(SequenceStore::new());
    let control = Arc::new(PlaybackControl::new(config.bpm));

    let generator = Generator::new(api_key, transport, context, store.clone())
        .with_endpoint(config.endpoint.clone())
        .with_model(config.model.clone());

    let midi_files = match &config.midi_dir {
        Some(dir) => MidiFileWriter::new(dir),
        None => MidiFileWriter::in_temp_dir(),
    };

    let wiring = DriverWiring {
        control: control.clone(),
        handoff: store.handoff(),
        notices: Some(notice_tx.clone()),
        trigger_delay: config.trigger_delay_samples,
        channel: config.midi_channel,
    };

    let state = EngineState {
        generator,
        store,
        control: control.clone(),
        history: ChatHistory::load_or_empty(&config.history_path()),
        midi_files,
        channel: config.midi_channel,
        pending_entry: None,
        completion_tx,
        _notice_tx: notice_tx,
        update_tx,
    };

    let thread = std::thread::spawn(move || {
        engine_thread(state, main_loop, command_rx, completion_rx, notice_rx);
    });

    (
        EngineHandle {
            command_tx,
            update_rx,
            control,
            thread: Some(thread),
        },
        wiring,
    )
}

struct Completion {
    prompt: String,
    result: Result<String, GenerateError>,
}

struct PendingEntry {
    generation: u64,
    prompt: String,
    response: String,
}

struct EngineState {
    generator: Generator,
    store: Arc<SequenceStore>,
    control: Arc<PlaybackControl>,
    history: ChatHistory,
    midi_files: MidiFileWriter,
    channel: u8,
    pending_entry: Option<PendingEntry>,
    completion_tx: Sender<Completion>,
    // Keeps the notice channel connected after the audio side goes away.
    _notice_tx: Sender<DriverNotice>,
    update_tx: Sender<EngineUpdate>,
}

fn engine_thread(
    mut state: EngineState,
    main_loop: MainLoop,
    command_rx: Receiver<EngineCommand>,
    completion_rx: Receiver<Completion>,
    notice_rx: Receiver<DriverNotice>,
) {
    info!("engine started");
    loop {
        crossbeam::select! {
            recv(command_rx) -> command => match command {
                Ok(EngineCommand::Shutdown) | Err(_) => break,
                Ok(command) => state.handle_command(command),
            },
            recv(main_loop.receiver()) -> task => {
                if let Ok(task) = task {
                    task();
                }
            },
            recv(completion_rx) -> completion => {
                if let Ok(completion) = completion {
                    state.on_generation_complete(completion);
                }
            },
            recv(notice_rx) -> notice => {
                if let Ok(notice) = notice {
                    state.on_driver_notice(notice);
                }
            },
        }
    }
    info!("engine stopped");
}

impl EngineState {
    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Generate { prompt } => self.generate(prompt),
            EngineCommand::Replay => {
                if self.store.generation() == 0 {
                    self.send(EngineUpdate::Error {
                        message: "Nothing to replay yet".into(),
                    });
                    return;
                }
                debug!("replay requested");
                self.control.request_replay();
            }
            EngineCommand::SetTempo(bpm) => {
                if self.control.set_bpm(bpm) {
                    info!(bpm, "tempo changed");
                } else {
                    self.send(EngineUpdate::Error {
                        message: format!("Invalid tempo: {bpm}"),
                    });
                }
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn generate(&mut self, prompt: String) {
        let completion_tx = self.completion_tx.clone();
        let for_callback = prompt.clone();
        let started = self.generator.try_generate(&prompt, move |result| {
            let _ = completion_tx.send(Completion {
                prompt: for_callback,
                result,
            });
        });

        match started {
            Ok(()) if self.generator.is_busy() => {
                self.send(EngineUpdate::GenerationStarted { prompt });
            }
            Ok(()) => {}
            Err(e) => self.send(EngineUpdate::Error {
                message: e.to_string(),
            }),
        }
    }

    fn on_generation_complete(&mut self, completion: Completion) {
        match completion.result {
            Ok(response) => {
                let note_count = self.store.note_count();
                self.pending_entry = Some(PendingEntry {
                    generation: self.store.generation(),
                    prompt: completion.prompt,
                    response,
                });
                self.control.request_new();
                self.send(EngineUpdate::GenerationFinished { note_count });
            }
            Err(e) => {
                warn!("generation failed: {e}");
                self.send(EngineUpdate::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    fn on_driver_notice(&mut self, notice: DriverNotice) {
        let DriverNotice::SequenceFinished {
            generation,
            replay,
            bpm,
        } = notice;
        debug!(generation, replay, bpm, "sequence finished");

        if replay {
            let midi_file = self.history.latest().and_then(|entry| entry.midi_file);
            self.send(EngineUpdate::SequenceFinished { replay, midi_file });
            return;
        }

        let matches_pending = self
            .pending_entry
            .as_ref()
            .is_some_and(|pending| pending.generation == generation);
        let pending = if matches_pending {
            self.pending_entry.take()
        } else {
            None
        };

        let mut midi_file = None;
        if let Some(pending) = pending {
            if self.store.generation() == generation {
                match self
                    .midi_files
                    .write(&self.store.notes(), bpm, self.channel)
                {
                    Ok(path) => midi_file = path,
                    Err(e) => error!("{e}"),
                }
            }

            self.history
                .add(ChatEntry::new(pending.prompt, pending.response, midi_file.clone()));
            if let Err(e) = self.history.save() {
                warn!("could not save history: {e}");
            }
        }

        self.send(EngineUpdate::SequenceFinished { replay, midi_file });
    }

    fn send(&self, update: EngineUpdate) {
        let _ = self.update_tx.send(update);
    }
}
