pub mod audio;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod generator;
pub mod history;
pub mod main_context;
pub mod midi_file;
pub mod store;
pub mod timing;

pub use config::Config;
pub use driver::{DriverState, PlaybackControl};
pub use engine::{EngineCommand, EngineHandle, EngineUpdate, spawn_engine};
pub use error::GenerateError;
pub use generator::{Generator, UreqTransport};
pub use store::SequenceStore;
