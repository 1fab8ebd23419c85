use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::driver::DEFAULT_BPM;
use crate::generator::{DEFAULT_ENDPOINT, DEFAULT_MAX_REDIRECTS, DEFAULT_MODEL, DEFAULT_TIMEOUT};
use crate::timing::DEFAULT_TRIGGER_DELAY_SAMPLES;

pub const API_KEY_ENV: &str = "KIWI_OPENAI_API_KEY";
pub const CONFIG_DIR_ENV: &str = "KIWI_CONFIG_DIR";
pub const ENDPOINT_ENV: &str = "KIWI_ENDPOINT";
pub const MODEL_ENV: &str = "KIWI_MODEL";

const CONFIG_FILE: &str = "config.ron";
const API_KEY_FILE: &str = "openai_api_key.txt";
const HISTORY_FILE: &str = "history.ron";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: String,
    pub model: String,
    pub bpm: f64,
    pub trigger_delay_samples: u64,
    /// 1..=16
    pub midi_channel: u8,
    /// Substring of the MIDI output port name. First port if unset.
    pub midi_port: Option<String>,
    pub history_file: Option<PathBuf>,
    /// Where finished phrases are written. System temp dir if unset.
    pub midi_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_redirects: u32,
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            bpm: DEFAULT_BPM,
            trigger_delay_samples: DEFAULT_TRIGGER_DELAY_SAMPLES,
            midi_channel: 1,
            midi_port: None,
            history_file: None,
            midi_dir: None,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            config_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Loads `config.ron` from the config directory, then applies
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&default_config_dir())?;
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            config.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var(MODEL_ENV) {
            config.model = model;
        }
        Ok(config)
    }

    /// A missing file means defaults.
    pub fn load_from(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        let mut config = if path.is_file() {
            info!("loading config from {}", path.display());
            ron::from_str::<Config>(&fs::read_to_string(&path)?)?
        } else {
            debug!("no config at {}, using defaults", path.display());
            Config::default()
        };
        config.config_dir = dir.to_path_buf();
        config.midi_channel = config.midi_channel.clamp(1, 16);
        Ok(config)
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_file
            .clone()
            .unwrap_or_else(|| self.config_dir.join(HISTORY_FILE))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `KIWI_OPENAI_API_KEY`, falling back to `openai_api_key.txt` in the
    /// config directory.
    pub fn load_api_key(&self) -> Option<String> {
        resolve_api_key(std::env::var(API_KEY_ENV).ok(), &self.config_dir)
    }
}

fn default_config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("kiwi"),
        None => PathBuf::from("."),
    }
}

fn resolve_api_key(from_env: Option<String>, dir: &Path) -> Option<String> {
    if let Some(key) = from_env.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()) {
        debug!("API key loaded from {API_KEY_ENV} ({} chars)", key.len());
        return Some(key);
    }

    let path = dir.join(API_KEY_FILE);
    let key = fs::read_to_string(&path).ok()?.trim().to_string();
    if key.is_empty() {
        debug!("API key file {} is empty", path.display());
        return None;
    }
    debug!("API key loaded from {} ({} chars)", path.display(), key.len());
    Some(key)
}
