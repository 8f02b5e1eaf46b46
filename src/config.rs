//! Persistent engine configuration model and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::title_format::DEFAULT_TITLE_FORMAT;

pub const MAX_SCAN_THREADS: usize = 32;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    /// Background metadata scanning.
    pub scan: ScanConfig,
    #[serde(default)]
    /// Next/previous and deletion policies.
    pub playback: PlaybackConfig,
    #[serde(default)]
    /// Entry title formatting.
    pub display: DisplayConfig,
    #[serde(default)]
    /// Logging and storage locations.
    pub general: GeneralConfig,
}

/// Background scan preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ScanConfig {
    /// Upper bound on concurrent background probes across all playlists.
    #[serde(default = "default_scan_threads")]
    pub threads: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defer metadata reads until an entry is played.
    #[serde(default)]
    pub metadata_on_play: bool,
    #[serde(default)]
    pub update_delay_ms: u64,
    /// Batching delay for updates caused by scan results.
    #[serde(default = "default_scan_update_delay_ms")]
    pub scan_update_delay_ms: u64,
}

/// Playback-order preferences.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub shuffle: bool,
    /// Shuffle whole albums, playing each one in playlist order.
    #[serde(default)]
    pub album_shuffle: bool,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub advance_on_delete: bool,
    #[serde(default)]
    pub always_resume_paused: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DisplayConfig {
    #[serde(default = "default_title_format")]
    pub title_format: String,
    /// Fill missing artist/album from the grandparent/parent folder names.
    #[serde(default = "default_true")]
    pub metadata_fallbacks: bool,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    /// Overrides the directory holding playlists and resume state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Off => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threads: default_scan_threads(),
            enabled: true,
            metadata_on_play: false,
            update_delay_ms: 0,
            scan_update_delay_ms: default_scan_update_delay_ms(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            title_format: default_title_format(),
            metadata_fallbacks: true,
        }
    }
}

impl ScanConfig {
    pub fn update_delay(&self) -> Duration {
        Duration::from_millis(self.update_delay_ms)
    }

    pub fn scan_update_delay(&self) -> Duration {
        Duration::from_millis(self.scan_update_delay_ms)
    }
}

impl EngineConfig {
    /// Reads `path`, falling back to defaults when it is missing or invalid.
    pub fn load(path: &Path) -> Self {
        crate::config_persistence::load_config_file(path)
    }

    pub fn save(&self, path: &Path) {
        crate::config_persistence::persist_config_file(self, path);
    }

    /// Directory for playlists and resume state.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.general
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("tracklist")))
    }
}

fn default_true() -> bool {
    true
}

fn default_scan_threads() -> usize {
    2
}

fn default_scan_update_delay_ms() -> u64 {
    250
}

fn default_title_format() -> String {
    DEFAULT_TITLE_FORMAT.to_string()
}

/// Clamps values into ranges the engine can honor.
pub fn sanitize_config(config: EngineConfig) -> EngineConfig {
    let mut config = config;
    config.scan.threads = config.scan.threads.clamp(1, MAX_SCAN_THREADS);
    if config.display.title_format.trim().is_empty() {
        config.display.title_format = default_title_format();
    }
    config
}
