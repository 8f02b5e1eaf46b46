//! Notification-bus protocol shared by the engine and its listeners.
//!
//! This module defines the payloads published on the engine's broadcast bus
//! and the plain value types exchanged with persistence and UI callers.

use std::fmt;
use std::path::PathBuf;

/// Stable playlist identity, persisted across runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct PlaylistId(pub i32);

impl fmt::Display for PlaylistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity of a coalesced playlist change.
///
/// Ordered so that a higher level implies every guarantee of the lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateLevel {
    Selection,
    Metadata,
    Structure,
}

/// Accumulated change window for one playlist.
///
/// `before` counts untouched entries at the head of the playlist and `after`
/// counts untouched entries at the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Update {
    pub level: Option<UpdateLevel>,
    pub before: usize,
    pub after: usize,
    pub queue_changed: bool,
}

impl Update {
    pub fn is_pending(&self) -> bool {
        self.level.is_some()
    }
}

/// Events published to every bus subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// One coalesced flush; carries the highest level seen since the last one.
    Update(UpdateLevel),
    PositionChanged(PlaylistId),
    /// Every scanning playlist has drained; deduplicated per flush.
    ScanComplete,
    ActivePlaylistChanged,
    PlayingPlaylistChanged,
    PlaybackBegin,
    PlaybackStop,
    /// A tuple-based sort was refused because metadata is still missing.
    SortRefused(PlaylistId),
    PersistenceFailed {
        path: PathBuf,
        error: String,
    },
}

/// How a playlist should resume on the next start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    Stop,
    Play,
    Pause,
}

impl ResumeMode {
    pub fn code(self) -> i64 {
        match self {
            Self::Stop => 0,
            Self::Play => 1,
            Self::Pause => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Stop,
            2 => Self::Pause,
            _ => Self::Play,
        }
    }
}

/// Per-playlist resume record.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistResume {
    pub id: PlaylistId,
    pub position: Option<usize>,
    pub resume: ResumeMode,
    pub resume_time_ms: i64,
}

/// Snapshot of registry-wide resume state, persisted between sessions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionState {
    pub active: Option<PlaylistId>,
    pub playing: Option<PlaylistId>,
    pub playlists: Vec<PlaylistResume>,
}
