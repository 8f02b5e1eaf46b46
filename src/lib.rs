//! Playlist engine: an ordered registry of playlists with background metadata
//! scanning, coalesced change notifications, playback ordering and
//! persistence.

pub mod config;
mod config_persistence;
pub mod db_manager;
pub mod engine;
pub mod entry;
pub mod media_file_discovery;
pub mod persistence;
mod playlist;
pub mod probe;
pub mod protocol;
mod registry;
mod scan;
pub mod sort;
pub mod title_format;
pub mod tuple;
mod update;

pub use config::EngineConfig;
pub use db_manager::DbManager;
pub use engine::{Engine, ReadMode, SelectPatterns};
pub use entry::{DerivedInfo, PlaylistAddItem};
pub use persistence::{JsonPlaylistStore, PersistenceError, PlaylistStore};
pub use playlist::{DEFAULT_TITLE, TEMPORARY_TITLE};
pub use probe::{DecoderHandle, LoftyProbe, Probe, ProbeOutcome, ProbeRequest};
pub use protocol::{EngineEvent, PlaylistId, Update, UpdateLevel};
pub use sort::SortType;
pub use tuple::Tuple;
