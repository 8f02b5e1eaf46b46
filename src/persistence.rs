//! Playlist file storage.
//!
//! A playlist file is a small JSON document holding the title and, per
//! entry, the filename plus the metadata tuple when one was known. A
//! registry directory holds one `<id>.json` per playlist and an `order` file
//! listing the ids in display order.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use crate::entry::PlaylistAddItem;
use crate::protocol::PlaylistId;
use crate::tuple::Tuple;

const PLAYLIST_SCHEMA_VERSION: u32 = 1;
pub const ORDER_FILE: &str = "order";
const PLAYLIST_EXTENSION: &str = "json";

#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Parse(String),
    Database(rusqlite::Error),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::Parse(message) => write!(f, "parse error: {}", message),
            Self::Database(err) => write!(f, "database error: {}", err),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(_) => None,
            Self::Database(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

/// One entry as handed to a store for saving.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedEntry {
    pub filename: Arc<str>,
    pub tuple: Option<Arc<Tuple>>,
}

/// What loading a playlist file yields.
#[derive(Debug, Clone)]
pub struct PlaylistContents {
    pub title: String,
    pub items: Vec<PlaylistAddItem>,
}

/// Load/save boundary for playlist files.
pub trait PlaylistStore: Send + Sync {
    fn load(&self, path: &Path) -> Result<PlaylistContents, PersistenceError>;
    fn save(&self, path: &Path, title: &str, entries: &[SavedEntry]) -> Result<(), PersistenceError>;
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct PlaylistFileEntry {
    filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tuple: Option<Tuple>,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct PlaylistFile {
    schema_version: u32,
    title: String,
    entries: Vec<PlaylistFileEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPlaylistStore;

impl PlaylistStore for JsonPlaylistStore {
    fn load(&self, path: &Path) -> Result<PlaylistContents, PersistenceError> {
        let contents = fs::read_to_string(path)?;
        let parsed: PlaylistFile = serde_json::from_str(&contents)?;
        if parsed.schema_version != PLAYLIST_SCHEMA_VERSION {
            return Err(PersistenceError::Parse(format!(
                "unsupported playlist schema version {}",
                parsed.schema_version
            )));
        }
        debug!(
            "Persistence: loaded {} entries from {}",
            parsed.entries.len(),
            path.display()
        );
        Ok(PlaylistContents {
            title: parsed.title,
            items: parsed
                .entries
                .into_iter()
                .map(|entry| PlaylistAddItem {
                    filename: entry.filename,
                    tuple: entry.tuple,
                    decoder: None,
                })
                .collect(),
        })
    }

    fn save(&self, path: &Path, title: &str, entries: &[SavedEntry]) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = PlaylistFile {
            schema_version: PLAYLIST_SCHEMA_VERSION,
            title: title.to_string(),
            entries: entries
                .iter()
                .map(|entry| PlaylistFileEntry {
                    filename: entry.filename.to_string(),
                    tuple: entry.tuple.as_deref().cloned(),
                })
                .collect(),
        };
        let serialized = serde_json::to_string_pretty(&file)?;

        // Write beside the target and rename so a crash never leaves a torn file.
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serialized)?;
        fs::rename(&staging, path)?;
        Ok(())
    }
}

pub fn playlist_path(dir: &Path, id: PlaylistId) -> PathBuf {
    dir.join(format!("{}.{}", id, PLAYLIST_EXTENSION))
}

pub fn write_order(dir: &Path, ids: &[PlaylistId]) -> Result<(), PersistenceError> {
    fs::create_dir_all(dir)?;
    let text = ids
        .iter()
        .map(PlaylistId::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    fs::write(dir.join(ORDER_FILE), text)?;
    Ok(())
}

/// Ids listed in the `order` file. Unparseable tokens are skipped.
pub fn read_order(dir: &Path) -> Result<Vec<PlaylistId>, PersistenceError> {
    let text = fs::read_to_string(dir.join(ORDER_FILE))?;
    Ok(text
        .split_whitespace()
        .filter_map(|token| match token.parse::<i32>() {
            Ok(id) => Some(PlaylistId(id)),
            Err(_) => {
                warn!("Persistence: ignoring bad playlist id {:?} in order file", token);
                None
            }
        })
        .collect())
}

/// Deletes playlist files in `dir` whose id is not in `keep`.
pub fn remove_stale_playlists(dir: &Path, keep: &[PlaylistId]) -> Result<usize, PersistenceError> {
    let keep: HashSet<String> = keep.iter().map(PlaylistId::to_string).collect();
    let mut removed = 0;
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(PLAYLIST_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if keep.contains(stem) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(
                "Persistence: failed to remove stale playlist {}: {}",
                path.display(),
                err
            ),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(name: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir().join(format!("tracklist_persist_{}_{}", name, nonce));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn test_save_and_load_keeps_title_order_and_tuples() {
        let dir = unique_temp_dir("file");
        let path = dir.join("list.json");
        let tuple = Tuple {
            title: Some("Intro".to_string()),
            length_ms: Some(61_000),
            ..Tuple::default()
        };
        let entries = vec![
            SavedEntry {
                filename: Arc::from("/music/a.flac"),
                tuple: Some(Arc::new(tuple.clone())),
            },
            SavedEntry {
                filename: Arc::from("/music/b.flac"),
                tuple: None,
            },
        ];
        JsonPlaylistStore
            .save(&path, "Mix", &entries)
            .expect("save should succeed");

        let loaded = JsonPlaylistStore.load(&path).expect("load should succeed");
        assert_eq!(loaded.title, "Mix");
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.items[0].filename, "/music/a.flac");
        assert_eq!(loaded.items[0].tuple.as_ref(), Some(&tuple));
        assert!(loaded.items[1].tuple.is_none());
        assert!(!dir.join("list.json.tmp").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_reports_corrupt_and_missing_files() {
        let dir = unique_temp_dir("corrupt");
        let path = dir.join("bad.json");
        fs::write(&path, "{ not json").expect("write corrupt file");
        assert!(matches!(
            JsonPlaylistStore.load(&path),
            Err(PersistenceError::Parse(_))
        ));
        assert!(matches!(
            JsonPlaylistStore.load(&dir.join("absent.json")),
            Err(PersistenceError::Io(_))
        ));

        fs::write(
            &path,
            r#"{"schema_version": 99, "title": "x", "entries": []}"#,
        )
        .expect("write future file");
        let err = JsonPlaylistStore.load(&path).unwrap_err();
        assert!(err.to_string().contains("schema version 99"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_order_file_and_stale_cleanup() {
        let dir = unique_temp_dir("order");
        write_order(&dir, &[PlaylistId(1001), PlaylistId(1000)]).expect("write order");
        assert_eq!(
            read_order(&dir).expect("read order"),
            vec![PlaylistId(1001), PlaylistId(1000)]
        );

        for id in [1000, 1001, 1002] {
            fs::write(playlist_path(&dir, PlaylistId(id)), "{}").expect("write playlist");
        }
        let removed = remove_stale_playlists(&dir, &[PlaylistId(1000), PlaylistId(1001)])
            .expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!playlist_path(&dir, PlaylistId(1002)).exists());
        assert!(dir.join(ORDER_FILE).exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
