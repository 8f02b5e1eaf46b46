//! Expands user-supplied paths into playlist additions.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use log::debug;

pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 9] =
    ["mp3", "wav", "ogg", "opus", "flac", "aac", "m4a", "mp4", "wv"];

pub const PLAYLIST_FILE_EXTENSION: &str = "json";

/// One thing found while expanding a path list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered {
    /// Filename or URI to add as an entry.
    Track(String),
    /// Saved playlist file to import.
    Playlist(PathBuf),
}

fn has_extension(path: &Path, candidates: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            candidates
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

pub fn is_supported_audio_file(path: &Path) -> bool {
    has_extension(path, &SUPPORTED_AUDIO_EXTENSIONS)
}

pub fn is_playlist_file(path: &Path) -> bool {
    has_extension(path, &[PLAYLIST_FILE_EXTENSION])
}

/// Audio files below `folder_path`, sorted in natural order.
pub fn collect_audio_files_from_folder(folder_path: &Path) -> Vec<PathBuf> {
    let mut pending_directories = vec![folder_path.to_path_buf()];
    let mut tracks = Vec::new();

    while let Some(directory) = pending_directories.pop() {
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Discovery: cannot read {}: {}", directory.display(), err);
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        "Discovery: bad directory entry in {}: {}",
                        directory.display(),
                        err
                    );
                    continue;
                }
            };

            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    debug!("Discovery: cannot inspect {}: {}", path.display(), err);
                    continue;
                }
            };

            if file_type.is_dir() {
                pending_directories.push(path);
                continue;
            }

            if file_type.is_file() && is_supported_audio_file(&path) {
                tracks.push(path);
            }
        }
    }

    tracks.sort_by(|a, b| {
        crate::sort::compare_natural(&a.to_string_lossy(), &b.to_string_lossy())
    });
    tracks
}

/// Expands `inputs` in order. URIs pass through untouched, folders expand
/// to their audio files, and playlist files are reported for import.
/// Duplicates after the first occurrence are dropped.
pub fn discover(inputs: &[String]) -> Vec<Discovered> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let mut push_track = |filename: String, found: &mut Vec<Discovered>| {
        if seen.insert(filename.clone()) {
            found.push(Discovered::Track(filename));
        }
    };

    for input in inputs {
        if input.contains("://") && !input.starts_with("file://") {
            push_track(input.clone(), &mut found);
            continue;
        }
        let Some(path) = crate::tuple::local_path(input) else {
            continue;
        };
        if path.is_dir() {
            for track in collect_audio_files_from_folder(&path) {
                push_track(track.to_string_lossy().into_owned(), &mut found);
            }
        } else if is_playlist_file(&path) {
            found.push(Discovered::Playlist(path));
        } else if path.is_file() && is_supported_audio_file(&path) {
            push_track(path.to_string_lossy().into_owned(), &mut found);
        } else {
            debug!("Discovery: skipping unsupported input {}", input);
        }
    }
    found
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
        let dir = std::env::temp_dir().join(format!("tracklist_discover_{}_{}", name, nonce));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn test_supported_extensions_are_case_insensitive() {
        assert!(is_supported_audio_file(Path::new("/a/B.FLAC")));
        assert!(!is_supported_audio_file(Path::new("/a/cover.jpg")));
        assert!(is_playlist_file(Path::new("/a/mix.JSON")));
    }

    #[test]
    fn test_folder_expansion_is_recursive_and_natural_ordered() {
        let dir = unique_temp_dir("folder");
        std::fs::create_dir_all(dir.join("disc")).expect("create subdir");
        for name in ["track10.mp3", "track2.mp3", "notes.txt", "disc/track1.flac"] {
            std::fs::write(dir.join(name), b"").expect("write file");
        }

        let tracks = collect_audio_files_from_folder(&dir);
        let names: Vec<String> = tracks
            .iter()
            .map(|path| {
                path.strip_prefix(&dir)
                    .expect("inside dir")
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names.len(), 3);
        let track2 = names.iter().position(|name| name == "track2.mp3");
        let track10 = names.iter().position(|name| name == "track10.mp3");
        assert!(track2 < track10);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_discover_keeps_uris_playlists_and_drops_duplicates() {
        let dir = unique_temp_dir("inputs");
        let song = dir.join("song.ogg");
        let list = dir.join("mix.json");
        std::fs::write(&song, b"").expect("write song");
        std::fs::write(&list, b"{}").expect("write list");
        let song_text = song.to_string_lossy().into_owned();

        let found = discover(&[
            "http://radio.example/stream".to_string(),
            song_text.clone(),
            list.to_string_lossy().into_owned(),
            song_text.clone(),
            dir.join("missing.txt").to_string_lossy().into_owned(),
        ]);
        assert_eq!(
            found,
            vec![
                Discovered::Track("http://radio.example/stream".to_string()),
                Discovered::Track(song_text),
                Discovered::Playlist(list),
            ]
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
