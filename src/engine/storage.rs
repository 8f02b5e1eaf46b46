//! Saving and restoring the registry: playlist files through the configured
//! `PlaylistStore`, resume state through `DbManager`. File I/O always runs
//! outside the engine lock.

use std::path::Path;

use log::{info, warn};

use super::{Engine, EngineState};
use crate::db_manager::DbManager;
use crate::persistence::{
    playlist_path, read_order, remove_stale_playlists, write_order, PersistenceError,
    PlaylistContents, SavedEntry,
};
use crate::playlist::Playlist;
use crate::protocol::{EngineEvent, PlaylistId, PlaylistResume, ResumeMode, SessionState};

struct PlaylistSnapshot {
    id: PlaylistId,
    title: String,
    entries: Vec<SavedEntry>,
}

impl PlaylistSnapshot {
    fn of(playlist: &Playlist) -> Self {
        Self {
            id: playlist.unique_id,
            title: playlist.title.clone(),
            entries: playlist
                .entries
                .iter()
                .map(|entry| SavedEntry {
                    filename: entry.filename.clone(),
                    // Fallback tuples of failed entries are not worth keeping.
                    tuple: if entry.failed { None } else { entry.tuple.clone() },
                })
                .collect(),
        }
    }
}

impl EngineState {
    fn session_snapshot(&self) -> SessionState {
        let playing = self.registry.playing;
        SessionState {
            active: self.registry.active,
            playing,
            playlists: self
                .registry
                .playlists
                .iter()
                .map(|playlist| {
                    let is_playing = playing == Some(playlist.unique_id);
                    PlaylistResume {
                        id: playlist.unique_id,
                        position: playlist.position_index(),
                        resume: match (is_playing, self.playback.paused) {
                            (false, _) => ResumeMode::Stop,
                            (true, true) => ResumeMode::Pause,
                            (true, false) => ResumeMode::Play,
                        },
                        resume_time_ms: if is_playing {
                            self.playback.time_ms
                        } else {
                            playlist.resume_time_ms
                        },
                    }
                })
                .collect(),
        }
    }

    fn apply_session(&mut self, session: SessionState) {
        if let Some(active) = session.active.filter(|id| self.registry.get(*id).is_some()) {
            self.registry.active = Some(active);
        } else {
            self.registry.active = self.registry.at(0).map(|first| first.unique_id);
        }
        self.resume_playlist = session.playing;
        self.resume_paused = false;

        for resume in session.playlists {
            let Some(target) = self.registry.get_mut(resume.id) else {
                continue;
            };
            if let Some(position) = resume.position.filter(|position| *position < target.len()) {
                let id = target.entries[position].id;
                target.set_position(Some(id), true);
            }
            target.resume_time_ms = resume.resume_time_ms;
            if self.resume_playlist == Some(resume.id) {
                match resume.resume {
                    ResumeMode::Stop => self.resume_playlist = None,
                    ResumeMode::Pause => self.resume_paused = true,
                    ResumeMode::Play => {}
                }
            }
        }
        if self
            .resume_playlist
            .is_some_and(|id| self.registry.get(id).is_none())
        {
            self.resume_playlist = None;
        }

        for target in &mut self.registry.playlists {
            let focus = target.position_index().or(if target.is_empty() { None } else { Some(0) });
            if let Some(index) = focus {
                target.set_focus(Some(index));
                target.select(index, true);
            }
            target.next_update = Default::default();
            target.last_update = Default::default();
        }
        self.updates.cancel();
    }

    fn install_loaded(&mut self, loaded: Vec<(PlaylistId, Option<PlaylistContents>)>) {
        let only_initial_blank =
            self.registry.len() == 1 && self.registry.playlists[0].is_blank();
        if only_initial_blank && !loaded.is_empty() {
            self.registry.clear();
        }

        for (preferred, contents) in loaded {
            let id = self.insert_playlist_locked(None, Some(preferred));
            if let Some(contents) = contents {
                if let Some(target) = self.registry.get_mut(id) {
                    target.title = contents.title;
                }
                self.insert_entries(id, None, contents.items);
            }
            if let Some(target) = self.registry.get_mut(id) {
                target.modified = false;
            }
        }

        if self
            .registry
            .active
            .is_none_or(|id| self.registry.get(id).is_none())
        {
            self.registry.active = self.registry.at(0).map(|first| first.unique_id);
        }
        self.emit(EngineEvent::ActivePlaylistChanged);
    }
}

impl Engine {
    fn report_persistence_failure(&self, path: &Path, err: &PersistenceError) {
        warn!("Persistence: {} failed: {}", path.display(), err);
        let event = EngineEvent::PersistenceFailed {
            path: path.to_path_buf(),
            error: err.to_string(),
        };
        self.core().with_state(|state| state.emit(event));
    }

    /// Writes every modified playlist to `dir`, rewrites the order file and
    /// deletes files of playlists that no longer exist. Returns how many
    /// playlists were written.
    pub fn save_playlists(&self, dir: &Path) -> Result<usize, PersistenceError> {
        let (ids, dirty) = self.core().with_state(|state| {
            let ids = state.registry.ids();
            let dirty: Vec<PlaylistSnapshot> = state
                .registry
                .playlists
                .iter_mut()
                .filter(|playlist| playlist.modified)
                .map(|playlist| {
                    playlist.modified = false;
                    PlaylistSnapshot::of(playlist)
                })
                .collect();
            (ids, dirty)
        });

        std::fs::create_dir_all(dir)?;
        let mut saved = 0;
        for snapshot in dirty {
            let path = playlist_path(dir, snapshot.id);
            match self.core().store.save(&path, &snapshot.title, &snapshot.entries) {
                Ok(()) => saved += 1,
                Err(err) => {
                    self.report_persistence_failure(&path, &err);
                    self.core().with_state(|state| {
                        if let Some(target) = state.registry.get_mut(snapshot.id) {
                            target.modified = true;
                        }
                    });
                }
            }
        }

        write_order(dir, &ids)?;
        let removed = remove_stale_playlists(dir, &ids)?;
        info!(
            "Persistence: saved {} playlists to {} ({} stale files removed)",
            saved,
            dir.display(),
            removed
        );
        Ok(saved)
    }

    /// Restores the playlists listed in `dir`'s order file. A missing order
    /// file means nothing was saved yet. Unreadable playlists come back empty.
    pub fn load_playlists(&self, dir: &Path) -> Result<usize, PersistenceError> {
        let order = match read_order(dir) {
            Ok(order) => order,
            Err(PersistenceError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("Persistence: no saved playlists in {}", dir.display());
                return Ok(0);
            }
            Err(err) => return Err(err),
        };

        let mut loaded = Vec::with_capacity(order.len());
        for id in order {
            let path = playlist_path(dir, id);
            let contents = match self.core().store.load(&path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    self.report_persistence_failure(&path, &err);
                    None
                }
            };
            loaded.push((id, contents));
        }

        let count = loaded.len();
        self.core().with_state(|state| state.install_loaded(loaded));
        info!("Persistence: loaded {} playlists from {}", count, dir.display());
        Ok(count)
    }

    /// Appends the entries of a playlist file. A blank target also takes the
    /// file's title and remembers its path.
    pub fn import_playlist(&self, playlist: PlaylistId, path: &Path) -> Result<usize, PersistenceError> {
        let contents = self.core().store.load(path).inspect_err(|err| {
            self.report_persistence_failure(path, err);
        })?;
        Ok(self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return 0;
            };
            if target.is_blank() {
                target.title = contents.title;
                target.filename = Some(path.to_path_buf());
            }
            state.insert_entries(playlist, None, contents.items)
        }))
    }

    /// Writes one playlist to `path`. Returns false for an unknown playlist.
    pub fn export_playlist(&self, playlist: PlaylistId, path: &Path) -> Result<bool, PersistenceError> {
        let Some(snapshot) = self
            .core()
            .with_state(|state| state.registry.get(playlist).map(PlaylistSnapshot::of))
        else {
            return Ok(false);
        };
        self.core()
            .store
            .save(path, &snapshot.title, &snapshot.entries)
            .inspect_err(|err| self.report_persistence_failure(path, err))?;
        Ok(true)
    }

    pub fn save_state(&self, db: &mut DbManager) -> Result<(), PersistenceError> {
        let session = self.core().with_state(|state| state.session_snapshot());
        db.save_session(&session)
    }

    /// Restores active playlist, positions and the resume target. Call after
    /// `load_playlists`; records for unknown playlists are ignored.
    pub fn load_state(&self, db: &DbManager) -> Result<(), PersistenceError> {
        let session = db.load_session()?;
        self.core().with_state(|state| state.apply_session(session));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use super::super::tests::{items, scanned_items, settle, start, test_config, wait_for_event, FakeProbe};
    use super::*;
    use crate::config::EngineConfig;
    use crate::persistence::{JsonPlaylistStore, PlaylistStore};
    use crate::tuple::Tuple;

    const WAIT: Duration = Duration::from_secs(5);

    fn unique_temp_dir(name: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir().join(format!("tracklist_storage_{}_{}", name, nonce))
    }

    fn quiet_config() -> EngineConfig {
        let mut config = test_config();
        config.scan.enabled = false;
        config
    }

    /// Store that fails every save and records what it was asked to write.
    #[derive(Default)]
    struct FailingStore {
        attempts: Mutex<Vec<PathBuf>>,
    }

    impl PlaylistStore for FailingStore {
        fn load(&self, path: &Path) -> Result<PlaylistContents, PersistenceError> {
            JsonPlaylistStore.load(path)
        }

        fn save(&self, path: &Path, _title: &str, _entries: &[SavedEntry]) -> Result<(), PersistenceError> {
            self.attempts
                .lock()
                .expect("attempts lock")
                .push(path.to_path_buf());
            Err(PersistenceError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_playlists_survive_save_and_load() {
        let dir = unique_temp_dir("roundtrip");
        let (engine, _receiver) = start(quiet_config(), FakeProbe::with_delay(Duration::ZERO));
        let first = engine.active().expect("active playlist");
        engine.set_title(first, "Morning");
        engine.insert_entries(first, None, scanned_items(&["/m/a.mp3", "/m/b.mp3"]));
        let second = engine.new_playlist();
        engine.insert_entries(second, None, items(&["/m/c.mp3"]));

        assert_eq!(engine.save_playlists(&dir).expect("save"), 2);
        assert!(!engine.modified(first));
        assert_eq!(engine.save_playlists(&dir).expect("second save"), 0);

        let (restored, _receiver) = start(quiet_config(), FakeProbe::with_delay(Duration::ZERO));
        assert_eq!(restored.load_playlists(&dir).expect("load"), 2);
        assert_eq!(restored.playlist_ids(), vec![first, second]);
        assert_eq!(restored.active(), Some(first));
        assert_eq!(restored.title(first).as_deref(), Some("Morning"));
        assert_eq!(restored.entry_count(first), 2);
        assert_eq!(restored.total_length(first), 4000);
        assert_eq!(restored.entry_filename(second, 0).as_deref(), Some("/m/c.mp3"));
        assert!(restored
            .entry_tuple(second, 0, crate::engine::ReadMode::Guess)
            .is_none());
        assert!(!restored.modified(first));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_deleted_playlist_file_is_removed_on_save() {
        let dir = unique_temp_dir("stale");
        let (engine, _receiver) = start(quiet_config(), FakeProbe::with_delay(Duration::ZERO));
        let first = engine.active().expect("active playlist");
        let second = engine.new_playlist();
        engine.save_playlists(&dir).expect("save");
        assert!(playlist_path(&dir, second).exists());

        engine.delete_playlist(second);
        engine.save_playlists(&dir).expect("save again");
        assert!(!playlist_path(&dir, second).exists());
        assert!(playlist_path(&dir, first).exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_order_file_loads_nothing() {
        let dir = unique_temp_dir("empty");
        let (engine, _receiver) = start(quiet_config(), FakeProbe::with_delay(Duration::ZERO));
        assert_eq!(engine.load_playlists(&dir).expect("load"), 0);
        assert_eq!(engine.playlist_count(), 1);
    }

    #[test]
    fn test_corrupt_playlist_loads_empty_and_reports() {
        let dir = unique_temp_dir("corrupt");
        fs::create_dir_all(&dir).expect("create dir");
        write_order(&dir, &[PlaylistId(1005)]).expect("write order");
        fs::write(playlist_path(&dir, PlaylistId(1005)), "{ broken").expect("write playlist");

        let (engine, mut receiver) = start(quiet_config(), FakeProbe::with_delay(Duration::ZERO));
        assert_eq!(engine.load_playlists(&dir).expect("load"), 1);
        assert_eq!(engine.playlist_ids(), vec![PlaylistId(1005)]);
        assert_eq!(engine.entry_count(PlaylistId(1005)), 0);
        wait_for_event(&mut receiver, WAIT, |event| {
            matches!(event, EngineEvent::PersistenceFailed { .. })
        });
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_save_keeps_playlist_modified() {
        let dir = unique_temp_dir("failing");
        let store = Arc::new(FailingStore::default());
        let engine = Engine::with_store(
            quiet_config(),
            FakeProbe::with_delay(Duration::ZERO),
            store.clone(),
        )
        .expect("engine should start");
        let mut receiver = engine.subscribe();
        let playlist = engine.active().expect("active playlist");

        assert_eq!(engine.save_playlists(&dir).expect("order still written"), 0);
        assert!(engine.modified(playlist));
        assert_eq!(store.attempts.lock().expect("attempts lock").len(), 1);
        wait_for_event(&mut receiver, WAIT, |event| {
            matches!(event, EngineEvent::PersistenceFailed { error, .. } if error.contains("disk full"))
        });
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_import_and_export_playlist() {
        let dir = unique_temp_dir("export");
        let path = dir.join("mix.json");
        let (engine, _receiver) = start(quiet_config(), FakeProbe::with_delay(Duration::ZERO));
        let source = engine.active().expect("active playlist");
        engine.set_title(source, "Mix");
        engine.insert_entries(source, None, scanned_items(&["/m/a.mp3"]));
        engine.insert_entries(source, None, items(&["/m/b.mp3"]));
        assert!(engine.export_playlist(source, &path).expect("export"));
        assert!(!engine
            .export_playlist(PlaylistId(99), &path)
            .expect("unknown playlist"));

        let target = engine.new_playlist();
        assert_eq!(engine.import_playlist(target, &path).expect("import"), 2);
        assert_eq!(engine.title(target).as_deref(), Some("Mix"));
        assert_eq!(engine.filename(target), Some(path.clone()));
        assert_eq!(engine.total_length(target), 2000);

        assert!(engine.import_playlist(target, &dir.join("absent.json")).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_session_state_round_trip() {
        let mut db = DbManager::new_in_memory().expect("open in-memory db");
        let (engine, mut receiver) = start(quiet_config(), FakeProbe::with_delay(Duration::ZERO));
        let first = engine.active().expect("active playlist");
        engine.insert_entries(first, None, scanned_items(&["/m/a.mp3", "/m/b.mp3"]));
        let second = engine.new_playlist();
        engine.insert_entries(second, None, scanned_items(&["/m/c.mp3", "/m/d.mp3", "/m/e.mp3"]));
        engine.set_position(first, Some(1));
        engine.set_position(second, Some(2));
        engine.play(Some(second), true);
        engine.report_playback_time(7_250);
        engine.set_active(first);
        engine.save_state(&mut db).expect("save state");

        engine.stop();
        engine.set_position(first, None);
        engine.set_position(second, Some(0));
        engine.set_active(second);
        settle(&engine, &mut receiver);

        engine.load_state(&db).expect("load state");
        assert_eq!(engine.active(), Some(first));
        assert_eq!(engine.position(first), Some(1));
        assert_eq!(engine.position(second), Some(2));
        assert_eq!(engine.focus(second), Some(2));
        assert!(engine.entry_selected(second, 2));
        assert!(!engine.update_pending(None));

        engine.resume();
        assert_eq!(engine.playing(), Some(second));
        assert!(engine.paused());
        assert_eq!(engine.playback_time(), 7_250);
        assert_eq!(engine.position(second), Some(2));
    }

    #[test]
    fn test_stopped_session_does_not_resume() {
        let mut db = DbManager::new_in_memory().expect("open in-memory db");
        let (engine, _receiver) = start(quiet_config(), FakeProbe::with_delay(Duration::ZERO));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, scanned_items(&["/m/a.mp3"]));
        engine.save_state(&mut db).expect("save state");

        engine.load_state(&db).expect("load state");
        engine.resume();
        assert_eq!(engine.playing(), None);
        assert!(!engine.set_playing_entry_tuple(Tuple::default()));
    }
}
