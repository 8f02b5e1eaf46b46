use std::path::Path;

use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use crate::persistence::PersistenceError;
use crate::protocol::{PlaylistId, PlaylistResume, ResumeMode, SessionState};

const KEY_ACTIVE: &str = "active";
const KEY_PLAYING: &str = "playing";

/// SQLite-backed store for registry-wide resume state.
pub struct DbManager {
    conn: Connection,
}

impl DbManager {
    pub fn new(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    pub fn new_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS resume_state (
                key TEXT PRIMARY KEY,
                value INTEGER
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS playlist_state (
                playlist_id INTEGER PRIMARY KEY,
                list_order INTEGER NOT NULL,
                position INTEGER,
                resume_state INTEGER NOT NULL,
                resume_time_ms INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Replaces the stored session with `state` in one transaction.
    pub fn save_session(&mut self, state: &SessionState) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM resume_state", [])?;
        tx.execute("DELETE FROM playlist_state", [])?;
        for (key, id) in [(KEY_ACTIVE, state.active), (KEY_PLAYING, state.playing)] {
            tx.execute(
                "INSERT INTO resume_state (key, value) VALUES (?1, ?2)",
                params![key, id.map(|id| id.0)],
            )?;
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO playlist_state
                    (playlist_id, list_order, position, resume_state, resume_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (order, playlist) in state.playlists.iter().enumerate() {
                stmt.execute(params![
                    playlist.id.0,
                    order as i64,
                    playlist.position.map(|position| position as i64),
                    playlist.resume.code(),
                    playlist.resume_time_ms,
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            "DbManager: saved resume state for {} playlists",
            state.playlists.len()
        );
        Ok(())
    }

    pub fn load_session(&self) -> Result<SessionState, PersistenceError> {
        let active = self.read_playlist_key(KEY_ACTIVE)?;
        let playing = self.read_playlist_key(KEY_PLAYING)?;

        let mut stmt = self.conn.prepare(
            "SELECT playlist_id, position, resume_state, resume_time_ms
             FROM playlist_state ORDER BY list_order",
        )?;
        let rows = stmt.query_map([], |row| {
            let position: Option<i64> = row.get(1)?;
            Ok(PlaylistResume {
                id: PlaylistId(row.get(0)?),
                position: position.and_then(|position| usize::try_from(position).ok()),
                resume: ResumeMode::from_code(row.get(2)?),
                resume_time_ms: row.get(3)?,
            })
        })?;

        let mut playlists = Vec::new();
        for playlist in rows {
            playlists.push(playlist?);
        }
        Ok(SessionState {
            active,
            playing,
            playlists,
        })
    }

    fn read_playlist_key(&self, key: &str) -> Result<Option<PlaylistId>, rusqlite::Error> {
        let value: Option<Option<i32>> = self
            .conn
            .query_row(
                "SELECT value FROM resume_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten().map(PlaylistId))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_database_loads_default_session() {
        let db = DbManager::new_in_memory().expect("open in-memory db");
        assert_eq!(db.load_session().expect("load"), SessionState::default());
    }

    #[test]
    fn test_save_session_replaces_previous_rows() {
        let mut db = DbManager::new_in_memory().expect("open in-memory db");
        let first = SessionState {
            active: Some(PlaylistId(1000)),
            playing: Some(PlaylistId(1001)),
            playlists: vec![
                PlaylistResume {
                    id: PlaylistId(1001),
                    position: Some(3),
                    resume: ResumeMode::Pause,
                    resume_time_ms: 42_500,
                },
                PlaylistResume {
                    id: PlaylistId(1000),
                    position: None,
                    resume: ResumeMode::Stop,
                    resume_time_ms: 0,
                },
            ],
        };
        db.save_session(&first).expect("save first");
        assert_eq!(db.load_session().expect("load first"), first);

        let second = SessionState {
            active: Some(PlaylistId(1000)),
            playing: None,
            playlists: vec![PlaylistResume {
                id: PlaylistId(1000),
                position: Some(0),
                resume: ResumeMode::Play,
                resume_time_ms: 10,
            }],
        };
        db.save_session(&second).expect("save second");
        assert_eq!(db.load_session().expect("load second"), second);
    }
}
