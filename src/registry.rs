//! The set of all playlists and their unique-id table.

use std::collections::HashMap;

use crate::playlist::Playlist;
use crate::protocol::PlaylistId;

const FIRST_UNIQUE_ID: i32 = 1000;

#[derive(Debug)]
pub struct Registry {
    pub(crate) playlists: Vec<Playlist>,
    /// Every id ever handed out. A deleted playlist's id maps to `None` so it
    /// is not recycled for a new playlist.
    unique_ids: HashMap<PlaylistId, Option<usize>>,
    next_unique_id: i32,
    pub(crate) active: Option<PlaylistId>,
    pub(crate) playing: Option<PlaylistId>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            playlists: Vec::new(),
            unique_ids: HashMap::new(),
            next_unique_id: FIRST_UNIQUE_ID,
            active: None,
            playing: None,
        }
    }

    fn allocate_id(&mut self, preferred: Option<PlaylistId>) -> PlaylistId {
        if let Some(preferred) = preferred {
            if preferred.0 >= 0 && !self.unique_ids.contains_key(&preferred) {
                return preferred;
            }
        }
        while self
            .unique_ids
            .contains_key(&PlaylistId(self.next_unique_id))
        {
            self.next_unique_id += 1;
        }
        let id = PlaylistId(self.next_unique_id);
        self.next_unique_id += 1;
        id
    }

    fn renumber(&mut self, from: usize) {
        for (number, playlist) in self.playlists.iter_mut().enumerate().skip(from) {
            playlist.number = number;
            self.unique_ids.insert(playlist.unique_id, Some(number));
        }
    }

    pub fn len(&self) -> usize {
        self.playlists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.playlists.is_empty()
    }

    /// Inserts a fresh playlist at `at` (out of range appends). The preferred
    /// id is honored only if it has never been used.
    pub(crate) fn insert(&mut self, at: Option<usize>, preferred: Option<PlaylistId>) -> usize {
        let at = at
            .filter(|at| *at <= self.playlists.len())
            .unwrap_or(self.playlists.len());
        let id = self.allocate_id(preferred);
        self.playlists.insert(at, Playlist::new(id));
        self.renumber(at);
        at
    }

    /// Detaches the playlist at `number`. The registry is left empty if it
    /// was the last one; callers re-seed it.
    pub(crate) fn remove(&mut self, number: usize) -> Option<Playlist> {
        if number >= self.playlists.len() {
            return None;
        }
        let playlist = self.playlists.remove(number);
        self.unique_ids.insert(playlist.unique_id, None);
        self.renumber(number);
        Some(playlist)
    }

    /// Moves `count` playlists starting at `from` so they start at `to`.
    pub(crate) fn reorder(&mut self, from: usize, to: usize, count: usize) -> bool {
        let len = self.playlists.len();
        if from + count > len || to + count > len {
            return false;
        }
        let moved: Vec<Playlist> = self.playlists.drain(from..from + count).collect();
        let tail = self.playlists.split_off(to);
        self.playlists.extend(moved);
        self.playlists.extend(tail);
        self.renumber(from.min(to));
        true
    }

    pub fn number_of(&self, id: PlaylistId) -> Option<usize> {
        self.unique_ids.get(&id).copied().flatten()
    }

    pub fn get(&self, id: PlaylistId) -> Option<&Playlist> {
        self.number_of(id).and_then(|number| self.playlists.get(number))
    }

    pub(crate) fn get_mut(&mut self, id: PlaylistId) -> Option<&mut Playlist> {
        let number = self.number_of(id)?;
        self.playlists.get_mut(number)
    }

    pub fn at(&self, number: usize) -> Option<&Playlist> {
        self.playlists.get(number)
    }

    pub fn ids(&self) -> Vec<PlaylistId> {
        self.playlists
            .iter()
            .map(|playlist| playlist.unique_id)
            .collect()
    }

    /// Drops every playlist and forgets all ids.
    pub(crate) fn clear(&mut self) {
        self.playlists.clear();
        self.unique_ids.clear();
        self.next_unique_id = FIRST_UNIQUE_ID;
        self.active = None;
        self.playing = None;
    }
}
