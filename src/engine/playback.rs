//! Playing-playlist tracking, position movement and the playback hooks the
//! engine raises for an external player.

use std::sync::Arc;

use log::debug;

use super::{Engine, EngineState, PlaybackState, ReadMode, UpdateFlags};
use crate::probe::DecoderHandle;
use crate::protocol::{EngineEvent, PlaylistId, UpdateLevel};
use crate::tuple::Tuple;

impl EngineState {
    /// Queues the positioned entry of the playing playlist on the priority
    /// path so its decoder and metadata are ready when the player asks.
    pub(super) fn start_playback(&mut self, time_ms: i64, paused: bool) {
        self.playback = PlaybackState { paused, time_ms };
        let Some(playing) = self.registry.playing else {
            return;
        };
        let Some(target) = self.registry.get(playing) else {
            return;
        };
        let Some(entry) = target.position_index().map(|index| &target.entries[index]) else {
            return;
        };
        debug!("Engine: starting playback of {} at {} ms", entry.filename, time_ms);
        self.scan.cancel(entry.id);
        self.scan.queue_entry(playing, entry, true);
    }

    pub(super) fn stop_playback(&mut self) {
        self.playback = PlaybackState::default();
    }

    /// Follows a position change in the playing playlist.
    pub(super) fn change_playback(&mut self) {
        let Some(playing) = self.registry.playing else {
            return;
        };
        let has_position = self
            .registry
            .get(playing)
            .and_then(|target| target.position_index())
            .is_some();
        if has_position {
            let paused = self.playback.paused;
            self.start_playback(0, paused);
            self.emit(EngineEvent::PlaybackBegin);
        } else {
            self.registry.playing = None;
            self.stop_playback();
            self.emit(EngineEvent::PlayingPlaylistChanged);
            self.emit(EngineEvent::PlaybackStop);
        }
    }

    pub(super) fn next_song_locked(&mut self, playlist: PlaylistId, repeat: bool, hint: usize) -> bool {
        let policy = self.advance_policy(repeat);
        let rng = &mut self.rng;
        let Some(target) = self.registry.get_mut(playlist) else {
            return false;
        };
        let Some(advanced) = target.next_song(policy, hint, rng) else {
            return false;
        };
        if let Some(index) = advanced.queue_popped {
            self.queue_update(
                UpdateLevel::Selection,
                Some(playlist),
                index,
                1,
                UpdateFlags::QUEUE_CHANGED,
            );
        }
        true
    }

    pub(super) fn play_locked(&mut self, playlist: Option<PlaylistId>, paused: bool) {
        let mut target = playlist.filter(|id| self.registry.get(*id).is_some());
        if target == self.registry.playing {
            if target.is_some() {
                self.playback.paused = paused;
            }
            return;
        }

        if let Some(outgoing) = self.registry.playing {
            let time_ms = self.playback.time_ms;
            if let Some(previous) = self.registry.get_mut(outgoing) {
                previous.resume_time_ms = time_ms;
            }
        }

        let mut position_changed = None;
        if let Some(id) = target {
            let has_position = self
                .registry
                .get(id)
                .and_then(|incoming| incoming.position_index())
                .is_some();
            if !has_position {
                if self.next_song_locked(id, true, 0) {
                    position_changed = Some(id);
                } else {
                    target = None;
                }
            }
        }

        self.registry.playing = target;
        match target.and_then(|id| self.registry.get(id)) {
            Some(incoming) => {
                let resume_time_ms = incoming.resume_time_ms;
                self.start_playback(resume_time_ms, paused);
            }
            None => self.stop_playback(),
        }

        if let Some(id) = position_changed {
            self.emit(EngineEvent::PositionChanged(id));
        }
        self.emit(EngineEvent::PlayingPlaylistChanged);
        self.emit(if target.is_some() {
            EngineEvent::PlaybackBegin
        } else {
            EngineEvent::PlaybackStop
        });
    }
}

impl Engine {
    /// Makes `playlist` the playing playlist, starting at its position (or
    /// the first entry the ordering policy picks). `None` stops playback.
    /// Selecting the already playing playlist only changes the pause state.
    pub fn play(&self, playlist: Option<PlaylistId>, paused: bool) {
        self.core()
            .with_state(|state| state.play_locked(playlist, paused));
    }

    pub fn stop(&self) {
        self.play(None, false);
    }

    pub fn playing(&self) -> Option<PlaylistId> {
        self.core().with_state(|state| state.registry.playing)
    }

    pub fn set_paused(&self, paused: bool) -> bool {
        self.core().with_state(|state| {
            if state.registry.playing.is_none() {
                return false;
            }
            state.playback.paused = paused;
            true
        })
    }

    pub fn paused(&self) -> bool {
        self.core().with_state(|state| state.playback.paused)
    }

    /// Player-reported playback time, remembered as the resume point.
    pub fn report_playback_time(&self, time_ms: i64) {
        self.core().with_state(|state| {
            if state.registry.playing.is_some() {
                state.playback.time_ms = time_ms.max(0);
            }
        });
    }

    pub fn playback_time(&self) -> i64 {
        self.core().with_state(|state| state.playback.time_ms)
    }

    /// Resumes whatever was playing when the session was saved.
    pub fn resume(&self) {
        self.core().with_state(|state| {
            let paused = state.config.playback.always_resume_paused || state.resume_paused;
            let playlist = state.resume_playlist;
            state.play_locked(playlist, paused);
        });
    }

    /// Moves the position to row `at`, or clears it with `None`. Returns
    /// false for an unknown playlist or an out-of-range row.
    pub fn set_position(&self, playlist: PlaylistId, at: Option<usize>) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            let id = match at {
                None => None,
                Some(at) => match target.entry(at) {
                    Some(entry) => Some(entry.id),
                    None => return false,
                },
            };
            target.set_position(id, true);
            state.emit(EngineEvent::PositionChanged(playlist));
            if state.registry.playing == Some(playlist) {
                state.change_playback();
            }
            true
        })
    }

    pub fn position(&self, playlist: PlaylistId) -> Option<usize> {
        self.core()
            .with_state(|state| state.registry.get(playlist)?.position_index())
    }

    /// Advances by the queue, shuffle or linear order. Returns false at the
    /// end of the playlist when `repeat` is off.
    pub fn next_song(&self, playlist: PlaylistId, repeat: bool) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get(playlist) else {
                return false;
            };
            let hint = target.position_index().map_or(0, |index| index + 1);
            if !state.next_song_locked(playlist, repeat, hint) {
                return false;
            }
            state.emit(EngineEvent::PositionChanged(playlist));
            if state.registry.playing == Some(playlist) {
                state.change_playback();
            }
            true
        })
    }

    /// Steps back through playback history (shuffle) or one row.
    pub fn prev_song(&self, playlist: PlaylistId) -> bool {
        self.core().with_state(|state| {
            let shuffle = state.config.playback.shuffle;
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            if !target.prev_song(shuffle) {
                return false;
            }
            state.emit(EngineEvent::PositionChanged(playlist));
            if state.registry.playing == Some(playlist) {
                state.change_playback();
            }
            true
        })
    }

    pub fn playing_entry_tuple(&self, mode: ReadMode) -> Option<Arc<Tuple>> {
        self.core()
            .wait_for_entry(
                |state| state.playing_entry_ref(),
                false,
                mode == ReadMode::Wait,
                |entry| entry.tuple.clone(),
            )
            .flatten()
    }

    pub fn playing_entry_decoder(&self, mode: ReadMode) -> Option<DecoderHandle> {
        self.core()
            .wait_for_entry(
                |state| state.playing_entry_ref(),
                mode == ReadMode::Wait,
                false,
                |entry| entry.decoder.clone(),
            )
            .flatten()
    }

    /// Replaces the playing entry's metadata, for streams that announce new
    /// titles. Segment entries keep their tuple.
    pub fn set_playing_entry_tuple(&self, tuple: Tuple) -> bool {
        self.core().with_state(|state| {
            let Some((playlist, entry_id)) = state.playing_entry_ref() else {
                return false;
            };
            let style = &state.style;
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            let Some(index) = target.index_of(entry_id) else {
                return false;
            };
            if !target.set_entry_tuple(index, Some(Arc::new(tuple)), style) {
                return false;
            }
            state.scan_cancel(entry_id);
            state.wake_readers = true;
            state.queue_update(UpdateLevel::Metadata, Some(playlist), index, 1, UpdateFlags::NONE);
            state.scan_settle(playlist);
            true
        })
    }
}
