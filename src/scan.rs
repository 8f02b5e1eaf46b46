//! Scan coordinator: decides which entries get probed and when.
//!
//! All state here lives under the engine lock. The coordinator walks every
//! scanning playlist in order with a single cursor and keeps the number of
//! outstanding background requests at or below `threads`. Worker threads
//! pull requests with `take_job` and hand results back through `finish`.

use std::collections::VecDeque;

use log::{debug, trace};

use crate::entry::{Entry, EntryId};
use crate::playlist::Playlist;
use crate::probe::ProbeRequest;
use crate::protocol::PlaylistId;
use crate::registry::Registry;

/// One outstanding probe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScanItem {
    pub(crate) request_id: u64,
    pub(crate) playlist: PlaylistId,
    pub(crate) entry: EntryId,
    /// Queued on the priority path for a blocking reader or playback start.
    pub(crate) priority: bool,
}

#[derive(Debug)]
pub(crate) struct ScanCoordinator {
    enabled_nominal: bool,
    metadata_on_play: bool,
    threads: usize,
    cursor_playlist: usize,
    cursor_row: usize,
    scan_list: Vec<ScanItem>,
    jobs: VecDeque<ProbeRequest>,
    priority_jobs: VecDeque<ProbeRequest>,
    next_request_id: u64,
}

impl ScanCoordinator {
    pub(crate) fn new(threads: usize, metadata_on_play: bool) -> Self {
        Self {
            enabled_nominal: true,
            metadata_on_play,
            threads: threads.max(1),
            cursor_playlist: 0,
            cursor_row: 0,
            scan_list: Vec::new(),
            jobs: VecDeque::new(),
            priority_jobs: VecDeque::new(),
            next_request_id: 1,
        }
    }

    /// Background scanning runs only when nominally enabled and metadata is
    /// not deferred until play time.
    pub(crate) fn enabled(&self) -> bool {
        self.enabled_nominal && !self.metadata_on_play
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled_nominal = enabled;
    }

    pub(crate) fn set_metadata_on_play(&mut self, metadata_on_play: bool) {
        self.metadata_on_play = metadata_on_play;
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.scan_list.len()
    }

    pub(crate) fn is_scanning_entry(&self, entry: EntryId) -> bool {
        self.scan_list.iter().any(|item| item.entry == entry)
    }

    fn has_playlist(&self, playlist: PlaylistId) -> bool {
        self.scan_list.iter().any(|item| item.playlist == playlist)
    }

    /// Records a request for `entry` and hands it to the worker queue.
    pub(crate) fn queue_entry(&mut self, playlist: PlaylistId, entry: &Entry, priority: bool) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = ProbeRequest {
            id: request_id,
            filename: entry.filename.clone(),
            want_tuple: entry.tuple.is_none(),
            decoder: entry.decoder.clone(),
        };
        trace!(
            "ScanCoordinator: queued request {} for {} (priority={})",
            request_id,
            entry.filename,
            priority
        );

        self.scan_list.push(ScanItem {
            request_id,
            playlist,
            entry: entry.id,
            priority,
        });
        if priority {
            self.priority_jobs.push_back(request);
        } else {
            self.jobs.push_back(request);
        }
    }

    /// Forgets the outstanding request for `entry`. A worker already probing
    /// it keeps going; its result is dropped on arrival.
    pub(crate) fn cancel(&mut self, entry: EntryId) -> bool {
        let Some(index) = self.scan_list.iter().position(|item| item.entry == entry) else {
            return false;
        };
        let item = self.scan_list.remove(index);
        self.jobs.retain(|job| job.id != item.request_id);
        self.priority_jobs.retain(|job| job.id != item.request_id);
        debug!(
            "ScanCoordinator: cancelled request {} for {:?}",
            item.request_id, entry
        );
        true
    }

    /// Forgets every outstanding request belonging to `playlist`.
    pub(crate) fn cancel_playlist(&mut self, playlist: PlaylistId) -> usize {
        let cancelled: Vec<u64> = self
            .scan_list
            .iter()
            .filter(|item| item.playlist == playlist)
            .map(|item| item.request_id)
            .collect();
        self.scan_list.retain(|item| item.playlist != playlist);
        self.jobs.retain(|job| !cancelled.contains(&job.id));
        self.priority_jobs.retain(|job| !cancelled.contains(&job.id));
        cancelled.len()
    }

    pub(crate) fn has_jobs(&self) -> bool {
        !self.jobs.is_empty() || !self.priority_jobs.is_empty()
    }

    /// Next request for a worker, priority requests first.
    pub(crate) fn take_job(&mut self) -> Option<ProbeRequest> {
        self.priority_jobs
            .pop_front()
            .or_else(|| self.jobs.pop_front())
    }

    /// Claims the item for a completed request. `None` means it was
    /// cancelled and the result must be discarded.
    pub(crate) fn finish(&mut self, request_id: u64) -> Option<ScanItem> {
        let index = self
            .scan_list
            .iter()
            .position(|item| item.request_id == request_id)?;
        Some(self.scan_list.remove(index))
    }

    /// Rewinds the walk to the first playlist.
    pub(crate) fn restart(&mut self) {
        self.cursor_playlist = 0;
        self.cursor_row = 0;
    }

    /// Moves a draining playlist to idle once none of its requests remain.
    pub(crate) fn check_complete(&self, playlist: &mut Playlist) -> bool {
        if !playlist.scan_ending || self.has_playlist(playlist.unique_id) {
            return false;
        }
        playlist.scan_ending = false;
        debug!("ScanCoordinator: playlist {} finished scanning", playlist.unique_id);
        true
    }

    fn queue_next_entry(&mut self, registry: &mut Registry, completed: &mut bool) -> bool {
        if !self.enabled() {
            return false;
        }

        while let Some(playlist) = registry.playlists.get_mut(self.cursor_playlist) {
            if playlist.scanning {
                while let Some(entry) = playlist.entries.get(self.cursor_row) {
                    self.cursor_row += 1;
                    if entry.tuple.is_none()
                        && !entry.is_stdin()
                        && !self.is_scanning_entry(entry.id)
                    {
                        let playlist_id = playlist.unique_id;
                        self.queue_entry(playlist_id, entry, false);
                        return true;
                    }
                }

                playlist.scanning = false;
                playlist.scan_ending = true;
                if self.check_complete(playlist) {
                    *completed = true;
                }
            }

            self.cursor_playlist += 1;
            self.cursor_row = 0;
        }

        false
    }

    /// Tops the background queue up to the concurrency bound. Returns true
    /// when a playlist finished scanning during the walk.
    pub(crate) fn schedule(&mut self, registry: &mut Registry) -> bool {
        let mut completed = false;
        while self.scan_list.len() < self.threads
            && self.queue_next_entry(registry, &mut completed)
        {}
        completed
    }

    /// Drops every request, queued or running.
    pub(crate) fn clear(&mut self) {
        self.scan_list.clear();
        self.jobs.clear();
        self.priority_jobs.clear();
        self.restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{PlaylistAddItem, TitleStyle};
    use crate::tuple::Tuple;

    fn registry_with(filenames: &[&str]) -> Registry {
        let mut registry = Registry::new();
        registry.insert(None, None);
        let style = TitleStyle::default();
        let entries = filenames
            .iter()
            .enumerate()
            .map(|(n, filename)| Entry::new(EntryId(n as u64), PlaylistAddItem::new(*filename), &style))
            .collect();
        let playlist = &mut registry.playlists[0];
        playlist.insert_entries(None, entries);
        playlist.scanning = true;
        registry
    }

    #[test]
    fn test_schedule_respects_thread_bound() {
        let mut registry = registry_with(&["/a.mp3", "/b.mp3", "/c.mp3"]);
        let mut scan = ScanCoordinator::new(2, false);
        assert!(!scan.schedule(&mut registry));
        assert_eq!(scan.in_flight(), 2);
        assert!(scan.is_scanning_entry(EntryId(0)));
        assert!(scan.is_scanning_entry(EntryId(1)));
        assert!(!scan.is_scanning_entry(EntryId(2)));
        assert!(registry.playlists[0].scanning);
    }

    #[test]
    fn test_walk_skips_stdin_and_scanned_entries_then_drains() {
        let mut registry = registry_with(&["stdin://", "/b.mp3"]);
        let style = TitleStyle::default();
        registry.playlists[0].set_entry_tuple(1, Some(std::sync::Arc::new(Tuple::default())), &style);
        let mut scan = ScanCoordinator::new(2, false);
        assert!(scan.schedule(&mut registry));
        assert_eq!(scan.in_flight(), 0);
        assert!(!registry.playlists[0].scanning);
        assert!(!registry.playlists[0].scan_ending);
    }

    #[test]
    fn test_cancelled_request_is_discarded() {
        let mut registry = registry_with(&["/a.mp3"]);
        let mut scan = ScanCoordinator::new(1, false);
        scan.schedule(&mut registry);
        let job = scan.take_job().unwrap();
        assert!(scan.cancel(EntryId(0)));
        assert!(scan.finish(job.id).is_none());
        assert!(!scan.cancel(EntryId(0)));
    }

    #[test]
    fn test_priority_jobs_are_taken_first() {
        let registry = registry_with(&["/a.mp3", "/b.mp3"]);
        let mut scan = ScanCoordinator::new(4, false);
        let playlist = &registry.playlists[0];
        scan.queue_entry(playlist.unique_id, &playlist.entries[0], false);
        scan.queue_entry(playlist.unique_id, &playlist.entries[1], true);
        assert_eq!(scan.take_job().map(|job| job.filename.to_string()).as_deref(), Some("/b.mp3"));
        assert_eq!(scan.take_job().map(|job| job.filename.to_string()).as_deref(), Some("/a.mp3"));
    }

    #[test]
    fn test_cancel_playlist_withdraws_queued_jobs() {
        let mut registry = registry_with(&["/a.mp3", "/b.mp3"]);
        let mut scan = ScanCoordinator::new(2, false);
        scan.schedule(&mut registry);
        assert!(scan.has_jobs());
        assert_eq!(scan.cancel_playlist(registry.playlists[0].unique_id), 2);
        assert_eq!(scan.in_flight(), 0);
        assert!(!scan.has_jobs());
    }

    #[test]
    fn test_disabled_scanning_queues_nothing() {
        let mut registry = registry_with(&["/a.mp3"]);
        let mut scan = ScanCoordinator::new(2, true);
        assert!(!scan.enabled());
        scan.schedule(&mut registry);
        assert_eq!(scan.in_flight(), 0);
        assert!(registry.playlists[0].scanning);
    }
}
