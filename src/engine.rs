//! The engine context object.
//!
//! Every playlist, the scan coordinator and the update coalescer live in one
//! `EngineState` behind one mutex. Three condition variables hang off that
//! mutex: `scan_done` wakes blocking readers when a probe result lands,
//! `work` wakes scan workers when requests are queued, and `tick` wakes the
//! ticker thread when the flush deadline moves. Events produced while the
//! lock is held are buffered and published on the broadcast bus after it is
//! released.

mod playback;
mod storage;

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::config::{sanitize_config, EngineConfig};
use crate::entry::{DerivedInfo, Entry, EntryId, PlaylistAddItem, TitleStyle};
use crate::persistence::{JsonPlaylistStore, PlaylistStore};
use crate::playlist::{AdvancePolicy, Removal, TEMPORARY_TITLE};
use crate::probe::{DecoderHandle, Probe, ProbeOutcome};
use crate::protocol::{EngineEvent, PlaylistId, Update, UpdateLevel};
use crate::registry::Registry;
use crate::scan::ScanCoordinator;
use crate::sort::SortType;
use crate::tuple::{self, Tuple};
use crate::update::UpdateCoalescer;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Whether an accessor may block for missing metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Scan the entry on the priority path and wait for the result.
    Wait,
    /// Return whatever is known right now.
    Guess,
}

/// Case-insensitive substring patterns for `select_by_patterns`. Empty or
/// missing patterns match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectPatterns {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct UpdateFlags {
    queue_changed: bool,
    /// Scan results; may ride the slower scan delay.
    delayed: bool,
}

impl UpdateFlags {
    const NONE: Self = Self {
        queue_changed: false,
        delayed: false,
    };
    const QUEUE_CHANGED: Self = Self {
        queue_changed: true,
        delayed: false,
    };
    const DELAYED: Self = Self {
        queue_changed: false,
        delayed: true,
    };
}

#[derive(Debug, Default)]
struct PlaybackState {
    paused: bool,
    time_ms: i64,
}

struct EngineState {
    registry: Registry,
    scan: ScanCoordinator,
    updates: UpdateCoalescer,
    config: EngineConfig,
    style: TitleStyle,
    playback: PlaybackState,
    resume_playlist: Option<PlaylistId>,
    resume_paused: bool,
    next_entry_id: u64,
    rng: StdRng,
    events: Vec<EngineEvent>,
    wake_ticker: bool,
    wake_readers: bool,
    quit: bool,
}

fn seeded_rng() -> StdRng {
    let mut seed = [0u8; 32];
    match getrandom::fill(&mut seed) {
        Ok(()) => StdRng::from_seed(seed),
        Err(err) => {
            debug!("Engine: no OS randomness ({}), seeding from the clock", err);
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos() as u64)
                .unwrap_or_default();
            StdRng::seed_from_u64(nanos)
        }
    }
}

fn contains_ignore_case(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|haystack| haystack.to_lowercase().contains(needle))
}

impl EngineState {
    fn new(config: EngineConfig) -> Self {
        let mut scan = ScanCoordinator::new(config.scan.threads, config.scan.metadata_on_play);
        scan.set_enabled(config.scan.enabled);
        let mut state = Self {
            registry: Registry::new(),
            scan,
            updates: UpdateCoalescer::new(
                config.scan.update_delay(),
                config.scan.scan_update_delay(),
            ),
            style: TitleStyle::new(
                &config.display.title_format,
                config.display.metadata_fallbacks,
            ),
            config,
            playback: PlaybackState::default(),
            resume_playlist: None,
            resume_paused: false,
            next_entry_id: 1,
            rng: seeded_rng(),
            events: Vec::new(),
            wake_ticker: false,
            wake_readers: false,
            quit: false,
        };
        state.insert_playlist_locked(None, None);
        state
    }

    fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    fn advance_policy(&self, repeat: bool) -> AdvancePolicy {
        AdvancePolicy {
            shuffle: self.config.playback.shuffle,
            album_shuffle: self.config.playback.album_shuffle,
            repeat,
        }
    }

    fn entry_ref(&self, playlist: PlaylistId, at: usize) -> Option<(PlaylistId, EntryId)> {
        let entry = self.registry.get(playlist)?.entry(at)?;
        Some((playlist, entry.id))
    }

    fn playing_entry_ref(&self) -> Option<(PlaylistId, EntryId)> {
        let playing = self.registry.playing?;
        let target = self.registry.get(playing)?;
        Some((playing, target.position?))
    }

    fn entry_len(&self, playlist: PlaylistId) -> usize {
        self.registry.get(playlist).map_or(0, |target| target.len())
    }

    // Update coalescing

    fn queue_update(
        &mut self,
        level: UpdateLevel,
        playlist: Option<PlaylistId>,
        at: usize,
        count: usize,
        flags: UpdateFlags,
    ) {
        let mut delayable = false;
        if let Some(target) = playlist.and_then(|id| self.registry.get_mut(id)) {
            if level == UpdateLevel::Structure {
                target.scanning = true;
                target.scan_ending = false;
            }
            if level >= UpdateLevel::Metadata {
                target.modified = true;
            }
            target.accumulate_update(level, at, count, flags.queue_changed);
            delayable = flags.delayed
                && self.scan.enabled()
                && (target.scanning || target.scan_ending);
        }

        if level == UpdateLevel::Structure {
            self.scan_restart();
        }

        if self.updates.queue(level, delayable) {
            self.wake_ticker = true;
        }
    }

    fn queue_scan_complete(&mut self) {
        if self.updates.queue_scan_complete() {
            self.wake_ticker = true;
        }
    }

    /// Publishes the coalesced window: each playlist's pending update becomes
    /// its last update and one global event fires.
    fn flush_updates(&mut self) {
        let flush = self.updates.take();
        if flush.is_empty() {
            return;
        }
        for playlist in &mut self.registry.playlists {
            playlist.take_update();
        }
        if let Some(level) = flush.level {
            trace!("Engine: flushing {:?} update", level);
            self.emit(EngineEvent::Update(level));
        }
        if flush.scan_complete {
            debug!("Engine: scan complete");
            self.emit(EngineEvent::ScanComplete);
        }
    }

    // Scanning

    fn scan_schedule(&mut self) {
        if self.scan.schedule(&mut self.registry) {
            self.queue_scan_complete();
        }
    }

    fn scan_restart(&mut self) {
        self.scan.restart();
        self.scan_schedule();
    }

    /// Withdraws the request for `entry`. Readers parked on it wake up and
    /// re-check the entry, which may be resolved or gone by then.
    fn scan_cancel(&mut self, entry: EntryId) {
        if self.scan.cancel(entry) {
            self.wake_readers = true;
        }
    }

    /// Lets a draining playlist go idle once a withdrawn request was its
    /// last one, then refills the freed slots.
    fn scan_settle(&mut self, playlist: PlaylistId) {
        let completed = self
            .registry
            .get_mut(playlist)
            .is_some_and(|target| self.scan.check_complete(target));
        if completed {
            self.queue_scan_complete();
        }
        self.scan_schedule();
    }

    fn scan_finish(&mut self, request_id: u64, outcome: ProbeOutcome) {
        let Some(item) = self.scan.finish(request_id) else {
            trace!("Engine: discarding result of cancelled request {}", request_id);
            return;
        };
        self.wake_readers = true;

        let style = &self.style;
        let mut changed_row = None;
        if let Some(target) = self.registry.get_mut(item.playlist) {
            if let Some(index) = target.index_of(item.entry) {
                let entry = &mut target.entries[index];
                if entry.decoder.is_none() {
                    entry.decoder = outcome.decoder;
                }
                if entry.tuple.is_none() {
                    if let Some(tuple) = outcome.tuple {
                        target.set_entry_tuple(index, Some(Arc::new(tuple)), style);
                        changed_row = Some(index);
                    }
                }

                let entry = &mut target.entries[index];
                if entry.decoder.is_none() || entry.tuple.is_none() {
                    entry.error = outcome.error.clone();
                }
                if entry.tuple.is_none() {
                    debug!(
                        "Engine: probe failed for {}: {}",
                        entry.filename,
                        outcome.error.as_deref().unwrap_or("no metadata")
                    );
                    target.mark_failed(index, outcome.error, style);
                    changed_row = Some(index);
                }
            }
        }

        if let Some(index) = changed_row {
            self.queue_update(
                UpdateLevel::Metadata,
                Some(item.playlist),
                index,
                1,
                UpdateFlags::DELAYED,
            );
        }

        let completed = self
            .registry
            .get_mut(item.playlist)
            .is_some_and(|target| self.scan.check_complete(target));
        if completed {
            self.queue_scan_complete();
        }
        self.scan_schedule();
    }

    // Registry

    fn insert_playlist_locked(
        &mut self,
        at: Option<usize>,
        preferred: Option<PlaylistId>,
    ) -> PlaylistId {
        let number = self.registry.insert(at, preferred);
        let id = self.registry.playlists[number].unique_id;
        if self.registry.active.is_none() {
            self.registry.active = Some(id);
        }
        self.queue_update(UpdateLevel::Structure, None, 0, 0, UpdateFlags::NONE);
        id
    }

    fn set_title_locked(&mut self, playlist: PlaylistId, title: &str) -> bool {
        let Some(target) = self.registry.get_mut(playlist) else {
            return false;
        };
        target.title = title.to_string();
        target.modified = true;
        self.queue_update(UpdateLevel::Metadata, None, 0, 0, UpdateFlags::NONE);
        true
    }

    fn blank_playlist_locked(&mut self) -> PlaylistId {
        let active = self
            .registry
            .active
            .and_then(|id| self.registry.number_of(id).map(|number| (id, number)));
        match active {
            Some((id, _)) if self.registry.get(id).is_some_and(|target| target.is_blank()) => id,
            Some((_, number)) => self.insert_playlist_locked(Some(number + 1), None),
            None => self.insert_playlist_locked(None, None),
        }
    }

    // Entries

    fn insert_entries(
        &mut self,
        playlist: PlaylistId,
        at: Option<usize>,
        items: Vec<PlaylistAddItem>,
    ) -> usize {
        let count = items.len();
        if count == 0 || self.registry.get(playlist).is_none() {
            return 0;
        }

        let style = &self.style;
        let next_id = &mut self.next_entry_id;
        let entries: Vec<Entry> = items
            .into_iter()
            .map(|item| {
                let id = EntryId(*next_id);
                *next_id += 1;
                Entry::new(id, item, style)
            })
            .collect();

        let Some(target) = self.registry.get_mut(playlist) else {
            return 0;
        };
        let at = target.insert_entries(at, entries);
        self.queue_update(
            UpdateLevel::Structure,
            Some(playlist),
            at,
            count,
            UpdateFlags::NONE,
        );
        count
    }

    /// Shared tail of every deletion: cancels scans for the removed entries,
    /// applies the advance-on-delete policy and queues the structural update.
    fn finish_removal(&mut self, playlist: PlaylistId, removal: Removal) {
        for id in &removal.removed {
            self.scan_cancel(*id);
        }

        if removal.position_removed {
            if self.config.playback.advance_on_delete {
                let repeat = self.config.playback.repeat;
                self.next_song_locked(playlist, repeat, removal.hint);
            }
            self.emit(EngineEvent::PositionChanged(playlist));
            if self.registry.playing == Some(playlist) {
                self.change_playback();
            }
        }

        let flags = if removal.queue_changed {
            UpdateFlags::QUEUE_CHANGED
        } else {
            UpdateFlags::NONE
        };
        self.queue_update(
            UpdateLevel::Structure,
            Some(playlist),
            removal.at,
            removal.changed,
            flags,
        );
    }

    fn delete_selected_locked(&mut self, playlist: PlaylistId) -> usize {
        let Some(removal) = self
            .registry
            .get_mut(playlist)
            .and_then(|target| target.remove_selected())
        else {
            return 0;
        };
        let removed = removal.removed.len();
        self.finish_removal(playlist, removal);
        removed
    }

    /// Tuple-based orderings need every considered entry scanned.
    fn sort_allowed(&mut self, playlist: PlaylistId, sort_type: SortType, selected_only: bool) -> bool {
        if sort_type.is_filename_based() {
            return true;
        }
        let scanned = self
            .registry
            .get(playlist)
            .is_some_and(|target| target.entries_are_scanned(selected_only));
        if !scanned {
            debug!(
                "Engine: refusing {:?} sort of playlist {} with unscanned entries",
                sort_type, playlist
            );
            self.emit(EngineEvent::SortRefused(playlist));
        }
        scanned
    }

    /// Forces the entries picked by `filter` back to the unscanned state.
    /// Entries that are still unscanned keep any request already in flight.
    fn rescan_where(&mut self, playlist: PlaylistId, filter: impl Fn(&Entry) -> bool) -> bool {
        let style = &self.style;
        let Some(target) = self.registry.get_mut(playlist) else {
            return false;
        };
        let rows: Vec<usize> = target
            .entries
            .iter()
            .filter(|entry| entry.tuple.is_some() && filter(entry))
            .map(|entry| entry.number)
            .collect();
        let mut reset = Vec::with_capacity(rows.len());
        for row in rows {
            if target.set_entry_tuple(row, None, style) {
                reset.push(target.entries[row].id);
            }
        }
        let len = target.len();
        target.scanning = true;
        target.scan_ending = false;
        for id in reset {
            self.scan_cancel(id);
        }
        self.queue_update(UpdateLevel::Metadata, Some(playlist), 0, len, UpdateFlags::NONE);
        self.scan_restart();
        true
    }

    fn reformat_titles(&mut self) {
        self.style = TitleStyle::new(
            &self.config.display.title_format,
            self.config.display.metadata_fallbacks,
        );
        for playlist in &mut self.registry.playlists {
            playlist.reformat(&self.style);
        }
        for id in self.registry.ids() {
            let len = self.entry_len(id);
            self.queue_update(UpdateLevel::Metadata, Some(id), 0, len, UpdateFlags::NONE);
        }
    }

    fn apply_config(&mut self, config: EngineConfig) {
        let previous = std::mem::replace(&mut self.config, config);
        self.updates.set_delays(
            self.config.scan.update_delay(),
            self.config.scan.scan_update_delay(),
        );
        if previous.scan.threads != self.config.scan.threads {
            info!(
                "Engine: scan thread count {} takes effect on next start",
                self.config.scan.threads
            );
        }
        if previous.display != self.config.display {
            self.reformat_titles();
        }
        let scan_changed = previous.scan.metadata_on_play != self.config.scan.metadata_on_play
            || previous.scan.enabled != self.config.scan.enabled;
        if scan_changed {
            self.scan.set_metadata_on_play(self.config.scan.metadata_on_play);
            self.scan.set_enabled(self.config.scan.enabled);
            self.scan_restart();
        }
    }
}

struct Core {
    state: Mutex<EngineState>,
    scan_done: Condvar,
    tick: Condvar,
    work: Condvar,
    bus: Sender<EngineEvent>,
    probe: Arc<dyn Probe>,
    store: Arc<dyn PlaylistStore>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, EngineState>,
    ) -> MutexGuard<'a, EngineState> {
        condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Unlocks, then wakes whoever the locked section asked for and
    /// publishes its buffered events.
    fn release(&self, mut guard: MutexGuard<'_, EngineState>) {
        let events = std::mem::take(&mut guard.events);
        let wake_ticker = std::mem::take(&mut guard.wake_ticker);
        let wake_readers = std::mem::take(&mut guard.wake_readers);
        let wake_workers = guard.scan.has_jobs();
        drop(guard);

        if wake_ticker {
            self.tick.notify_all();
        }
        if wake_readers {
            self.scan_done.notify_all();
        }
        if wake_workers {
            self.work.notify_all();
        }
        for event in events {
            let _ = self.bus.send(event);
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut EngineState) -> T) -> T {
        let mut guard = self.lock();
        let result = f(&mut guard);
        self.release(guard);
        result
    }

    /// Blocking read: waits until the entry has the requested fields, its
    /// scan fails, or the entry disappears. Queues a priority scan at most
    /// once.
    fn wait_for_entry<T>(
        &self,
        locate: impl FnOnce(&EngineState) -> Option<(PlaylistId, EntryId)>,
        need_decoder: bool,
        need_tuple: bool,
        read: impl Fn(&Entry) -> T,
    ) -> Option<T> {
        let mut guard = self.lock();
        let (playlist, entry_id) = locate(&guard)?;
        let mut scan_started = false;

        loop {
            let state = &mut *guard;
            let target = state.registry.get(playlist)?;
            let entry = &target.entries[target.index_of(entry_id)?];

            let satisfied = (!need_decoder || entry.decoder.is_some())
                && (!need_tuple || entry.tuple.is_some());
            if satisfied || state.quit || entry.is_stdin() || entry.failed {
                return Some(read(entry));
            }

            if !state.scan.is_scanning_entry(entry_id) {
                if scan_started {
                    return Some(read(entry));
                }
                state.scan.queue_entry(playlist, entry, true);
                self.work.notify_all();
            }

            scan_started = true;
            guard = self.wait(&self.scan_done, guard);
        }
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn run_scan_worker(core: Arc<Core>) {
    let mut guard = core.lock();
    loop {
        if guard.quit {
            break;
        }
        let Some(request) = guard.scan.take_job() else {
            guard = core.wait(&core.work, guard);
            continue;
        };
        drop(guard);

        trace!("ScanWorker: probing {}", request.filename);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| core.probe.probe(&request))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_payload_to_string(payload.as_ref());
                error!("ScanWorker: probe panicked on {}: {}", request.filename, message);
                ProbeOutcome::failed(message)
            }
        };

        let mut finished = core.lock();
        finished.scan_finish(request.id, outcome);
        core.release(finished);
        guard = core.lock();
    }
}

fn run_ticker(core: Arc<Core>) {
    let mut guard = core.lock();
    loop {
        if guard.quit {
            break;
        }
        match guard.updates.time_until_due(Instant::now()) {
            None => guard = core.wait(&core.tick, guard),
            Some(remaining) if !remaining.is_zero() => {
                guard = match core.tick.wait_timeout(guard, remaining) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            Some(_) => {
                guard.flush_updates();
                core.release(guard);
                guard = core.lock();
            }
        }
    }
}

struct EngineInner {
    core: Arc<Core>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineInner {
    fn spawn(&self, name: String, body: fn(Arc<Core>)) -> std::io::Result<()> {
        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new().name(name).spawn(move || body(core))?;
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    fn shutdown(&self) {
        let handles = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if handles.is_empty() {
            return;
        }

        self.core.with_state(|state| {
            state.quit = true;
            state.scan.clear();
        });
        self.core.tick.notify_all();
        self.core.work.notify_all();
        self.core.scan_done.notify_all();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!("Engine: thread '{}' terminated due to panic", name);
            }
        }

        self.core.with_state(|state| {
            state.updates.cancel();
            state.registry.clear();
        });
        info!("Engine: shut down");
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a running playlist engine. Cheap to clone; every clone drives
/// the same state and all methods may be called from any thread.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig, probe: Arc<dyn Probe>) -> std::io::Result<Self> {
        Self::with_store(config, probe, Arc::new(JsonPlaylistStore))
    }

    pub fn with_store(
        config: EngineConfig,
        probe: Arc<dyn Probe>,
        store: Arc<dyn PlaylistStore>,
    ) -> std::io::Result<Self> {
        let config = sanitize_config(config);
        let workers = config.scan.threads;
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let core = Arc::new(Core {
            state: Mutex::new(EngineState::new(config)),
            scan_done: Condvar::new(),
            tick: Condvar::new(),
            work: Condvar::new(),
            bus,
            probe,
            store,
        });
        let inner = EngineInner {
            core,
            threads: Mutex::new(Vec::with_capacity(workers + 1)),
        };

        inner.spawn("tracklist-ticker".to_string(), run_ticker)?;
        for n in 0..workers {
            inner.spawn(format!("tracklist-scan-{}", n), run_scan_worker)?;
        }
        info!("Engine: started with {} scan workers", workers);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn core(&self) -> &Core {
        &self.inner.core
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.core().bus.subscribe()
    }

    /// Stops the worker pool and ticker, discards in-flight results and
    /// clears the registry. Later calls see an empty engine.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn config(&self) -> EngineConfig {
        self.core().with_state(|state| state.config.clone())
    }

    /// Replaces the configuration. Formatting changes reformat every title;
    /// scan policy changes restart the scan walk. The worker count is fixed
    /// for the engine's lifetime.
    pub fn apply_config(&self, config: EngineConfig) {
        let config = sanitize_config(config);
        self.core().with_state(|state| state.apply_config(config));
    }

    // Playlists

    pub fn playlist_count(&self) -> usize {
        self.core().with_state(|state| state.registry.len())
    }

    pub fn playlist_ids(&self) -> Vec<PlaylistId> {
        self.core().with_state(|state| state.registry.ids())
    }

    pub fn playlist_index(&self, playlist: PlaylistId) -> Option<usize> {
        self.core()
            .with_state(|state| state.registry.number_of(playlist))
    }

    pub fn playlist_at(&self, number: usize) -> Option<PlaylistId> {
        self.core()
            .with_state(|state| state.registry.at(number).map(|target| target.unique_id))
    }

    /// Inserts an empty playlist at `at` (`None` appends). `preferred` is
    /// used as its id when that id has never been handed out.
    pub fn insert_playlist(&self, at: Option<usize>, preferred: Option<PlaylistId>) -> PlaylistId {
        self.core()
            .with_state(|state| state.insert_playlist_locked(at, preferred))
    }

    /// Inserts a playlist right after the active one and activates it.
    pub fn new_playlist(&self) -> PlaylistId {
        self.core().with_state(|state| {
            let at = state
                .registry
                .active
                .and_then(|id| state.registry.number_of(id))
                .map(|number| number + 1);
            let id = state.insert_playlist_locked(at, None);
            state.registry.active = Some(id);
            state.emit(EngineEvent::ActivePlaylistChanged);
            id
        })
    }

    /// Deletes a playlist. The registry never ends up empty: removing the
    /// last playlist creates a fresh one.
    pub fn delete_playlist(&self, playlist: PlaylistId) -> bool {
        self.core().with_state(|state| {
            let Some(number) = state.registry.number_of(playlist) else {
                return false;
            };
            let was_active = state.registry.active == Some(playlist);
            let was_playing = state.registry.playing == Some(playlist);

            if state.scan.cancel_playlist(playlist) > 0 {
                state.wake_readers = true;
            }
            state.registry.remove(number);
            if state.resume_playlist == Some(playlist) {
                state.resume_playlist = None;
            }
            if state.registry.is_empty() {
                state.registry.active = None;
                state.insert_playlist_locked(None, None);
            }

            if was_active {
                let number = number.min(state.registry.len() - 1);
                state.registry.active = state.registry.at(number).map(|target| target.unique_id);
            }
            if was_playing {
                state.registry.playing = None;
                state.stop_playback();
            }
            state.queue_update(UpdateLevel::Structure, None, 0, 0, UpdateFlags::NONE);

            if was_active {
                state.emit(EngineEvent::ActivePlaylistChanged);
            }
            if was_playing {
                state.emit(EngineEvent::PlayingPlaylistChanged);
                state.emit(EngineEvent::PlaybackStop);
            }
            debug!("Engine: deleted playlist {}", playlist);
            true
        })
    }

    /// Moves `count` playlists starting at index `from` so they start at `to`.
    pub fn reorder_playlists(&self, from: usize, to: usize, count: usize) -> bool {
        self.core().with_state(|state| {
            if !state.registry.reorder(from, to, count) {
                return false;
            }
            state.queue_update(UpdateLevel::Structure, None, 0, 0, UpdateFlags::NONE);
            true
        })
    }

    pub fn set_title(&self, playlist: PlaylistId, title: &str) -> bool {
        self.core()
            .with_state(|state| state.set_title_locked(playlist, title))
    }

    pub fn title(&self, playlist: PlaylistId) -> Option<String> {
        self.core()
            .with_state(|state| state.registry.get(playlist).map(|target| target.title.clone()))
    }

    pub fn set_filename(&self, playlist: PlaylistId, filename: Option<PathBuf>) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            target.filename = filename;
            target.modified = true;
            state.queue_update(UpdateLevel::Metadata, None, 0, 0, UpdateFlags::NONE);
            true
        })
    }

    pub fn filename(&self, playlist: PlaylistId) -> Option<PathBuf> {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)
                .and_then(|target| target.filename.clone())
        })
    }

    pub fn set_modified(&self, playlist: PlaylistId, modified: bool) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            target.modified = modified;
            true
        })
    }

    pub fn modified(&self, playlist: PlaylistId) -> bool {
        self.core()
            .with_state(|state| state.registry.get(playlist).is_some_and(|target| target.modified))
    }

    pub fn set_active(&self, playlist: PlaylistId) -> bool {
        self.core().with_state(|state| {
            if state.registry.get(playlist).is_none() {
                return false;
            }
            if state.registry.active != Some(playlist) {
                state.registry.active = Some(playlist);
                state.emit(EngineEvent::ActivePlaylistChanged);
            }
            true
        })
    }

    pub fn active(&self) -> Option<PlaylistId> {
        self.core().with_state(|state| state.registry.active)
    }

    /// The active playlist if it is blank, else a new playlist after it.
    pub fn blank_playlist(&self) -> PlaylistId {
        self.core().with_state(|state| state.blank_playlist_locked())
    }

    /// The "Now Playing" playlist, created from a blank one if missing.
    pub fn temporary_playlist(&self) -> PlaylistId {
        self.core().with_state(|state| {
            let existing = state
                .registry
                .playlists
                .iter()
                .find(|target| target.title == TEMPORARY_TITLE)
                .map(|target| target.unique_id);
            if let Some(id) = existing {
                return id;
            }
            let id = state.blank_playlist_locked();
            state.set_title_locked(id, TEMPORARY_TITLE);
            id
        })
    }

    // Entries

    /// Batch insert at `at` (clamped; `None` appends). Returns the number of
    /// entries added.
    pub fn insert_entries(
        &self,
        playlist: PlaylistId,
        at: Option<usize>,
        items: Vec<PlaylistAddItem>,
    ) -> usize {
        self.core()
            .with_state(|state| state.insert_entries(playlist, at, items))
    }

    /// Removes rows `at..at + count`. Returns how many were removed.
    pub fn delete_entries(&self, playlist: PlaylistId, at: usize, count: usize) -> usize {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return 0;
            };
            if count == 0 || at >= target.len() {
                return 0;
            }
            let removal = target.remove_range(at, count);
            let removed = removal.removed.len();
            state.finish_removal(playlist, removal);
            removed
        })
    }

    pub fn delete_selected(&self, playlist: PlaylistId) -> usize {
        self.core()
            .with_state(|state| state.delete_selected_locked(playlist))
    }

    pub fn entry_count(&self, playlist: PlaylistId) -> usize {
        self.core().with_state(|state| state.entry_len(playlist))
    }

    pub fn entry_filename(&self, playlist: PlaylistId, at: usize) -> Option<Arc<str>> {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)?
                .entry(at)
                .map(|entry| entry.filename.clone())
        })
    }

    pub fn entry_decoder(
        &self,
        playlist: PlaylistId,
        at: usize,
        mode: ReadMode,
    ) -> Option<DecoderHandle> {
        self.core()
            .wait_for_entry(
                |state| state.entry_ref(playlist, at),
                mode == ReadMode::Wait,
                false,
                |entry| entry.decoder.clone(),
            )
            .flatten()
    }

    pub fn entry_tuple(&self, playlist: PlaylistId, at: usize, mode: ReadMode) -> Option<Arc<Tuple>> {
        self.core()
            .wait_for_entry(
                |state| state.entry_ref(playlist, at),
                false,
                mode == ReadMode::Wait,
                |entry| entry.tuple.clone(),
            )
            .flatten()
    }

    pub fn entry_info(&self, playlist: PlaylistId, at: usize) -> Option<DerivedInfo> {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)?
                .entry(at)
                .map(|entry| entry.derived.clone())
        })
    }

    pub fn entry_error(&self, playlist: PlaylistId, at: usize) -> Option<String> {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)?
                .entry(at)
                .and_then(|entry| entry.error.clone())
        })
    }

    pub fn entry_failed(&self, playlist: PlaylistId, at: usize) -> bool {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)
                .and_then(|target| target.entry(at))
                .is_some_and(|entry| entry.failed)
        })
    }

    pub fn total_length(&self, playlist: PlaylistId) -> i64 {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)
                .map_or(0, |target| target.total_length_ms)
        })
    }

    pub fn selected_length(&self, playlist: PlaylistId) -> i64 {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)
                .map_or(0, |target| target.selected_length_ms)
        })
    }

    // Selection

    pub fn select_entry(&self, playlist: PlaylistId, at: usize, selected: bool) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            if at >= target.len() {
                return false;
            }
            if target.select(at, selected) {
                state.queue_update(UpdateLevel::Selection, Some(playlist), at, 1, UpdateFlags::NONE);
            }
            true
        })
    }

    pub fn entry_selected(&self, playlist: PlaylistId, at: usize) -> bool {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)
                .and_then(|target| target.entry(at))
                .is_some_and(|entry| entry.selected)
        })
    }

    pub fn select_all(&self, playlist: PlaylistId, selected: bool) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            if let Some((at, count)) = target.select_all(selected) {
                state.queue_update(UpdateLevel::Selection, Some(playlist), at, count, UpdateFlags::NONE);
            }
            true
        })
    }

    pub fn selected_count(&self, playlist: PlaylistId) -> usize {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)
                .map_or(0, |target| target.selected_count)
        })
    }

    pub fn selected_count_in(&self, playlist: PlaylistId, at: usize, count: usize) -> usize {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)
                .map_or(0, |target| target.selected_count_in(at, count))
        })
    }

    /// Selects exactly the entries matching every non-empty pattern. Returns
    /// the resulting selection size.
    pub fn select_by_patterns(&self, playlist: PlaylistId, patterns: &SelectPatterns) -> usize {
        let needle = |pattern: &Option<String>| {
            pattern
                .as_deref()
                .map(str::trim)
                .filter(|pattern| !pattern.is_empty())
                .map(str::to_lowercase)
        };
        let title = needle(&patterns.title);
        let artist = needle(&patterns.artist);
        let album = needle(&patterns.album);
        let file_name = needle(&patterns.file_name);

        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return 0;
            };
            for index in 0..target.len() {
                let entry = &target.entries[index];
                let tuple = entry.tuple.as_deref();
                let field_matches = |pattern: &Option<String>, value: Option<&str>| {
                    pattern
                        .as_deref()
                        .is_none_or(|pattern| contains_ignore_case(value, pattern))
                };
                let decoded_name = urlencoding::decode(tuple::basename(&entry.filename))
                    .map(|name| name.into_owned())
                    .unwrap_or_else(|_| tuple::basename(&entry.filename).to_string());
                let matched = field_matches(&title, tuple.and_then(|t| t.title.as_deref()))
                    && field_matches(&artist, tuple.and_then(|t| t.artist.as_deref()))
                    && field_matches(&album, tuple.and_then(|t| t.album.as_deref()))
                    && field_matches(&file_name, Some(&decoded_name));
                target.select(index, matched);
            }
            let (len, selected) = (target.len(), target.selected_count);
            state.queue_update(UpdateLevel::Selection, Some(playlist), 0, len, UpdateFlags::NONE);
            selected
        })
    }

    // Reordering

    /// Moves the selected block containing row `at` past `distance`
    /// unselected rows. Returns the distance actually moved.
    pub fn shift_entries(&self, playlist: PlaylistId, at: usize, distance: isize) -> isize {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return 0;
            };
            let (moved, range) = target.shift(at, distance);
            if let Some((at, count)) = range {
                state.queue_update(UpdateLevel::Structure, Some(playlist), at, count, UpdateFlags::NONE);
            }
            moved
        })
    }

    pub fn reverse(&self, playlist: PlaylistId) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            target.reverse();
            let len = target.len();
            state.queue_update(UpdateLevel::Structure, Some(playlist), 0, len, UpdateFlags::NONE);
            true
        })
    }

    pub fn reverse_selected(&self, playlist: PlaylistId) -> bool {
        self.core().with_state(|state| {
            let Some((at, count)) = state
                .registry
                .get_mut(playlist)
                .and_then(|target| target.reverse_selected())
            else {
                return false;
            };
            state.queue_update(UpdateLevel::Structure, Some(playlist), at, count, UpdateFlags::NONE);
            true
        })
    }

    pub fn randomize(&self, playlist: PlaylistId) -> bool {
        self.core().with_state(|state| {
            let rng = &mut state.rng;
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            target.randomize(rng);
            let len = target.len();
            state.queue_update(UpdateLevel::Structure, Some(playlist), 0, len, UpdateFlags::NONE);
            true
        })
    }

    pub fn randomize_selected(&self, playlist: PlaylistId) -> bool {
        self.core().with_state(|state| {
            let rng = &mut state.rng;
            let Some((at, count)) = state
                .registry
                .get_mut(playlist)
                .and_then(|target| target.randomize_selected(rng))
            else {
                return false;
            };
            state.queue_update(UpdateLevel::Structure, Some(playlist), at, count, UpdateFlags::NONE);
            true
        })
    }

    /// Stable sort of the whole playlist. Tuple-based orderings are refused
    /// while any entry is unscanned.
    pub fn sort_by(&self, playlist: PlaylistId, sort_type: SortType) -> bool {
        self.core().with_state(|state| {
            if state.registry.get(playlist).is_none()
                || !state.sort_allowed(playlist, sort_type, false)
            {
                return false;
            }
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            target.sort(sort_type);
            let len = target.len();
            state.queue_update(UpdateLevel::Structure, Some(playlist), 0, len, UpdateFlags::NONE);
            true
        })
    }

    pub fn sort_selected_by(&self, playlist: PlaylistId, sort_type: SortType) -> bool {
        self.core().with_state(|state| {
            if state.registry.get(playlist).is_none()
                || !state.sort_allowed(playlist, sort_type, true)
            {
                return false;
            }
            let Some((at, count)) = state
                .registry
                .get_mut(playlist)
                .and_then(|target| target.sort_selected(sort_type))
            else {
                return false;
            };
            state.queue_update(UpdateLevel::Structure, Some(playlist), at, count, UpdateFlags::NONE);
            true
        })
    }

    /// Deletes every entry that compares equal to an earlier one. Replaces
    /// the current selection. Returns how many were removed.
    pub fn remove_duplicates(&self, playlist: PlaylistId, sort_type: SortType) -> usize {
        self.core().with_state(|state| {
            if state.registry.get(playlist).is_none()
                || !state.sort_allowed(playlist, sort_type, false)
            {
                return 0;
            }
            let Some(target) = state.registry.get_mut(playlist) else {
                return 0;
            };
            let rows = target.duplicate_rows(sort_type);
            if rows.is_empty() {
                return 0;
            }
            target.select_all(false);
            for row in rows {
                target.select(row, true);
            }
            state.delete_selected_locked(playlist)
        })
    }

    /// Deletes entries whose local file no longer exists. Replaces the
    /// current selection. The filesystem is checked outside the lock.
    pub fn remove_unavailable(&self, playlist: PlaylistId) -> usize {
        let candidates: Vec<(EntryId, PathBuf)> = self.core().with_state(|state| {
            state.registry.get(playlist).map_or_else(Vec::new, |target| {
                target
                    .entries
                    .iter()
                    .filter(|entry| !entry.is_stdin())
                    .filter_map(|entry| tuple::local_path(&entry.filename).map(|path| (entry.id, path)))
                    .collect()
            })
        });
        let missing: HashSet<EntryId> = candidates
            .into_iter()
            .filter(|(_, path)| !path.exists())
            .map(|(id, _)| id)
            .collect();
        if missing.is_empty() {
            return 0;
        }

        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return 0;
            };
            target.select_all(false);
            for index in 0..target.len() {
                if missing.contains(&target.entries[index].id) {
                    target.select(index, true);
                }
            }
            state.delete_selected_locked(playlist)
        })
    }

    // Manual queue

    /// Queues row `entry` at queue slot `at` (`None` appends).
    pub fn queue_insert(&self, playlist: PlaylistId, at: Option<usize>, entry: usize) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            if !target.queue_insert(at, entry) {
                return false;
            }
            state.queue_update(
                UpdateLevel::Selection,
                Some(playlist),
                entry,
                1,
                UpdateFlags::QUEUE_CHANGED,
            );
            true
        })
    }

    pub fn queue_insert_selected(&self, playlist: PlaylistId, at: Option<usize>) -> bool {
        self.core().with_state(|state| {
            let Some((row, count)) = state
                .registry
                .get_mut(playlist)
                .and_then(|target| target.queue_insert_selected(at))
            else {
                return false;
            };
            state.queue_update(
                UpdateLevel::Selection,
                Some(playlist),
                row,
                count,
                UpdateFlags::QUEUE_CHANGED,
            );
            true
        })
    }

    pub fn queue_count(&self, playlist: PlaylistId) -> usize {
        self.core().with_state(|state| {
            state
                .registry
                .get(playlist)
                .map_or(0, |target| target.queued.len())
        })
    }

    /// Playlist row held in queue slot `at`.
    pub fn queue_entry(&self, playlist: PlaylistId, at: usize) -> Option<usize> {
        self.core()
            .with_state(|state| state.registry.get(playlist)?.queue_entry(at))
    }

    /// Queue slot of playlist row `entry`.
    pub fn queue_find(&self, playlist: PlaylistId, entry: usize) -> Option<usize> {
        self.core()
            .with_state(|state| state.registry.get(playlist)?.queue_find(entry))
    }

    pub fn queue_delete(&self, playlist: PlaylistId, at: usize, count: usize) -> bool {
        self.core().with_state(|state| {
            let Some((row, count)) = state
                .registry
                .get_mut(playlist)
                .and_then(|target| target.queue_delete(at, count))
            else {
                return false;
            };
            state.queue_update(
                UpdateLevel::Selection,
                Some(playlist),
                row,
                count,
                UpdateFlags::QUEUE_CHANGED,
            );
            true
        })
    }

    pub fn queue_delete_selected(&self, playlist: PlaylistId) -> bool {
        self.core().with_state(|state| {
            let Some((row, count)) = state
                .registry
                .get_mut(playlist)
                .and_then(|target| target.queue_delete_selected())
            else {
                return false;
            };
            state.queue_update(
                UpdateLevel::Selection,
                Some(playlist),
                row,
                count,
                UpdateFlags::QUEUE_CHANGED,
            );
            true
        })
    }

    // Focus

    pub fn set_focus(&self, playlist: PlaylistId, at: Option<usize>) -> bool {
        self.core().with_state(|state| {
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            if at.is_some_and(|at| at >= target.len()) {
                return false;
            }
            if let Some((row, count)) = target.set_focus(at) {
                state.queue_update(UpdateLevel::Selection, Some(playlist), row, count, UpdateFlags::NONE);
            }
            true
        })
    }

    pub fn focus(&self, playlist: PlaylistId) -> Option<usize> {
        self.core()
            .with_state(|state| state.registry.get(playlist)?.focus_index())
    }

    // Scanning

    /// Nominal scan switch. Background scanning also stays off while
    /// metadata is deferred until play time.
    pub fn enable_scan(&self, enabled: bool) {
        self.core().with_state(|state| {
            state.config.scan.enabled = enabled;
            state.scan.set_enabled(enabled);
            state.scan_restart();
        });
    }

    pub fn rescan_playlist(&self, playlist: PlaylistId) -> bool {
        self.core()
            .with_state(|state| state.rescan_where(playlist, |_| true))
    }

    pub fn rescan_selected(&self, playlist: PlaylistId) -> bool {
        self.core()
            .with_state(|state| state.rescan_where(playlist, |entry| entry.selected))
    }

    /// Forgets one entry's metadata so it is scanned again. A no-op while
    /// the entry is already unscanned.
    pub fn rescan_entry(&self, playlist: PlaylistId, at: usize) -> bool {
        self.core().with_state(|state| {
            let style = &state.style;
            let Some(target) = state.registry.get_mut(playlist) else {
                return false;
            };
            let Some(entry) = target.entry(at) else {
                return false;
            };
            if entry.tuple.is_none() {
                return false;
            }
            let id = entry.id;
            if !target.set_entry_tuple(at, None, style) {
                return false;
            }
            target.scanning = true;
            target.scan_ending = false;
            state.scan_cancel(id);
            state.queue_update(UpdateLevel::Metadata, Some(playlist), at, 1, UpdateFlags::NONE);
            state.scan_restart();
            true
        })
    }

    /// Rescans every entry, in every playlist, whose filename is `filename`.
    pub fn rescan_file(&self, filename: &str) -> usize {
        self.core().with_state(|state| {
            let style = &state.style;
            let mut touched = Vec::new();
            for target in &mut state.registry.playlists {
                let rows: Vec<usize> = target
                    .entries
                    .iter()
                    .filter(|entry| entry.tuple.is_some() && &*entry.filename == filename)
                    .map(|entry| entry.number)
                    .collect();
                if rows.is_empty() {
                    continue;
                }
                for row in rows {
                    if target.set_entry_tuple(row, None, style) {
                        touched.push((target.unique_id, row, target.entries[row].id));
                    }
                }
                target.scanning = true;
                target.scan_ending = false;
            }
            for (_, _, id) in &touched {
                state.scan_cancel(*id);
            }
            for (playlist, row, _) in &touched {
                state.queue_update(UpdateLevel::Metadata, Some(*playlist), *row, 1, UpdateFlags::NONE);
            }
            if !touched.is_empty() {
                state.scan_restart();
            }
            touched.len()
        })
    }

    /// Whether `playlist` (or, with `None`, any playlist) is still scanning.
    pub fn scan_in_progress(&self, playlist: Option<PlaylistId>) -> bool {
        self.core().with_state(|state| match playlist {
            Some(id) => state
                .registry
                .get(id)
                .is_some_and(|target| target.scanning || target.scan_ending),
            None => state
                .registry
                .playlists
                .iter()
                .any(|target| target.scanning || target.scan_ending),
        })
    }

    /// Whether an update for `playlist` (or, with `None`, any update) is
    /// waiting for the next flush.
    pub fn update_pending(&self, playlist: Option<PlaylistId>) -> bool {
        self.core().with_state(|state| match playlist {
            Some(id) => state
                .registry
                .get(id)
                .is_some_and(|target| target.next_update.is_pending()),
            None => state.updates.level().is_some(),
        })
    }

    /// The window published by the most recent flush.
    pub fn update_detail(&self, playlist: PlaylistId) -> Option<Update> {
        self.core()
            .with_state(|state| state.registry.get(playlist).map(|target| target.last_update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    pub(super) struct FakeProbe {
        delay: Duration,
        active: AtomicUsize,
        high_water: AtomicUsize,
        calls: AtomicUsize,
        completed: AtomicUsize,
    }

    impl FakeProbe {
        pub(super) fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }

        fn high_water(&self) -> usize {
            self.high_water.load(Ordering::SeqCst)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn completed(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }
    }

    impl Probe for FakeProbe {
        fn probe(&self, request: &crate::probe::ProbeRequest) -> ProbeOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            if request.filename.ends_with(".bad") {
                return ProbeOutcome::failed("unsupported format");
            }
            ProbeOutcome {
                decoder: Some(DecoderHandle::new("fake")),
                tuple: Some(Tuple {
                    title: Some(tuple::display_basename(&request.filename).to_uppercase()),
                    length_ms: Some(1000),
                    ..Tuple::default()
                }),
                error: None,
            }
        }
    }

    pub(super) fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scan.threads = 2;
        config.scan.scan_update_delay_ms = 20;
        config
    }

    pub(super) fn start(config: EngineConfig, probe: Arc<FakeProbe>) -> (Engine, Receiver<EngineEvent>) {
        let engine = Engine::new(config, probe).expect("engine should start");
        let receiver = engine.subscribe();
        (engine, receiver)
    }

    pub(super) fn items(names: &[&str]) -> Vec<PlaylistAddItem> {
        names.iter().map(|name| PlaylistAddItem::new(*name)).collect()
    }

    pub(super) fn scanned_items(names: &[&str]) -> Vec<PlaylistAddItem> {
        names
            .iter()
            .map(|name| {
                PlaylistAddItem::new(*name).with_tuple(Tuple {
                    title: Some(name.to_string()),
                    album: Some("Album".to_string()),
                    length_ms: Some(2000),
                    ..Tuple::default()
                })
            })
            .collect()
    }

    pub(super) fn wait_for_event<F>(
        receiver: &mut Receiver<EngineEvent>,
        timeout: Duration,
        mut predicate: F,
    ) -> EngineEvent
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                panic!("timed out waiting for expected event");
            }
            match receiver.try_recv() {
                Ok(event) => {
                    if predicate(&event) {
                        return event;
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("bus closed while waiting for event"),
            }
        }
    }

    pub(super) fn count_events<F>(
        receiver: &mut Receiver<EngineEvent>,
        window: Duration,
        mut predicate: F,
    ) -> usize
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        let start = Instant::now();
        let mut count = 0;
        while start.elapsed() < window {
            match receiver.try_recv() {
                Ok(event) => {
                    if predicate(&event) {
                        count += 1;
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => break,
            }
        }
        count
    }

    /// Waits for pending flushes to go out, then drops everything received.
    pub(super) fn settle(engine: &Engine, receiver: &mut Receiver<EngineEvent>) {
        let deadline = Instant::now() + WAIT;
        while engine.update_pending(None) {
            assert!(Instant::now() < deadline, "updates never flushed");
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        while receiver.try_recv().is_ok() {}
    }

    /// Joins `handle`, failing the test if it is still blocked at `timeout`.
    pub(super) fn join_within<T>(handle: thread::JoinHandle<T>, timeout: Duration) -> T {
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            assert!(Instant::now() < deadline, "thread still blocked");
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().expect("thread should not panic")
    }

    fn assert_invariants(engine: &Engine) {
        engine.core().with_state(|state| {
            for target in &state.registry.playlists {
                let expected: i64 = target
                    .entries
                    .iter()
                    .filter(|entry| entry.tuple.is_some())
                    .map(Entry::length_ms)
                    .sum();
                assert_eq!(target.total_length_ms, expected);
                for (number, entry) in target.entries.iter().enumerate() {
                    assert_eq!(entry.number, number);
                }
            }
        });
    }

    #[test]
    fn test_new_engine_has_one_active_playlist() {
        let (engine, _receiver) = start(test_config(), FakeProbe::with_delay(Duration::ZERO));
        assert_eq!(engine.playlist_count(), 1);
        let active = engine.active().expect("active playlist");
        assert_eq!(engine.playlist_at(0), Some(active));
        assert_eq!(engine.title(active).as_deref(), Some(crate::playlist::DEFAULT_TITLE));
        assert_eq!(engine.playing(), None);
    }

    #[test]
    fn test_three_entry_scan_fires_scan_complete_once() {
        let probe = FakeProbe::with_delay(Duration::from_millis(20));
        let (engine, mut receiver) = start(test_config(), probe.clone());
        let playlist = engine.active().expect("active playlist");

        assert_eq!(
            engine.insert_entries(playlist, Some(0), items(&["/m/a.mp3", "/m/b.mp3", "/m/c.bad"])),
            3
        );
        assert_eq!(engine.entry_count(playlist), 3);

        wait_for_event(&mut receiver, WAIT, |event| *event == EngineEvent::ScanComplete);
        let extra = count_events(&mut receiver, Duration::from_millis(300), |event| {
            *event == EngineEvent::ScanComplete
        });
        assert_eq!(extra, 0);

        assert_eq!(engine.entry_info(playlist, 0).map(|info| info.title), Some("A".to_string()));
        assert!(!engine.entry_failed(playlist, 1));
        assert!(engine.entry_failed(playlist, 2));
        assert_eq!(
            engine.entry_error(playlist, 2).as_deref(),
            Some("unsupported format")
        );
        assert_eq!(engine.entry_info(playlist, 2).map(|info| info.title), Some("c".to_string()));
        assert!(!engine.scan_in_progress(None));
        assert_eq!(probe.calls(), 3);
        assert_invariants(&engine);
    }

    #[test]
    fn test_concurrent_probes_never_exceed_thread_bound() {
        let probe = FakeProbe::with_delay(Duration::from_millis(15));
        let (engine, mut receiver) = start(test_config(), probe.clone());
        let first = engine.active().expect("active playlist");
        let second = engine.insert_playlist(None, None);

        let names: Vec<String> = (0..12).map(|n| format!("/m/{n}.mp3")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        engine.insert_entries(first, None, items(&names[..6]));
        engine.insert_entries(second, None, items(&names[6..]));

        let deadline = Instant::now() + WAIT;
        while engine.scan_in_progress(None) {
            assert!(Instant::now() < deadline, "scan did not finish");
            thread::sleep(Duration::from_millis(10));
        }
        wait_for_event(&mut receiver, WAIT, |event| *event == EngineEvent::ScanComplete);
        assert!(probe.high_water() <= 2);
        assert_eq!(probe.calls(), 12);
        assert_eq!(engine.total_length(first) + engine.total_length(second), 12_000);
    }

    #[test]
    fn test_blocking_read_waits_for_priority_scan() {
        let mut config = test_config();
        config.scan.enabled = false;
        let probe = FakeProbe::with_delay(Duration::from_millis(50));
        let (engine, _receiver) = start(config, probe.clone());
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, items(&["/m/song.mp3", "stdin://"]));

        assert!(engine.entry_tuple(playlist, 0, ReadMode::Guess).is_none());
        let tuple = engine
            .entry_tuple(playlist, 0, ReadMode::Wait)
            .expect("scan should install a tuple");
        assert_eq!(tuple.title.as_deref(), Some("SONG"));
        assert_eq!(
            engine.entry_decoder(playlist, 0, ReadMode::Guess),
            Some(DecoderHandle::new("fake"))
        );

        assert!(engine.entry_tuple(playlist, 1, ReadMode::Wait).is_none());
        assert_eq!(probe.calls(), 1);
        assert!(engine.entry_tuple(playlist, 9, ReadMode::Wait).is_none());
    }

    #[test]
    fn test_blocking_read_joins_background_scan() {
        let probe = FakeProbe::with_delay(Duration::from_millis(300));
        let (engine, _receiver) = start(test_config(), probe.clone());
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, items(&["/m/song.mp3"]));

        let deadline = Instant::now() + WAIT;
        while probe.calls() == 0 {
            assert!(Instant::now() < deadline, "background scan never started");
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(probe.completed(), 0);

        let tuple = engine
            .entry_tuple(playlist, 0, ReadMode::Wait)
            .expect("background scan installs the tuple");
        assert_eq!(tuple.title.as_deref(), Some("SONG"));
        assert_eq!(probe.completed(), 1);
        assert_eq!(probe.calls(), 1);
    }

    #[test]
    fn test_blocking_read_released_when_entry_deleted() {
        let mut config = test_config();
        config.scan.enabled = false;
        let probe = FakeProbe::with_delay(Duration::from_millis(1000));
        let (engine, _receiver) = start(config, probe.clone());
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, items(&["/m/slow.mp3"]));

        let reader = {
            let engine = engine.clone();
            thread::spawn(move || engine.entry_tuple(playlist, 0, ReadMode::Wait))
        };
        let deadline = Instant::now() + WAIT;
        while probe.calls() == 0 {
            assert!(Instant::now() < deadline, "priority scan never started");
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(engine.delete_entries(playlist, 0, 1), 1);
        assert!(join_within(reader, Duration::from_millis(500)).is_none());
        assert_eq!(probe.completed(), 0);
        assert_eq!(engine.entry_count(playlist), 0);
    }

    #[test]
    fn test_blocking_read_returns_failed_fallback() {
        let mut config = test_config();
        config.scan.metadata_on_play = true;
        let (engine, _receiver) = start(config, FakeProbe::with_delay(Duration::from_millis(10)));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, items(&["/m/broken.bad"]));

        let tuple = engine
            .entry_tuple(playlist, 0, ReadMode::Wait)
            .expect("failed entries carry a fallback tuple");
        assert_eq!(tuple.title.as_deref(), Some("broken"));
        assert!(engine.entry_failed(playlist, 0));
        assert!(engine.entry_decoder(playlist, 0, ReadMode::Wait).is_none());
    }

    #[test]
    fn test_delete_positioned_entry_advances_once() {
        let mut config = test_config();
        config.playback.advance_on_delete = true;
        let (engine, mut receiver) = start(config, FakeProbe::with_delay(Duration::ZERO));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, scanned_items(&["/m/a.mp3", "/m/b.mp3", "/m/c.mp3"]));
        engine.set_position(playlist, Some(1));
        wait_for_event(&mut receiver, WAIT, |event| {
            *event == EngineEvent::PositionChanged(playlist)
        });

        assert_eq!(engine.delete_entries(playlist, 1, 1), 1);
        assert_eq!(engine.entry_count(playlist), 2);
        assert_eq!(engine.position(playlist), Some(1));
        assert_eq!(engine.entry_filename(playlist, 1).as_deref(), Some("/m/c.mp3"));
        let changes = count_events(&mut receiver, Duration::from_millis(200), |event| {
            *event == EngineEvent::PositionChanged(playlist)
        });
        assert_eq!(changes, 1);
        assert_invariants(&engine);
    }

    #[test]
    fn test_delete_without_advance_clears_position() {
        let (engine, _receiver) = start(test_config(), FakeProbe::with_delay(Duration::ZERO));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, scanned_items(&["/m/a.mp3", "/m/b.mp3"]));
        engine.set_position(playlist, Some(0));
        engine.set_focus(playlist, Some(0));
        engine.delete_entries(playlist, 0, 1);
        assert_eq!(engine.position(playlist), None);
        assert_eq!(engine.focus(playlist), Some(0));
        assert_eq!(engine.delete_entries(playlist, 5, 1), 0);
    }

    #[test]
    fn test_concurrent_metadata_updates_coalesce_into_one_flush() {
        let mut config = test_config();
        config.scan.enabled = false;
        config.scan.update_delay_ms = 150;
        let (engine, mut receiver) = start(config, FakeProbe::with_delay(Duration::ZERO));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(
            playlist,
            None,
            scanned_items(&["/m/0.mp3", "/m/1.mp3", "/m/2.mp3", "/m/3.mp3", "/m/4.mp3"]),
        );
        settle(&engine, &mut receiver);

        let handles: Vec<_> = [1usize, 3]
            .into_iter()
            .map(|row| {
                let engine = engine.clone();
                thread::spawn(move || engine.rescan_entry(playlist, row))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().expect("rescan thread"));
        }

        let event = wait_for_event(&mut receiver, WAIT, |event| {
            matches!(event, EngineEvent::Update(_))
        });
        assert_eq!(event, EngineEvent::Update(UpdateLevel::Metadata));
        let detail = engine.update_detail(playlist).expect("playlist exists");
        assert_eq!(detail.level, Some(UpdateLevel::Metadata));
        assert_eq!(detail.before, 1);
        assert_eq!(detail.after, 1);
        let more = count_events(&mut receiver, Duration::from_millis(300), |event| {
            matches!(event, EngineEvent::Update(_))
        });
        assert_eq!(more, 0);
    }

    #[test]
    fn test_rescan_entry_is_idempotent() {
        let mut config = test_config();
        config.scan.enabled = false;
        let probe = FakeProbe::with_delay(Duration::ZERO);
        let (engine, _receiver) = start(config, probe);
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, scanned_items(&["/m/a.mp3", "/m/b.mp3"]));
        assert_eq!(engine.total_length(playlist), 4000);

        assert!(engine.rescan_entry(playlist, 0));
        assert!(!engine.rescan_entry(playlist, 0));
        assert!(engine.entry_tuple(playlist, 0, ReadMode::Guess).is_none());
        assert_eq!(engine.total_length(playlist), 2000);
        assert_invariants(&engine);

        engine.enable_scan(true);
        let deadline = Instant::now() + WAIT;
        while engine.scan_in_progress(Some(playlist)) {
            assert!(Instant::now() < deadline, "rescan did not finish");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.total_length(playlist), 3000);
        assert_invariants(&engine);
    }

    #[test]
    fn test_rescan_file_touches_every_playlist() {
        let mut config = test_config();
        config.scan.enabled = false;
        let (engine, _receiver) = start(config, FakeProbe::with_delay(Duration::ZERO));
        let first = engine.active().expect("active playlist");
        let second = engine.insert_playlist(None, None);
        engine.insert_entries(first, None, scanned_items(&["/m/a.mp3", "/m/b.mp3"]));
        engine.insert_entries(second, None, scanned_items(&["/m/b.mp3"]));

        assert_eq!(engine.rescan_file("/m/b.mp3"), 2);
        assert!(engine.entry_tuple(first, 0, ReadMode::Guess).is_some());
        assert!(engine.entry_tuple(first, 1, ReadMode::Guess).is_none());
        assert!(engine.entry_tuple(second, 0, ReadMode::Guess).is_none());
        assert!(engine.scan_in_progress(Some(second)));
        assert_eq!(engine.rescan_file("/m/b.mp3"), 0);
    }

    #[test]
    fn test_repeated_rescan_keeps_request_in_flight() {
        let probe = FakeProbe::with_delay(Duration::from_millis(200));
        let (engine, mut receiver) = start(test_config(), probe.clone());
        let playlist = engine.active().expect("active playlist");
        settle(&engine, &mut receiver);
        engine.insert_entries(playlist, None, items(&["/m/a.mp3"]));

        let deadline = Instant::now() + WAIT;
        while probe.calls() == 0 {
            assert!(Instant::now() < deadline, "background scan never started");
            thread::sleep(Duration::from_millis(2));
        }
        assert!(engine.rescan_playlist(playlist));
        assert!(engine.rescan_playlist(playlist));

        wait_for_event(&mut receiver, WAIT, |event| *event == EngineEvent::ScanComplete);
        assert_eq!(probe.calls(), 1);
        assert_eq!(
            engine.entry_info(playlist, 0).map(|info| info.title),
            Some("A".to_string())
        );
    }

    #[test]
    fn test_tuple_sort_refused_until_scanned() {
        let mut config = test_config();
        config.scan.enabled = false;
        let (engine, mut receiver) = start(config, FakeProbe::with_delay(Duration::ZERO));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, items(&["/m/b.mp3", "/m/a.mp3"]));

        assert!(!engine.sort_by(playlist, SortType::Title));
        wait_for_event(&mut receiver, WAIT, |event| {
            *event == EngineEvent::SortRefused(playlist)
        });
        assert!(engine.sort_by(playlist, SortType::Filename));
        assert_eq!(engine.entry_filename(playlist, 0).as_deref(), Some("/m/a.mp3"));
    }

    #[test]
    fn test_deleting_last_playlist_creates_a_fresh_one() {
        let (engine, mut receiver) = start(test_config(), FakeProbe::with_delay(Duration::ZERO));
        let only = engine.active().expect("active playlist");
        assert!(engine.delete_playlist(only));
        assert_eq!(engine.playlist_count(), 1);
        let fresh = engine.active().expect("replacement is active");
        assert_ne!(fresh, only);
        assert!(engine.title(only).is_none());
        assert!(!engine.delete_playlist(only));
        wait_for_event(&mut receiver, WAIT, |event| {
            *event == EngineEvent::ActivePlaylistChanged
        });
    }

    #[test]
    fn test_blank_and_temporary_playlists() {
        let (engine, _receiver) = start(test_config(), FakeProbe::with_delay(Duration::ZERO));
        let first = engine.active().expect("active playlist");
        assert_eq!(engine.blank_playlist(), first);

        engine.insert_entries(first, None, scanned_items(&["/m/a.mp3"]));
        let blank = engine.blank_playlist();
        assert_ne!(blank, first);
        assert_eq!(engine.playlist_index(blank), Some(1));

        let temporary = engine.temporary_playlist();
        assert_eq!(engine.title(temporary).as_deref(), Some(TEMPORARY_TITLE));
        assert_eq!(engine.temporary_playlist(), temporary);
    }

    #[test]
    fn test_selection_queue_and_patterns() {
        let (engine, _receiver) = start(test_config(), FakeProbe::with_delay(Duration::ZERO));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(
            playlist,
            None,
            scanned_items(&["/m/Alpha.mp3", "/m/beta.mp3", "/m/alphabet.mp3"]),
        );

        let patterns = SelectPatterns {
            file_name: Some("ALPHA".to_string()),
            ..SelectPatterns::default()
        };
        assert_eq!(engine.select_by_patterns(playlist, &patterns), 2);
        assert_eq!(engine.selected_length(playlist), 4000);
        assert!(engine.queue_insert_selected(playlist, None));
        assert_eq!(engine.queue_count(playlist), 2);
        assert_eq!(engine.queue_entry(playlist, 1), Some(2));
        assert_eq!(engine.queue_find(playlist, 0), Some(0));
        assert!(!engine.queue_insert(playlist, None, 0));
        assert!(engine.queue_insert(playlist, Some(0), 1));
        assert_eq!(engine.queue_entry(playlist, 0), Some(1));
        assert!(engine.queue_delete(playlist, 0, 1));
        assert_eq!(engine.queue_count(playlist), 2);

        assert_eq!(engine.delete_selected(playlist), 2);
        assert_eq!(engine.queue_count(playlist), 0);
        assert_eq!(engine.selected_count(playlist), 0);
        assert_invariants(&engine);
    }

    #[test]
    fn test_remove_duplicates_and_unavailable() {
        let (engine, _receiver) = start(test_config(), FakeProbe::with_delay(Duration::ZERO));
        let playlist = engine.active().expect("active playlist");
        let existing = std::env::temp_dir().join(format!(
            "tracklist_present_{}.mp3",
            std::process::id()
        ));
        std::fs::write(&existing, b"").expect("write temp file");
        let existing_name = existing.to_string_lossy().into_owned();
        engine.insert_entries(
            playlist,
            None,
            scanned_items(&[&existing_name, "/nonexistent/x.mp3", &existing_name, "http://s/x"]),
        );

        assert_eq!(engine.remove_duplicates(playlist, SortType::Path), 1);
        assert_eq!(engine.entry_count(playlist), 3);
        assert_eq!(engine.remove_unavailable(playlist), 1);
        assert_eq!(engine.entry_count(playlist), 2);
        assert_eq!(engine.entry_filename(playlist, 1).as_deref(), Some("http://s/x"));
        let _ = std::fs::remove_file(&existing);
    }

    #[test]
    fn test_title_format_change_reformats_entries() {
        let (engine, _receiver) = start(test_config(), FakeProbe::with_delay(Duration::ZERO));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, scanned_items(&["/m/a.mp3"]));
        assert_eq!(
            engine.entry_info(playlist, 0).map(|info| info.formatted_title),
            Some("Album - /m/a.mp3".to_string())
        );

        let mut config = engine.config();
        config.display.title_format = "{title}".to_string();
        engine.apply_config(config);
        assert_eq!(
            engine.entry_info(playlist, 0).map(|info| info.formatted_title),
            Some("/m/a.mp3".to_string())
        );
    }

    #[test]
    fn test_shutdown_clears_registry() {
        let (engine, _receiver) = start(test_config(), FakeProbe::with_delay(Duration::from_millis(30)));
        let playlist = engine.active().expect("active playlist");
        engine.insert_entries(playlist, None, items(&["/m/a.mp3", "/m/b.mp3"]));
        engine.shutdown();
        assert_eq!(engine.playlist_count(), 0);
        assert!(engine.entry_tuple(playlist, 0, ReadMode::Wait).is_none());
        engine.shutdown();
    }
}
