//! One playlist: ordered entries with selection, manual queue, shuffle
//! history and position/focus cursors.
//!
//! Entries are addressed two ways. `number` is the current index and changes
//! whenever rows move; `EntryId` is stable and is what cursors and the queue
//! hold, so a reorder never leaves a cursor pointing at the wrong row.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::entry::{Entry, EntryId, TitleStyle};
use crate::protocol::{PlaylistId, Update, UpdateLevel};
use crate::sort::SortType;
use crate::tuple::{Tuple, TupleField};

pub const DEFAULT_TITLE: &str = "New Playlist";
pub const TEMPORARY_TITLE: &str = "Now Playing";

/// Playback ordering policy consulted when advancing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvancePolicy {
    pub shuffle: bool,
    pub album_shuffle: bool,
    pub repeat: bool,
}

/// What a successful advance did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Advanced {
    /// Index of the entry popped off the manual queue, if that is where the
    /// new position came from.
    pub(crate) queue_popped: Option<usize>,
}

/// Bookkeeping returned by entry removal.
#[derive(Debug, Clone, Default)]
pub(crate) struct Removal {
    /// First index whose row changed.
    pub(crate) at: usize,
    /// Surviving rows inside the changed window.
    pub(crate) changed: usize,
    /// Where a linear advance should continue after the removal.
    pub(crate) hint: usize,
    pub(crate) removed: Vec<EntryId>,
    pub(crate) position_removed: bool,
    pub(crate) queue_changed: bool,
}

/// Half-open changed row window `(at, count)`.
pub(crate) type RowRange = (usize, usize);

#[derive(Debug, Default)]
struct RangeTracker {
    first: Option<usize>,
    last: usize,
}

impl RangeTracker {
    fn touch(&mut self, index: usize) {
        if self.first.is_none() {
            self.first = Some(index);
        }
        self.last = index;
    }

    fn finish(self) -> Option<RowRange> {
        self.first.map(|first| (first, self.last + 1 - first))
    }
}

#[derive(Debug)]
pub struct Playlist {
    pub(crate) number: usize,
    pub(crate) unique_id: PlaylistId,
    pub(crate) title: String,
    pub(crate) filename: Option<PathBuf>,
    pub(crate) modified: bool,
    pub(crate) entries: Vec<Entry>,
    index: HashMap<EntryId, usize>,
    pub(crate) position: Option<EntryId>,
    pub(crate) focus: Option<EntryId>,
    pub(crate) selected_count: usize,
    pub(crate) last_shuffle_rank: u64,
    pub(crate) queued: Vec<EntryId>,
    pub(crate) total_length_ms: i64,
    pub(crate) selected_length_ms: i64,
    pub(crate) scanning: bool,
    pub(crate) scan_ending: bool,
    pub(crate) next_update: Update,
    pub(crate) last_update: Update,
    pub(crate) resume_time_ms: i64,
}

impl Playlist {
    pub(crate) fn new(unique_id: PlaylistId) -> Self {
        Self {
            number: 0,
            unique_id,
            title: DEFAULT_TITLE.to_string(),
            filename: None,
            modified: true,
            entries: Vec::new(),
            index: HashMap::new(),
            position: None,
            focus: None,
            selected_count: 0,
            last_shuffle_rank: 0,
            queued: Vec::new(),
            total_length_ms: 0,
            selected_length_ms: 0,
            scanning: false,
            scan_ending: false,
            next_update: Update::default(),
            last_update: Update::default(),
            resume_time_ms: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    pub(crate) fn index_of(&self, id: EntryId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub(crate) fn position_index(&self) -> Option<usize> {
        self.position.and_then(|id| self.index_of(id))
    }

    pub(crate) fn focus_index(&self) -> Option<usize> {
        self.focus.and_then(|id| self.index_of(id))
    }

    /// Blank means untitled-default, no backing file and no entries.
    pub(crate) fn is_blank(&self) -> bool {
        self.title == DEFAULT_TITLE && self.filename.is_none() && self.entries.is_empty()
    }

    fn renumber(&mut self, from: usize) {
        for (number, entry) in self.entries.iter_mut().enumerate().skip(from) {
            entry.number = number;
            self.index.insert(entry.id, number);
        }
    }

    fn debug_check(&self) {
        debug_assert!(self
            .entries
            .iter()
            .enumerate()
            .all(|(number, entry)| entry.number == number
                && self.index.get(&entry.id) == Some(&number)));
        debug_assert_eq!(self.index.len(), self.entries.len());
        debug_assert_eq!(
            self.total_length_ms,
            self.entries.iter().map(Entry::length_ms).sum::<i64>()
        );
        debug_assert_eq!(
            self.selected_count,
            self.entries.iter().filter(|entry| entry.selected).count()
        );
    }

    /// Splices `entries` in at `at`, clamped to the playlist length; `None`
    /// appends. Returns the index of the first inserted row.
    pub(crate) fn insert_entries(&mut self, at: Option<usize>, entries: Vec<Entry>) -> usize {
        let at = at.map_or(self.entries.len(), |at| at.min(self.entries.len()));
        for entry in &entries {
            self.total_length_ms += entry.length_ms();
        }
        self.entries.splice(at..at, entries);
        self.renumber(at);
        self.debug_check();
        at
    }

    /// Removes rows `at..at + count`, clamped. Focus moves to the row after
    /// the range, else the row before it.
    pub(crate) fn remove_range(&mut self, at: usize, count: usize) -> Removal {
        let len = self.entries.len();
        let at = at.min(len);
        let end = at + count.min(len - at);

        let position_removed = self
            .position_index()
            .is_some_and(|index| index >= at && index < end);
        if position_removed {
            self.set_position(None, false);
        }

        if let Some(focus) = self.focus_index() {
            if focus >= at && focus < end {
                self.focus = if end < len {
                    Some(self.entries[end].id)
                } else if at > 0 {
                    Some(self.entries[at - 1].id)
                } else {
                    None
                };
            }
        }

        let mut queue_changed = false;
        for entry in &self.entries[at..end] {
            if entry.queued {
                queue_changed = true;
            }
            if entry.selected {
                self.selected_count -= 1;
                self.selected_length_ms -= entry.length_ms();
            }
            self.total_length_ms -= entry.length_ms();
        }

        let mut removed = Vec::with_capacity(end - at);
        for entry in self.entries.drain(at..end) {
            self.index.remove(&entry.id);
            removed.push(entry.id);
        }
        if queue_changed {
            self.queued.retain(|id| self.index.contains_key(id));
        }
        self.renumber(at);
        self.debug_check();

        Removal {
            at,
            changed: 0,
            hint: at,
            removed,
            position_removed,
            queue_changed,
        }
    }

    /// Focus target after deleting the selection: the next unselected row
    /// after the focus, else the previous one.
    fn unselected_focus(&self) -> Option<EntryId> {
        let focus = self.focus_index()?;
        if !self.entries[focus].selected {
            return Some(self.entries[focus].id);
        }
        self.entries[focus + 1..]
            .iter()
            .find(|entry| !entry.selected)
            .or_else(|| self.entries[..focus].iter().rev().find(|entry| !entry.selected))
            .map(|entry| entry.id)
    }

    pub(crate) fn remove_selected(&mut self) -> Option<Removal> {
        if self.selected_count == 0 {
            return None;
        }

        let position_removed = self
            .position_index()
            .is_some_and(|index| self.entries[index].selected);
        if position_removed {
            self.set_position(None, false);
        }
        self.focus = self.unselected_focus();

        let before = self.entries.iter().take_while(|entry| !entry.selected).count();
        let after = self
            .entries
            .iter()
            .rev()
            .take_while(|entry| !entry.selected)
            .count();

        let mut queue_changed = false;
        for entry in self.entries.iter().filter(|entry| entry.selected) {
            if entry.queued {
                queue_changed = true;
            }
            self.total_length_ms -= entry.length_ms();
        }

        let (kept, dropped): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| !entry.selected);
        self.entries = kept;
        for entry in &dropped {
            self.index.remove(&entry.id);
        }
        if queue_changed {
            self.queued.retain(|id| self.index.contains_key(id));
        }
        self.selected_count = 0;
        self.selected_length_ms = 0;
        self.renumber(before);
        self.debug_check();

        let remaining = self.entries.len();
        Some(Removal {
            at: before,
            changed: remaining - after - before,
            hint: remaining - after,
            removed: dropped.iter().map(|entry| entry.id).collect(),
            position_removed,
            queue_changed,
        })
    }

    /// Installs a tuple and keeps totals in step. Returns false for segment
    /// entries, whose tuple is fixed.
    pub(crate) fn set_entry_tuple(
        &mut self,
        index: usize,
        tuple: Option<Arc<Tuple>>,
        style: &TitleStyle,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        let old_length = entry.length_ms();
        let selected = entry.selected;
        if !entry.set_tuple(tuple, style) {
            return false;
        }
        let delta = entry.length_ms() - old_length;
        self.total_length_ms += delta;
        if selected {
            self.selected_length_ms += delta;
        }
        self.debug_check();
        true
    }

    /// Gives up on an entry: a filename-only tuple plus the failure flag.
    pub(crate) fn mark_failed(&mut self, index: usize, error: Option<String>, style: &TitleStyle) {
        let Some(filename) = self.entries.get(index).map(|entry| entry.filename.clone()) else {
            return;
        };
        let fallback = Arc::new(Tuple::from_filename(&filename));
        if self.set_entry_tuple(index, Some(fallback), style) {
            let entry = &mut self.entries[index];
            entry.failed = true;
            entry.error = error;
        }
    }

    pub(crate) fn reformat(&mut self, style: &TitleStyle) {
        for entry in &mut self.entries {
            entry.format(style);
        }
        self.total_length_ms = self.entries.iter().map(Entry::length_ms).sum();
        self.selected_length_ms = self
            .entries
            .iter()
            .filter(|entry| entry.selected)
            .map(Entry::length_ms)
            .sum();
    }

    /// True when every considered entry already carries a tuple.
    pub(crate) fn entries_are_scanned(&self, selected_only: bool) -> bool {
        self.entries
            .iter()
            .filter(|entry| !selected_only || entry.selected)
            .all(|entry| entry.tuple.is_some())
    }

    // Selection

    /// Returns true when the flag actually changed.
    pub(crate) fn select(&mut self, index: usize, selected: bool) -> bool {
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        if entry.selected == selected {
            return false;
        }
        entry.selected = selected;
        let length = entry.length_ms();
        if selected {
            self.selected_count += 1;
            self.selected_length_ms += length;
        } else {
            self.selected_count -= 1;
            self.selected_length_ms -= length;
        }
        true
    }

    pub(crate) fn select_all(&mut self, selected: bool) -> Option<RowRange> {
        let mut range = RangeTracker::default();
        for entry in &mut self.entries {
            if entry.selected != selected {
                entry.selected = selected;
                range.touch(entry.number);
            }
        }
        if selected {
            self.selected_count = self.entries.len();
            self.selected_length_ms = self.total_length_ms;
        } else {
            self.selected_count = 0;
            self.selected_length_ms = 0;
        }
        range.finish()
    }

    pub(crate) fn selected_count_in(&self, at: usize, count: usize) -> usize {
        let at = at.min(self.entries.len());
        let end = at.saturating_add(count).min(self.entries.len());
        self.entries[at..end]
            .iter()
            .filter(|entry| entry.selected)
            .count()
    }

    // Cursors

    /// Sets the playing position. With `update_shuffle` the entry is stamped
    /// as the most recent step of shuffle history.
    pub(crate) fn set_position(&mut self, id: Option<EntryId>, update_shuffle: bool) {
        self.position = id;
        self.resume_time_ms = 0;
        if !update_shuffle {
            return;
        }
        if let Some(index) = id.and_then(|id| self.index_of(id)) {
            self.last_shuffle_rank += 1;
            self.entries[index].shuffle_rank = self.last_shuffle_rank;
        }
    }

    /// Moves focus; returns the rows whose focus state changed.
    pub(crate) fn set_focus(&mut self, index: Option<usize>) -> Option<RowRange> {
        let old = self.focus_index();
        let new = index.filter(|index| *index < self.entries.len());
        if old == new {
            return None;
        }
        self.focus = new.map(|index| self.entries[index].id);
        match (old, new) {
            (Some(a), Some(b)) => Some((a.min(b), a.max(b) - a.min(b) + 1)),
            (Some(a), None) | (None, Some(a)) => Some((a, 1)),
            (None, None) => None,
        }
    }

    // Manual queue

    pub(crate) fn queue_insert(&mut self, at: Option<usize>, index: usize) -> bool {
        let Some(entry) = self.entries.get(index) else {
            return false;
        };
        if entry.queued {
            return false;
        }
        let at = match at {
            Some(at) if at > self.queued.len() => return false,
            Some(at) => at,
            None => self.queued.len(),
        };
        let id = entry.id;
        self.queued.insert(at, id);
        self.entries[index].queued = true;
        true
    }

    /// Queues every selected, not-yet-queued entry in playlist order.
    pub(crate) fn queue_insert_selected(&mut self, at: Option<usize>) -> Option<RowRange> {
        let at = match at {
            Some(at) if at > self.queued.len() => return None,
            Some(at) => at,
            None => self.queued.len(),
        };
        let mut range = RangeTracker::default();
        let mut added = Vec::new();
        for entry in &mut self.entries {
            if entry.selected && !entry.queued {
                entry.queued = true;
                added.push(entry.id);
                range.touch(entry.number);
            }
        }
        self.queued.splice(at..at, added);
        range.finish()
    }

    /// Playlist index of the queue slot `at`.
    pub(crate) fn queue_entry(&self, at: usize) -> Option<usize> {
        self.queued.get(at).and_then(|id| self.index_of(*id))
    }

    /// Queue slot holding playlist row `index`.
    pub(crate) fn queue_find(&self, index: usize) -> Option<usize> {
        let id = self.entries.get(index)?.id;
        self.queued.iter().position(|queued| *queued == id)
    }

    pub(crate) fn queue_delete(&mut self, at: usize, count: usize) -> Option<RowRange> {
        let at = at.min(self.queued.len());
        let end = at.saturating_add(count).min(self.queued.len());
        if at == end {
            return None;
        }
        let mut range = RangeTracker::default();
        let mut rows: Vec<usize> = Vec::with_capacity(end - at);
        for id in self.queued.drain(at..end) {
            if let Some(index) = self.index.get(&id).copied() {
                self.entries[index].queued = false;
                rows.push(index);
            }
        }
        rows.sort_unstable();
        for row in rows {
            range.touch(row);
        }
        range.finish()
    }

    pub(crate) fn queue_delete_selected(&mut self) -> Option<RowRange> {
        let mut range = RangeTracker::default();
        for entry in &mut self.entries {
            if entry.queued && entry.selected {
                entry.queued = false;
                range.touch(entry.number);
            }
        }
        let range = range.finish()?;
        let entries = &self.entries;
        let index = &self.index;
        self.queued
            .retain(|id| index.get(id).is_some_and(|row| entries[*row].queued));
        Some(range)
    }

    // Shuffle history

    pub(crate) fn shuffle_reset(&mut self) {
        self.last_shuffle_rank = 0;
        for entry in &mut self.entries {
            entry.shuffle_rank = 0;
        }
    }

    fn current_rank(&self) -> Option<u64> {
        self.position_index()
            .map(|index| self.entries[index].shuffle_rank)
    }

    /// Steps back to the entry played before the current one. Without a
    /// position there is nothing to step back from.
    fn shuffle_prev(&mut self) -> bool {
        let Some(current) = self.current_rank() else {
            return false;
        };
        let found = self
            .entries
            .iter()
            .filter(|entry| entry.shuffle_rank > 0 && entry.shuffle_rank < current)
            .max_by_key(|entry| entry.shuffle_rank)
            .map(|entry| entry.id);
        match found {
            Some(id) => {
                self.set_position(Some(id), false);
                true
            }
            None => false,
        }
    }

    fn same_album(a: &Entry, b: &Entry) -> bool {
        let album = |entry: &Entry| {
            entry
                .tuple
                .as_deref()
                .and_then(|tuple| tuple.get_str(TupleField::Album))
                .map(str::to_string)
        };
        match (album(a), album(b)) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        }
    }

    /// In album mode a random pick must start an album run: either the
    /// first row or a row whose predecessor is from another album or already
    /// played.
    fn is_shuffle_choice(&self, index: usize, by_album: bool) -> bool {
        let entry = &self.entries[index];
        if entry.shuffle_rank != 0 {
            return false;
        }
        if !by_album || index == 0 {
            return true;
        }
        let previous = &self.entries[index - 1];
        previous.shuffle_rank != 0 || !Self::same_album(previous, entry)
    }

    fn shuffle_next<R: Rng>(&mut self, rng: &mut R, by_album: bool) -> bool {
        if let Some(position) = self.position_index() {
            let current = self.entries[position].shuffle_rank;

            // Replay forward through history first.
            let replay = self
                .entries
                .iter()
                .filter(|entry| entry.shuffle_rank > current)
                .min_by_key(|entry| entry.shuffle_rank)
                .map(|entry| entry.id);
            if let Some(id) = replay {
                self.set_position(Some(id), false);
                return true;
            }

            if by_album && position + 1 < self.entries.len() {
                let next = &self.entries[position + 1];
                if next.shuffle_rank == 0 && Self::same_album(&self.entries[position], next) {
                    let id = next.id;
                    self.set_position(Some(id), true);
                    return true;
                }
            }
        }

        let choices: Vec<EntryId> = (0..self.entries.len())
            .filter(|index| self.is_shuffle_choice(*index, by_album))
            .map(|index| self.entries[index].id)
            .collect();
        if choices.is_empty() {
            return false;
        }
        let id = choices[rng.random_range(0..choices.len())];
        self.set_position(Some(id), true);
        true
    }

    /// Advances the position. The manual queue wins over every ordering
    /// policy; `hint` is the row a linear advance should land on.
    pub(crate) fn next_song<R: Rng>(
        &mut self,
        policy: AdvancePolicy,
        hint: usize,
        rng: &mut R,
    ) -> Option<Advanced> {
        if self.entries.is_empty() {
            return None;
        }

        if !self.queued.is_empty() {
            let id = self.queued.remove(0);
            let index = self.index_of(id)?;
            self.entries[index].queued = false;
            self.set_position(Some(id), true);
            return Some(Advanced {
                queue_popped: Some(index),
            });
        }

        if policy.shuffle {
            if !self.shuffle_next(rng, policy.album_shuffle) {
                if !policy.repeat {
                    return None;
                }
                self.shuffle_reset();
                if !self.shuffle_next(rng, policy.album_shuffle) {
                    return None;
                }
            }
        } else {
            let mut hint = hint;
            if hint >= self.entries.len() {
                if !policy.repeat {
                    return None;
                }
                hint = 0;
            }
            let id = self.entries[hint].id;
            self.set_position(Some(id), true);
        }

        Some(Advanced { queue_popped: None })
    }

    pub(crate) fn prev_song(&mut self, shuffle: bool) -> bool {
        if shuffle {
            return self.shuffle_prev();
        }
        match self.position_index() {
            Some(index) if index > 0 => {
                let id = self.entries[index - 1].id;
                self.set_position(Some(id), true);
                true
            }
            _ => false,
        }
    }

    // Reordering

    /// Moves the selected block around `index` by up to `distance` unselected
    /// rows. Returns the distance actually moved and the changed window.
    pub(crate) fn shift(&mut self, index: usize, distance: isize) -> (isize, Option<RowRange>) {
        let len = self.entries.len();
        if distance == 0 || self.entries.get(index).is_none_or(|entry| !entry.selected) {
            return (0, None);
        }

        let mut moved: isize = 0;
        let center = if distance < 0 {
            let mut center = index;
            while center > 0 && moved > distance {
                center -= 1;
                if !self.entries[center].selected {
                    moved -= 1;
                }
            }
            center
        } else {
            let mut center = index + 1;
            while center < len && moved < distance {
                if !self.entries[center].selected {
                    moved += 1;
                }
                center += 1;
            }
            center
        };

        let top = (0..center)
            .find(|row| self.entries[*row].selected)
            .unwrap_or(center);
        let bottom = (center..len)
            .rev()
            .find(|row| self.entries[*row].selected)
            .map_or(center, |row| row + 1);

        let split = center - top;
        let mut leading = Vec::new();
        let mut selected = Vec::new();
        let mut trailing = Vec::new();
        for (offset, entry) in self.entries.drain(top..bottom).enumerate() {
            if entry.selected {
                selected.push(entry);
            } else if offset < split {
                leading.push(entry);
            } else {
                trailing.push(entry);
            }
        }
        let block: Vec<Entry> = leading.into_iter().chain(selected).chain(trailing).collect();
        self.entries.splice(top..top, block);
        self.renumber(top);
        self.debug_check();

        (moved, Some((top, bottom - top)))
    }

    pub(crate) fn reverse(&mut self) {
        self.entries.reverse();
        self.renumber(0);
    }

    pub(crate) fn reverse_selected(&mut self) -> Option<RowRange> {
        let rows: Vec<usize> = self.selected_rows();
        let (&first, &last) = (rows.first()?, rows.last()?);
        let mut front = 0;
        let mut back = rows.len() - 1;
        while front < back {
            self.entries.swap(rows[front], rows[back]);
            front += 1;
            back -= 1;
        }
        self.renumber(first);
        Some((first, last + 1 - first))
    }

    pub(crate) fn randomize<R: Rng>(&mut self, rng: &mut R) {
        self.entries.shuffle(rng);
        self.renumber(0);
    }

    pub(crate) fn randomize_selected<R: Rng>(&mut self, rng: &mut R) -> Option<RowRange> {
        let rows = self.selected_rows();
        let (&first, &last) = (rows.first()?, rows.last()?);
        let mut order: Vec<usize> = rows.clone();
        order.shuffle(rng);
        self.permute_rows(&rows, &order);
        Some((first, last + 1 - first))
    }

    /// Stable sort of the whole playlist.
    pub(crate) fn sort(&mut self, sort_type: SortType) {
        self.entries.sort_by(|a, b| sort_type.compare(a, b));
        self.renumber(0);
        self.debug_check();
    }

    /// Stable sort of the selected rows among themselves; unselected rows
    /// keep their slots.
    pub(crate) fn sort_selected(&mut self, sort_type: SortType) -> Option<RowRange> {
        let rows = self.selected_rows();
        let (&first, &last) = (rows.first()?, rows.last()?);
        let mut order = rows.clone();
        order.sort_by(|a, b| sort_type.compare(&self.entries[*a], &self.entries[*b]));
        self.permute_rows(&rows, &order);
        Some((first, last + 1 - first))
    }

    fn selected_rows(&self) -> Vec<usize> {
        self.entries
            .iter()
            .filter(|entry| entry.selected)
            .map(|entry| entry.number)
            .collect()
    }

    /// Places the entry currently at `order[i]` into slot `slots[i]`.
    fn permute_rows(&mut self, slots: &[usize], order: &[usize]) {
        let mut taken: Vec<Option<Entry>> = self.entries.drain(..).map(Some).collect();
        let moved: Vec<Entry> = order
            .iter()
            .filter_map(|row| taken[*row].take())
            .collect();
        for (slot, entry) in slots.iter().zip(moved) {
            taken[*slot] = Some(entry);
        }
        self.entries = taken.into_iter().flatten().collect();
        self.renumber(0);
        self.debug_check();
    }

    /// Rows whose filename repeats an earlier row under `sort_type` equality.
    pub(crate) fn duplicate_rows(&self, sort_type: SortType) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by(|a, b| {
            sort_type
                .compare(&self.entries[*a], &self.entries[*b])
                .then(a.cmp(b))
        });
        let mut duplicates: Vec<usize> = order
            .windows(2)
            .filter(|pair| {
                sort_type.compare(&self.entries[pair[0]], &self.entries[pair[1]])
                    == Ordering::Equal
            })
            .map(|pair| pair[1])
            .collect();
        duplicates.sort_unstable();
        duplicates
    }

    // Update accumulation

    /// Widens the pending update window to cover `at..at + count`.
    pub(crate) fn accumulate_update(
        &mut self,
        level: UpdateLevel,
        at: usize,
        count: usize,
        queue_changed: bool,
    ) {
        let len = self.entries.len();
        let at = at.min(len);
        let after = len - at.saturating_add(count).min(len);
        let pending = &mut self.next_update;
        match pending.level {
            Some(current) => {
                pending.level = Some(current.max(level));
                pending.before = pending.before.min(at);
                pending.after = pending.after.min(after);
            }
            None => {
                pending.level = Some(level);
                pending.before = at;
                pending.after = after;
            }
        }
        if queue_changed {
            pending.queue_changed = true;
        }
    }

    /// Publishes the pending window as the last delivered update.
    pub(crate) fn take_update(&mut self) {
        self.last_update = std::mem::take(&mut self.next_update);
    }
}
