//! Entry store: per-track state owned by a playlist.

use std::sync::Arc;

use crate::probe::DecoderHandle;
use crate::title_format::{TitleContext, TitleFormatter};
use crate::tuple::{self, Tuple};

/// Stable identity of an entry for the lifetime of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

/// One item handed to a batch insert.
#[derive(Debug, Clone)]
pub struct PlaylistAddItem {
    pub filename: String,
    pub tuple: Option<Tuple>,
    pub decoder: Option<DecoderHandle>,
}

impl PlaylistAddItem {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            tuple: None,
            decoder: None,
        }
    }

    pub fn with_tuple(mut self, tuple: Tuple) -> Self {
        self.tuple = Some(tuple);
        self
    }

    pub fn with_decoder(mut self, decoder: DecoderHandle) -> Self {
        self.decoder = Some(decoder);
        self
    }
}

/// Display strings memoized from an entry's tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedInfo {
    pub formatted_title: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub length_ms: i64,
}

/// Formatting policy applied to every entry.
#[derive(Debug, Clone, Default)]
pub struct TitleStyle {
    pub formatter: TitleFormatter,
    pub metadata_fallbacks: bool,
}

impl TitleStyle {
    pub fn new(format: &str, metadata_fallbacks: bool) -> Self {
        Self {
            formatter: TitleFormatter::compile(format),
            metadata_fallbacks,
        }
    }

    pub fn derive(&self, filename: &str, tuple: Option<&Tuple>) -> DerivedInfo {
        let Some(tuple) = tuple else {
            let title = tuple::display_basename(filename);
            return DerivedInfo {
                formatted_title: title.clone(),
                title,
                ..DerivedInfo::default()
            };
        };

        let title = tuple
            .title
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| tuple::display_basename(filename));
        let mut artist = tuple.artist.clone().unwrap_or_default();
        let mut album = tuple.album.clone().unwrap_or_default();
        if self.metadata_fallbacks {
            if artist.trim().is_empty() {
                artist = tuple::fallback_artist(filename).unwrap_or_default();
            }
            if album.trim().is_empty() {
                album = tuple::fallback_album(filename).unwrap_or_default();
            }
        }

        let formatted_title = self.formatter.render(&TitleContext {
            tuple,
            filename,
            title: &title,
            artist: &artist,
            album: &album,
        });

        DerivedInfo {
            formatted_title: if formatted_title.is_empty() {
                title.clone()
            } else {
                formatted_title
            },
            title,
            artist,
            album,
            length_ms: tuple.length(),
        }
    }
}

/// One playable item inside a playlist.
#[derive(Debug, Clone)]
pub struct Entry {
    pub(crate) id: EntryId,
    pub(crate) number: usize,
    pub(crate) filename: Arc<str>,
    pub(crate) decoder: Option<DecoderHandle>,
    pub(crate) tuple: Option<Arc<Tuple>>,
    pub(crate) derived: DerivedInfo,
    pub(crate) failed: bool,
    pub(crate) error: Option<String>,
    pub(crate) selected: bool,
    pub(crate) queued: bool,
    pub(crate) shuffle_rank: u64,
}

impl Entry {
    pub(crate) fn new(id: EntryId, item: PlaylistAddItem, style: &TitleStyle) -> Self {
        let filename: Arc<str> = Arc::from(item.filename);
        let tuple = item.tuple.map(Arc::new);
        let derived = style.derive(&filename, tuple.as_deref());
        Self {
            id,
            number: 0,
            filename,
            decoder: item.decoder,
            tuple,
            derived,
            failed: false,
            error: None,
            selected: false,
            queued: false,
            shuffle_rank: 0,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn filename(&self) -> &Arc<str> {
        &self.filename
    }

    pub fn tuple(&self) -> Option<&Arc<Tuple>> {
        self.tuple.as_ref()
    }

    pub fn derived(&self) -> &DerivedInfo {
        &self.derived
    }

    pub fn length_ms(&self) -> i64 {
        self.derived.length_ms
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn is_stdin(&self) -> bool {
        self.filename.starts_with("stdin://")
    }

    fn is_segment(&self) -> bool {
        self.tuple.as_ref().is_some_and(|tuple| tuple.is_segment())
    }

    /// Replaces the tuple and refreshes derived strings. Segment entries keep
    /// their tuple; returns false in that case.
    pub(crate) fn set_tuple(&mut self, tuple: Option<Arc<Tuple>>, style: &TitleStyle) -> bool {
        if self.is_segment() {
            return false;
        }
        self.error = None;
        self.failed = false;
        self.tuple = tuple;
        self.format(style);
        true
    }

    pub(crate) fn format(&mut self, style: &TitleStyle) {
        self.derived = style.derive(&self.filename, self.tuple.as_deref());
    }
}
