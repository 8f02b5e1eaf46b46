//! Probe service boundary and the default tag reader backed by `lofty`.
//!
//! The engine only needs one thing from decoders: given a filename, resolve
//! which decoder handles it and, when asked, read its metadata tuple. Probes
//! run on scan worker threads and must tolerate concurrent calls.

use std::fmt;
use std::sync::Arc;

use lofty::file::{AudioFile, TaggedFileExt};
use lofty::prelude::Accessor;
use lofty::read_from_path;
use lofty::tag::{ItemKey, Tag};
use log::debug;

use crate::tuple::{self, Tuple};

/// Opaque name of the decoder responsible for an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecoderHandle(Arc<str>);

impl DecoderHandle {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DecoderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scan request handed to a probe.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub id: u64,
    pub filename: Arc<str>,
    pub want_tuple: bool,
    /// Decoder already known for the entry, if any.
    pub decoder: Option<DecoderHandle>,
}

/// Result of one probe call. Either field may be missing.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub decoder: Option<DecoderHandle>,
    pub tuple: Option<Tuple>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

pub trait Probe: Send + Sync {
    fn probe(&self, request: &ProbeRequest) -> ProbeOutcome;
}

impl<F> Probe for F
where
    F: Fn(&ProbeRequest) -> ProbeOutcome + Send + Sync,
{
    fn probe(&self, request: &ProbeRequest) -> ProbeOutcome {
        self(request)
    }
}

/// Reads decoder type, tags and duration from local files.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyProbe;

fn tag_string(tag: Option<&Tag>, key: ItemKey) -> Option<String> {
    tag.and_then(|tag| tag.get_string(key))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn accessor_string(value: Option<std::borrow::Cow<'_, str>>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn derive_year_from_date(date: &str) -> Option<i32> {
    let mut consecutive_digits = String::with_capacity(4);
    for ch in date.chars() {
        if ch.is_ascii_digit() {
            consecutive_digits.push(ch);
            if consecutive_digits.len() == 4 {
                return consecutive_digits.parse().ok();
            }
        } else {
            consecutive_digits.clear();
        }
    }
    None
}

impl LoftyProbe {
    fn tuple_from_tag(tag: Option<&Tag>, length_ms: i64, codec: &str) -> Tuple {
        let date = tag_string(tag, ItemKey::RecordingDate);
        let year = tag_string(tag, ItemKey::Year)
            .and_then(|year| derive_year_from_date(&year))
            .or_else(|| date.as_deref().and_then(derive_year_from_date));

        Tuple {
            title: tag.and_then(|tag| accessor_string(tag.title())),
            artist: tag.and_then(|tag| accessor_string(tag.artist())),
            album: tag.and_then(|tag| accessor_string(tag.album())),
            album_artist: tag_string(tag, ItemKey::AlbumArtist),
            genre: tag.and_then(|tag| accessor_string(tag.genre())),
            comment: tag.and_then(|tag| accessor_string(tag.comment())),
            date,
            year,
            track: tag.and_then(|tag| tag.track()),
            disc: tag.and_then(|tag| tag.disk()),
            length_ms: Some(length_ms),
            codec: Some(codec.to_string()),
            ..Tuple::default()
        }
    }
}

impl Probe for LoftyProbe {
    fn probe(&self, request: &ProbeRequest) -> ProbeOutcome {
        let Some(path) = tuple::local_path(&request.filename) else {
            return ProbeOutcome::failed(format!(
                "Unsupported URI scheme: {}",
                request.filename
            ));
        };

        let tagged_file = match read_from_path(&path) {
            Ok(tagged_file) => tagged_file,
            Err(error) => {
                debug!("LoftyProbe: failed to read {}: {}", path.display(), error);
                return ProbeOutcome::failed(format!("Failed to read tags: {error}"));
            }
        };

        let codec = format!("{:?}", tagged_file.file_type()).to_ascii_lowercase();
        let decoder = request
            .decoder
            .clone()
            .unwrap_or_else(|| DecoderHandle::new(&codec));

        let tuple = request.want_tuple.then(|| {
            let length_ms = tagged_file.properties().duration().as_millis() as i64;
            let tag = tagged_file
                .primary_tag()
                .or_else(|| tagged_file.first_tag());
            Self::tuple_from_tag(tag, length_ms, &codec)
        });

        ProbeOutcome {
            decoder: Some(decoder),
            tuple,
            error: None,
        }
    }
}
