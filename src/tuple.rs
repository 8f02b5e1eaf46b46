//! Track metadata record and filename-derived fallbacks.

use std::borrow::Cow;

/// Scanned metadata for one entry.
///
/// Tuples are immutable once installed on an entry and are shared as
/// `Arc<Tuple>` between the engine and its callers.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Tuple {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_ms: Option<i64>,
    /// Offset into `audio_file` when this entry is one segment of a larger
    /// stream (cue-sheet sub-track).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

/// Fields addressable by sorting and pattern selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleField {
    Title,
    Artist,
    Album,
    AlbumArtist,
    Genre,
    Comment,
    Date,
    Year,
    Track,
    Disc,
    Length,
}

impl Tuple {
    /// Minimal tuple carrying only a title derived from the filename.
    pub fn from_filename(filename: &str) -> Self {
        Self {
            title: Some(display_basename(filename)),
            ..Self::default()
        }
    }

    /// Length contribution to playlist totals; never negative.
    pub fn length(&self) -> i64 {
        self.length_ms.unwrap_or(0).max(0)
    }

    pub fn is_segment(&self) -> bool {
        self.start_time_ms.is_some()
    }

    pub fn get_str(&self, field: TupleField) -> Option<&str> {
        let value = match field {
            TupleField::Title => self.title.as_deref(),
            TupleField::Artist => self.artist.as_deref(),
            TupleField::Album => self.album.as_deref(),
            TupleField::AlbumArtist => self.album_artist.as_deref(),
            TupleField::Genre => self.genre.as_deref(),
            TupleField::Comment => self.comment.as_deref(),
            TupleField::Date => self.date.as_deref(),
            TupleField::Year | TupleField::Track | TupleField::Disc | TupleField::Length => None,
        };
        value.filter(|text| !text.trim().is_empty())
    }

    pub fn get_int(&self, field: TupleField) -> Option<i64> {
        match field {
            TupleField::Year => self.year.map(i64::from),
            TupleField::Track => self.track.map(i64::from),
            TupleField::Disc => self.disc.map(i64::from),
            TupleField::Length => self.length_ms,
            _ => None,
        }
    }
}

/// Last path component of a filename or URI, still encoded.
pub fn basename(filename: &str) -> &str {
    let trimmed = filename.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(slash) => &trimmed[slash + 1..],
        None => trimmed,
    }
}

fn decode(text: &str) -> Cow<'_, str> {
    if !text.contains('%') {
        return Cow::Borrowed(text);
    }
    urlencoding::decode(text).unwrap_or(Cow::Borrowed(text))
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

/// Human-readable base name: decoded and without extension.
pub fn display_basename(filename: &str) -> String {
    let name = basename(filename);
    let decoded = decode(name);
    strip_extension(&decoded).to_string()
}

fn parent_components(filename: &str) -> Vec<&str> {
    let without_scheme = match filename.find("://") {
        Some(index) => &filename[index + 3..],
        None => filename,
    };
    let mut parts: Vec<&str> = without_scheme
        .split('/')
        .filter(|part| !part.is_empty())
        .collect();
    parts.pop();
    parts
}

/// Parent directory name, used as an album fallback.
pub fn fallback_album(filename: &str) -> Option<String> {
    parent_components(filename)
        .last()
        .map(|part| decode(part).into_owned())
}

/// Grandparent directory name, used as an artist fallback.
pub fn fallback_artist(filename: &str) -> Option<String> {
    let parts = parent_components(filename);
    if parts.len() < 2 {
        return None;
    }
    parts
        .get(parts.len() - 2)
        .map(|part| decode(part).into_owned())
}

/// Local filesystem path for a plain path or `file://` URI.
pub fn local_path(filename: &str) -> Option<std::path::PathBuf> {
    if let Some(rest) = filename.strip_prefix("file://") {
        return Some(std::path::PathBuf::from(decode(rest).into_owned()));
    }
    if filename.contains("://") {
        return None;
    }
    Some(std::path::PathBuf::from(filename))
}
