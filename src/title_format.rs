//! Title template parser/evaluator used for entry display strings.
//!
//! Templates are plain text with `{key}` placeholders. A placeholder may list
//! fallbacks separated by `;` (`{title;file_name}`), and `[...]` marks an
//! optional group that is dropped when every placeholder inside it renders
//! empty. `\` escapes the next character.

use crate::tuple::{self, Tuple};

pub const DEFAULT_TITLE_FORMAT: &str = "[{artist} - ][{album} - ]{title}";

/// Values visible to a template for one entry.
#[derive(Clone, Debug)]
pub struct TitleContext<'a> {
    pub tuple: &'a Tuple,
    pub filename: &'a str,
    pub title: &'a str,
    pub artist: &'a str,
    pub album: &'a str,
}

impl<'a> TitleContext<'a> {
    fn value_for_key(&self, key: &str) -> Option<String> {
        let normalized = normalize_name(key);
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        match normalized.as_str() {
            "title" => Some(self.title.to_string()),
            "artist" => Some(self.artist.to_string()),
            "album" => Some(self.album.to_string()),
            "album_artist" | "albumartist" => Some(text(&self.tuple.album_artist)),
            "genre" => Some(text(&self.tuple.genre)),
            "comment" => Some(text(&self.tuple.comment)),
            "date" => Some(text(&self.tuple.date)),
            "year" => Some(
                self.tuple
                    .year
                    .map(|year| year.to_string())
                    .or_else(|| {
                        self.tuple
                            .date
                            .as_deref()
                            .filter(|date| date.len() >= 4)
                            .map(|date| date[0..4].to_string())
                    })
                    .unwrap_or_default(),
            ),
            "track" | "track_number" | "tracknumber" => Some(
                self.tuple
                    .track
                    .map(|track| format!("{track:02}"))
                    .unwrap_or_default(),
            ),
            "disc" | "disc_number" => Some(
                self.tuple
                    .disc
                    .map(|disc| disc.to_string())
                    .unwrap_or_default(),
            ),
            "length" | "duration" => Some(
                self.tuple
                    .length_ms
                    .filter(|length| *length > 0)
                    .map(format_length)
                    .unwrap_or_default(),
            ),
            "file_name" | "filename" | "file" => Some(tuple::basename(self.filename).to_string()),
            "path" => Some(self.filename.to_string()),
            _ => None,
        }
    }
}

/// `m:ss`, or `h:mm:ss` from one hour up.
pub fn format_length(length_ms: i64) -> String {
    let total_secs = length_ms.max(0) / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[derive(Clone, Debug, PartialEq)]
enum TemplateSegment {
    Text(String),
    Placeholder { raw: String, fallbacks: Vec<String> },
    Optional(Vec<TemplateSegment>),
}

/// A compiled title template.
#[derive(Clone, Debug, PartialEq)]
pub struct TitleFormatter {
    source: String,
    segments: Vec<TemplateSegment>,
}

impl Default for TitleFormatter {
    fn default() -> Self {
        Self::compile(DEFAULT_TITLE_FORMAT)
    }
}

impl TitleFormatter {
    pub fn compile(source: &str) -> Self {
        let mut chars = source.chars().peekable();
        let segments = parse_segments(&mut chars, None).0;
        Self {
            source: source.to_string(),
            segments,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, context: &TitleContext<'_>) -> String {
        let mut output = String::new();
        render_segments(&self.segments, context, &mut output);
        output.trim().to_string()
    }
}

type CharStream<'a> = std::iter::Peekable<std::str::Chars<'a>>;

/// Parses until `terminal` (consumed) or end of input. The flag reports
/// whether the terminal was found.
fn parse_segments(chars: &mut CharStream<'_>, terminal: Option<char>) -> (Vec<TemplateSegment>, bool) {
    let mut segments = Vec::new();
    let mut text_buffer = String::new();

    while let Some(ch) = chars.next() {
        if Some(ch) == terminal {
            flush_text(&mut segments, &mut text_buffer);
            return (segments, true);
        }
        match ch {
            '\\' => match chars.next() {
                Some(next) => text_buffer.push(next),
                None => text_buffer.push('\\'),
            },
            '{' => {
                flush_text(&mut segments, &mut text_buffer);
                match read_until(chars, '}') {
                    Some(content) => segments.push(placeholder_or_literal(content)),
                    None => text_buffer.push('{'),
                }
            }
            '[' => {
                flush_text(&mut segments, &mut text_buffer);
                let (inner, closed) = parse_segments(chars, Some(']'));
                if closed {
                    segments.push(TemplateSegment::Optional(inner));
                } else {
                    segments.push(TemplateSegment::Text("[".to_string()));
                    segments.extend(inner);
                }
            }
            _ => text_buffer.push(ch),
        }
    }
    flush_text(&mut segments, &mut text_buffer);
    (segments, false)
}

fn placeholder_or_literal(content: String) -> TemplateSegment {
    let mut fallbacks = Vec::new();
    for part in content.split(';') {
        let key = part.trim();
        if key.is_empty() {
            return TemplateSegment::Text(format!("{{{content}}}"));
        }
        fallbacks.push(key.to_string());
    }
    TemplateSegment::Placeholder {
        raw: content,
        fallbacks,
    }
}

/// Returns true when at least one placeholder rendered non-empty.
fn render_segments(
    segments: &[TemplateSegment],
    context: &TitleContext<'_>,
    output: &mut String,
) -> bool {
    let mut any_value = false;
    for segment in segments {
        match segment {
            TemplateSegment::Text(text) => output.push_str(text),
            TemplateSegment::Placeholder { raw, fallbacks } => {
                match resolve_placeholder(context, fallbacks) {
                    Some(value) => {
                        if !value.is_empty() {
                            any_value = true;
                        }
                        output.push_str(&value);
                    }
                    None => {
                        output.push('{');
                        output.push_str(raw);
                        output.push('}');
                    }
                }
            }
            TemplateSegment::Optional(inner) => {
                let mut group = String::new();
                if render_segments(inner, context, &mut group) {
                    any_value = true;
                    output.push_str(&group);
                }
            }
        }
    }
    any_value
}

fn resolve_placeholder(context: &TitleContext<'_>, fallbacks: &[String]) -> Option<String> {
    let mut recognized_any = false;
    for key in fallbacks {
        if let Some(value) = context.value_for_key(key) {
            recognized_any = true;
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    if recognized_any {
        Some(String::new())
    } else {
        None
    }
}

fn normalize_name(value: &str) -> String {
    let mut normalized = String::new();
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            normalized.push(ch.to_ascii_lowercase());
        } else if ch == '_' || ch == '-' || ch.is_whitespace() {
            normalized.push('_');
        }
    }
    normalized
}

fn flush_text(segments: &mut Vec<TemplateSegment>, text_buffer: &mut String) {
    if text_buffer.is_empty() {
        return;
    }
    segments.push(TemplateSegment::Text(std::mem::take(text_buffer)));
}

fn read_until(chars: &mut CharStream<'_>, terminal: char) -> Option<String> {
    let mut collected = String::new();
    for ch in chars.by_ref() {
        if ch == terminal {
            return Some(collected);
        }
        collected.push(ch);
    }
    None
}
