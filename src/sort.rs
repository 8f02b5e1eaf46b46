//! Entry orderings for playlist sorting and duplicate detection.

use std::cmp::Ordering;

use crate::entry::Entry;
use crate::tuple::{self, Tuple, TupleField};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortType {
    /// Full path; a subfolder sorts after the files of its parent folder.
    Path,
    Filename,
    Title,
    Album,
    Artist,
    AlbumArtist,
    Date,
    Genre,
    Track,
    FormattedTitle,
    Length,
    Comment,
    Disc,
}

impl SortType {
    /// Filename-based orderings work on unscanned entries too.
    pub fn is_filename_based(self) -> bool {
        matches!(self, Self::Path | Self::Filename)
    }

    pub fn compare(self, a: &Entry, b: &Entry) -> Ordering {
        match self {
            Self::Path => compare_path(&a.filename, &b.filename),
            Self::Filename => {
                compare_natural(tuple::basename(&a.filename), tuple::basename(&b.filename))
            }
            Self::FormattedTitle => {
                compare_natural(&a.derived.formatted_title, &b.derived.formatted_title)
            }
            Self::Title => compare_tuple_str(a, b, TupleField::Title),
            Self::Album => compare_tuple_str(a, b, TupleField::Album),
            Self::Artist => compare_tuple_str(a, b, TupleField::Artist),
            Self::AlbumArtist => compare_tuple_str(a, b, TupleField::AlbumArtist),
            Self::Date => compare_tuple_int(a, b, TupleField::Year)
                .then_with(|| compare_tuple_str(a, b, TupleField::Date)),
            Self::Genre => compare_tuple_str(a, b, TupleField::Genre),
            Self::Track => compare_tuple_int(a, b, TupleField::Disc)
                .then_with(|| compare_tuple_int(a, b, TupleField::Track)),
            Self::Length => compare_tuple_int(a, b, TupleField::Length),
            Self::Comment => compare_tuple_str(a, b, TupleField::Comment),
            Self::Disc => compare_tuple_int(a, b, TupleField::Disc),
        }
    }
}

fn tuple_of(entry: &Entry) -> Option<&Tuple> {
    entry.tuple.as_deref()
}

fn compare_tuple_str(a: &Entry, b: &Entry, field: TupleField) -> Ordering {
    let left = tuple_of(a).and_then(|tuple| tuple.get_str(field));
    let right = tuple_of(b).and_then(|tuple| tuple.get_str(field));
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => compare_natural(left, right),
    }
}

fn compare_tuple_int(a: &Entry, b: &Entry, field: TupleField) -> Ordering {
    let left = tuple_of(a).and_then(|tuple| tuple.get_int(field));
    let right = tuple_of(b).and_then(|tuple| tuple.get_int(field));
    left.cmp(&right)
}

fn directory_len(filename: &str) -> usize {
    filename.rfind('/').map(|slash| slash + 1).unwrap_or(0)
}

fn compare_path(a: &str, b: &str) -> Ordering {
    let dir_a = directory_len(a);
    let dir_b = directory_len(b);
    let shared = dir_a.min(dir_b);
    if dir_a != dir_b && a.as_bytes()[..shared] == b.as_bytes()[..shared] {
        return dir_a.cmp(&dir_b);
    }
    compare_natural(a, b)
}

/// Case-insensitive comparison that orders embedded digit runs numerically.
pub fn compare_natural(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let left_digits = take_digits(&mut left);
                let right_digits = take_digits(&mut right);
                let left_trimmed = left_digits.trim_start_matches('0');
                let right_trimmed = right_digits.trim_start_matches('0');
                let ordering = left_trimmed
                    .len()
                    .cmp(&right_trimmed.len())
                    .then_with(|| left_trimmed.cmp(right_trimmed));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                let ordering = l
                    .to_lowercase()
                    .cmp(r.to_lowercase());
                if ordering != Ordering::Equal {
                    return ordering;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(ch) = chars.peek().copied() {
        if !ch.is_ascii_digit() {
            break;
        }
        digits.push(ch);
        chars.next();
    }
    digits
}
