// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Causal tags and the local clock that stamps them.
//!
//! A [`Tag`] records one origin's contribution to a row. A row's shadow
//! entry keeps a [`TagSet`] holding at most one tag per origin: the newest
//! timestamp that origin has contributed.
//!
//! # Encoding
//!
//! Tag sets are stored and transmitted as a single string:
//!
//! ```text
//! origin@millis,origin@millis,...
//! ```
//!
//! Tags are sorted by `(origin, timestamp)` so equal sets always encode to
//! equal strings. `\` and `,` inside an origin are backslash-escaped. The
//! empty set encodes to the empty string.
//!
//! # Example
//!
//! ```
//! use satellite::clock::{generate_tag, encode_tags, decode_tags, TagSet};
//!
//! let tags: TagSet = [generate_tag("c1", 1000), generate_tag("server", 2000)]
//!     .into_iter()
//!     .collect();
//!
//! let encoded = encode_tags(&tags);
//! assert_eq!(encoded, "c1@1000,server@2000");
//! assert_eq!(decode_tags(&encoded).unwrap(), tags);
//! assert_eq!(encode_tags(&TagSet::new()), "");
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;

const TAG_DELIMITER: char = ',';
const ORIGIN_SEPARATOR: char = '@';
const ESCAPE: char = '\\';

/// Failure to parse an encoded tag set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("tag '{0}' has no origin separator")]
    MissingSeparator(String),
    #[error("tag '{tag}' has an invalid timestamp")]
    InvalidTimestamp { tag: String },
    #[error("encoded tag set ends with a dangling escape")]
    DanglingEscape,
    #[error("origin '{0}' appears more than once")]
    DuplicateOrigin(String),
}

/// Latest timestamp a tag may carry: the last millisecond of year 9999.
pub const MAX_TIMESTAMP: i64 = 253_402_300_799_999;

/// The local clock cannot stamp past [`MAX_TIMESTAMP`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("clock cannot advance past {last}")]
pub struct ClockOverflow {
    pub last: i64,
}

/// One origin's causal stamp on a row.
///
/// Field order matters: the derived `Ord` sorts by `(origin, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub origin: String,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl Tag {
    /// Ordering used to pick a winner between concurrent writes:
    /// newest timestamp first, origin as the tie breaker.
    pub(crate) fn stamp(&self) -> (i64, &str) {
        (self.timestamp, self.origin.as_str())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.origin, ORIGIN_SEPARATOR, self.timestamp)
    }
}

/// Build a tag for `origin` at `timestamp` (epoch millis).
pub fn generate_tag(origin: impl Into<String>, timestamp: i64) -> Tag {
    Tag {
        origin: origin.into(),
        timestamp,
    }
}

/// An ordered set of tags, sorted by `(origin, timestamp)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    #[must_use]
    pub fn contains(&self, tag: &Tag) -> bool {
        self.0.contains(tag)
    }

    /// True when every tag in `self` is already present in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &TagSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// The tag with the greatest `(timestamp, origin)` stamp.
    #[must_use]
    pub fn newest(&self) -> Option<&Tag> {
        self.0.iter().max_by(|a, b| a.stamp().cmp(&b.stamp()))
    }

    /// Largest timestamp in the set, if any.
    #[must_use]
    pub fn max_timestamp(&self) -> Option<i64> {
        self.0.iter().map(|t| t.timestamp).max()
    }

    fn remove_origin(&mut self, origin: &str) -> Option<Tag> {
        let existing = self.0.iter().find(|t| t.origin == origin).cloned()?;
        self.0.remove(&existing);
        Some(existing)
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TagSet {
    type Item = Tag;
    type IntoIter = std::collections::btree_set::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::collections::btree_set::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Merge a single tag into a set.
///
/// Any tag already contributed by `incoming.origin` is replaced, so the set
/// keeps one tag per origin. An older tag from the same origin never evicts a
/// newer one, which keeps the operation commutative and idempotent.
#[must_use]
pub fn merge_tag_set(local: &TagSet, incoming: &Tag) -> TagSet {
    let mut merged = local.clone();
    match merged.remove_origin(&incoming.origin) {
        Some(existing) if existing.timestamp > incoming.timestamp => {
            merged.0.insert(existing);
        }
        _ => {
            merged.0.insert(incoming.clone());
        }
    }
    merged
}

/// Fold every tag of `incoming` into `local` with [`merge_tag_set`].
#[must_use]
pub fn merge_tag_sets(local: &TagSet, incoming: &TagSet) -> TagSet {
    incoming
        .iter()
        .fold(local.clone(), |acc, tag| merge_tag_set(&acc, tag))
}

/// Encode a tag set into its canonical string form.
#[must_use]
pub fn encode_tags(tags: &TagSet) -> String {
    let mut out = String::new();
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            out.push(TAG_DELIMITER);
        }
        for c in tag.origin.chars() {
            if c == ESCAPE || c == TAG_DELIMITER {
                out.push(ESCAPE);
            }
            out.push(c);
        }
        out.push(ORIGIN_SEPARATOR);
        out.push_str(&tag.timestamp.to_string());
    }
    out
}

/// Decode a string produced by [`encode_tags`].
///
/// A set holds at most one tag per origin, so repeated origins are rejected.
pub fn decode_tags(encoded: &str) -> Result<TagSet, TagError> {
    let mut tags = TagSet::new();
    if encoded.is_empty() {
        return Ok(tags);
    }

    let mut current = String::new();
    let mut chars = encoded.chars();
    loop {
        match chars.next() {
            Some(ESCAPE) => match chars.next() {
                Some(c) => {
                    current.push(ESCAPE);
                    current.push(c);
                }
                None => return Err(TagError::DanglingEscape),
            },
            Some(TAG_DELIMITER) => {
                insert_unique(&mut tags, parse_tag(&current)?)?;
                current.clear();
            }
            Some(c) => current.push(c),
            None => {
                insert_unique(&mut tags, parse_tag(&current)?)?;
                return Ok(tags);
            }
        }
    }
}

fn insert_unique(tags: &mut TagSet, tag: Tag) -> Result<(), TagError> {
    if tags.iter().any(|t| t.origin == tag.origin) {
        return Err(TagError::DuplicateOrigin(tag.origin));
    }
    tags.0.insert(tag);
    Ok(())
}

/// Parse one raw (still escaped) `origin@millis` token.
fn parse_tag(raw: &str) -> Result<Tag, TagError> {
    // The timestamp never contains the separator, so the last one splits.
    let (origin, timestamp) = raw
        .rsplit_once(ORIGIN_SEPARATOR)
        .ok_or_else(|| TagError::MissingSeparator(raw.to_string()))?;
    let timestamp = timestamp
        .parse::<i64>()
        .map_err(|_| TagError::InvalidTimestamp { tag: raw.to_string() })?;

    let mut unescaped = String::with_capacity(origin.len());
    let mut chars = origin.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            match chars.next() {
                Some(next) => unescaped.push(next),
                None => return Err(TagError::DanglingEscape),
            }
        } else {
            unescaped.push(c);
        }
    }

    Ok(Tag {
        origin: unescaped,
        timestamp,
    })
}

/// Wall-clock epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Monotonic millisecond clock for local tags.
///
/// Every [`tick`](Clock::tick) is strictly greater than the previous one and
/// than any remote timestamp passed to [`receive`](Clock::receive), even when
/// the wall clock stalls or jumps backwards.
pub struct Clock {
    last_ms: Mutex<i64>,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_ms: Mutex::new(0),
        }
    }

    /// Next local timestamp.
    pub fn tick(&self) -> Result<i64, ClockOverflow> {
        let now = now_millis();
        let mut last = self.last_ms.lock();
        let next = if now > *last {
            now
        } else {
            last.checked_add(1).ok_or(ClockOverflow { last: *last })?
        };
        if next > MAX_TIMESTAMP {
            return Err(ClockOverflow { last: *last });
        }
        *last = next;
        Ok(next)
    }

    /// Advance past a timestamp observed on a remote change.
    ///
    /// Stamps beyond [`MAX_TIMESTAMP`] are ignored.
    pub fn receive(&self, remote_ms: i64) {
        let mut last = self.last_ms.lock();
        if remote_ms > *last && remote_ms <= MAX_TIMESTAMP {
            *last = remote_ms;
        }
    }

    /// Last timestamp handed out or observed.
    pub fn last(&self) -> i64 {
        *self.last_ms.lock()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tags: &[(&str, i64)]) -> TagSet {
        tags.iter().map(|(o, t)| generate_tag(*o, *t)).collect()
    }

    #[test]
    fn test_encode_sorts_by_origin_then_timestamp() {
        let tags = set(&[("server", 2000), ("c1", 1000), ("a", 5)]);
        assert_eq!(encode_tags(&tags), "a@5,c1@1000,server@2000");
    }

    #[test]
    fn test_empty_set_round_trip() {
        assert_eq!(encode_tags(&TagSet::new()), "");
        assert!(decode_tags("").unwrap().is_empty());
    }

    #[test]
    fn test_origin_escaping_round_trip() {
        let tags = set(&[("we,ird\\ori@gin", 42), ("plain", -7)]);
        let encoded = encode_tags(&tags);
        assert_eq!(decode_tags(&encoded).unwrap(), tags);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            decode_tags("nope"),
            Err(TagError::MissingSeparator("nope".into()))
        );
        assert!(matches!(
            decode_tags("c1@abc"),
            Err(TagError::InvalidTimestamp { .. })
        ));
        assert_eq!(decode_tags("c1@1,"), Err(TagError::MissingSeparator(String::new())));
        assert_eq!(decode_tags("c1\\"), Err(TagError::DanglingEscape));
    }

    #[test]
    fn test_decode_rejects_repeated_origin() {
        assert_eq!(
            decode_tags("c1@1,c1@2"),
            Err(TagError::DuplicateOrigin("c1".into()))
        );
        assert_eq!(decode_tags("c1@1,c2@2").unwrap().len(), 2);
    }

    #[test]
    fn test_merge_replaces_same_origin() {
        let local = set(&[("c1", 1000), ("server", 2000)]);
        let merged = merge_tag_set(&local, &generate_tag("c1", 3000));
        assert_eq!(merged, set(&[("c1", 3000), ("server", 2000)]));
    }

    #[test]
    fn test_merge_keeps_newer_tag_from_same_origin() {
        let local = set(&[("c1", 3000)]);
        let merged = merge_tag_set(&local, &generate_tag("c1", 1000));
        assert_eq!(merged, local);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let tag = generate_tag("c1", 1000);
        let once = merge_tag_set(&TagSet::new(), &tag);
        let twice = merge_tag_set(&once, &tag);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_commutes_across_origins() {
        let a = generate_tag("a", 10);
        let b = generate_tag("b", 5);
        let base = set(&[("c", 1)]);
        let ab = merge_tag_set(&merge_tag_set(&base, &a), &b);
        let ba = merge_tag_set(&merge_tag_set(&base, &b), &a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_merge_tag_sets_superset() {
        let local = set(&[("c1", 1000)]);
        let incoming = set(&[("c1", 1000), ("server", 2000)]);
        assert_eq!(merge_tag_sets(&local, &incoming), incoming);
    }

    #[test]
    fn test_newest_uses_origin_as_tie_breaker() {
        let tags = set(&[("a", 10), ("b", 10), ("c", 3)]);
        assert_eq!(tags.newest(), Some(&generate_tag("b", 10)));
        assert_eq!(tags.max_timestamp(), Some(10));
    }

    #[test]
    fn test_clock_is_strictly_monotonic() {
        let clock = Clock::new();
        let mut prev = clock.tick().unwrap();
        for _ in 0..1000 {
            let next = clock.tick().unwrap();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_clock_moves_past_remote_timestamps() {
        let clock = Clock::new();
        let far_future = MAX_TIMESTAMP - 100;
        clock.receive(far_future);
        assert!(clock.tick().unwrap() > far_future);

        // Older remote stamps never move it back.
        clock.receive(5);
        assert!(clock.last() > far_future);
    }

    #[test]
    fn test_clock_refuses_to_overflow() {
        let clock = Clock::new();
        clock.receive(i64::MAX);
        assert!(clock.last() < MAX_TIMESTAMP, "out of range stamps are ignored");

        clock.receive(MAX_TIMESTAMP);
        assert_eq!(clock.tick(), Err(ClockOverflow { last: MAX_TIMESTAMP }));
        assert_eq!(clock.last(), MAX_TIMESTAMP);
    }
}
