//! Message identifiers: `<source-id><sep><seq>`, totally ordered per source.

use std::fmt;

/// Default separator byte used between a source id and its sequence number.
///
/// Must not appear inside a source id; see [`MessageId::parse`].
pub const DEFAULT_SEPARATOR: char = '-';

/// Identifies a single message within the system.
///
/// `source_id` is the declared primary key of the input report that produced the
/// message (e.g. a vehicle number); `seq` is the per-source counter assigned by the
/// splitter. Totally ordered per source; no cross-source ordering is implied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub source_id: String,
    pub seq: u64,
}

impl MessageId {
    pub fn new(source_id: impl Into<String>, seq: u64) -> Self {
        Self {
            source_id: source_id.into(),
            seq,
        }
    }

    /// Renders `<source-id><sep><seq>`.
    pub fn to_string_with_sep(&self, sep: char) -> String {
        format!("{}{}{}", self.source_id, sep, self.seq)
    }

    /// Parses `<source-id><sep><seq>`, splitting on the last occurrence of `sep` so a
    /// source id containing no `sep` bytes round-trips even if `seq` itself were to
    /// contain digits that look like part of the id (it never does, but splitting from
    /// the right keeps the source id intact if a future source id format embeds `sep`
    /// is never reused — `sep` is defined as forbidden in source ids).
    pub fn parse(raw: &str, sep: char) -> Option<Self> {
        let idx = raw.rfind(sep)?;
        let (source_id, rest) = raw.split_at(idx);
        let seq_str = &rest[sep.len_utf8()..];
        let seq: u64 = seq_str.parse().ok()?;
        if source_id.is_empty() {
            return None;
        }
        Some(Self {
            source_id: source_id.to_string(),
            seq,
        })
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.source_id, DEFAULT_SEPARATOR, self.seq)
    }
}
