/// Contains type aliases and small shared structs used across modules to
/// prevent redeclaration and help with readability
use std::cmp::Ordering;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// Monotonic 64-bit ordering token issued by the external sequencer
pub type Version = u64;

/// Version value meaning "no version"
pub const INVALID_VERSION: Version = 0;

pub type FeedId = Vec<u8>;

/// Engine-internal write ordering token; unrelated to `Version`
pub type SequenceNumber = u64;

/// A contiguous, begin-inclusive / end-exclusive span of the keyspace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new<B: AsRef<[u8]>, E: AsRef<[u8]>>(begin: B, end: E) -> Self {
        Self {
            begin: begin.as_ref().to_vec(),
            end: end.as_ref().to_vec(),
        }
    }

    /// The whole keyspace covered by the shard map
    pub fn all() -> Self {
        KeyRange::new(b"", crate::consts::ALL_KEYS_END)
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.begin.as_slice() <= key && key < self.end.as_slice()
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Intersection of two ranges, empty when they do not overlap
    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        let begin = if self.begin >= other.begin {
            self.begin.clone()
        } else {
            other.begin.clone()
        };
        let end = if self.end <= other.end {
            self.end.clone()
        } else {
            other.end.clone()
        };
        KeyRange { begin, end }
    }

    pub fn cmp_key(&self, key: &[u8]) -> Ordering {
        if key < self.begin.as_slice() {
            Ordering::Greater
        } else if key >= self.end.as_slice() {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            crate::util::printable(&self.begin),
            crate::util::printable(&self.end)
        )
    }
}

/// Smallest key strictly greater than `key`
pub fn key_after(key: &[u8]) -> Key {
    let mut k = key.to_vec();
    k.push(0);
    k
}

/// `[prefix, first key not starting with prefix)`; the whole keyspace tail
/// when the prefix is all `0xff`
pub fn prefix_range(prefix: &[u8]) -> KeyRange {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last() {
        if *last < 0xff {
            *end.last_mut().unwrap() += 1;
            return KeyRange::new(prefix, end);
        }
        end.pop();
    }
    KeyRange::new(prefix, crate::consts::ALL_KEYS_MAX)
}
