//! Byte-range coalescing for ranged blob downloads.

/// Half-open byte range `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub min: u64,
    pub max: u64,
}

impl ByteRange {
    pub fn new(min: u64, max: u64) -> Self {
        debug_assert!(min <= max);
        Self { min, max }
    }

    pub fn span(&self) -> u64 {
        self.max - self.min
    }

    /// Inclusive end as sent in a `Range` header.
    pub fn last_byte(&self) -> u64 {
        self.max.saturating_sub(1)
    }
}

/// Merge ranges sorted by `min` into the minimal set of disjoint ranges.
/// Overlapping and touching ranges merge.
pub fn coalesce(sorted: impl IntoIterator<Item = ByteRange>) -> Vec<ByteRange> {
    let mut merged: Vec<ByteRange> = Vec::new();
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.min <= last.max => last.max = last.max.max(range.max),
            _ => merged.push(range),
        }
    }
    merged
}

pub fn total_span(ranges: &[ByteRange]) -> u64 {
    ranges.iter().map(ByteRange::span).sum()
}
