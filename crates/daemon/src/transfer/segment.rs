//! Byte-range planning for parallel transfers.

/// A byte range `[start, end)` moved by one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    /// Start offset (inclusive).
    pub start: u64,
    /// End offset (exclusive).
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `total_size` into at most `count` contiguous segments whose start offsets are
/// multiples of `align`. The last segment absorbs the remainder.
///
/// Returns an empty plan when `total_size` or `count` is 0. Files smaller than
/// `count * align` get fewer segments rather than empty ones.
pub fn plan_segments(total_size: u64, count: usize, align: u64) -> Vec<Segment> {
    if total_size == 0 || count == 0 {
        return Vec::new();
    }
    let align = align.max(1);
    let blocks = total_size.div_ceil(align);
    let count = (count as u64).min(blocks);
    let base = blocks / count;
    let remainder = blocks % count;

    let mut out = Vec::with_capacity(count as usize);
    let mut block = 0u64;
    for i in 0..count {
        let len_blocks = base + u64::from(i < remainder);
        let start = block * align;
        let end = ((block + len_blocks) * align).min(total_size);
        out.push(Segment {
            index: i as usize,
            start,
            end,
        });
        block += len_blocks;
    }
    out
}
