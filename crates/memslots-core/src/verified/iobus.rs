//! Pure range arithmetic for the I/O bus dispatcher.
//!
//! Bus ranges may be layered: two devices can claim overlapping windows,
//! and an access is offered to every window that fully contains it, in
//! ascending `(addr, len)` order, until one device takes it.

use std::cmp::Ordering;

/// An access or registered window on a bus: `[addr, addr + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoSpan {
    pub addr: u64,
    pub len: u64,
}

impl IoSpan {
    pub const fn new(addr: u64, len: u64) -> Self {
        Self { addr, len }
    }

    /// One past the last byte, saturating at the top of the space.
    pub const fn end(&self) -> u64 {
        self.addr.saturating_add(self.len)
    }
}

/// Order `key` against a registered `range`.
///
/// `Less` if the access starts before the range, `Greater` if it ends
/// after it, `Equal` if the range fully contains it.  Overlapping
/// ranges that both contain the key therefore compare equal to it.
pub fn range_cmp(key: &IoSpan, range: &IoSpan) -> Ordering {
    if key.addr < range.addr {
        Ordering::Less
    } else if key.end() > range.end() {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Total order used to keep a bus table sorted.
///
/// `range_cmp` is not a total order over ranges, so sorting goes by
/// start address and then length instead.
pub fn sort_cmp(a: &IoSpan, b: &IoSpan) -> Ordering {
    a.addr.cmp(&b.addr).then(a.len.cmp(&b.len))
}

/// Index of the first range in sorted `ranges` that contains `key`.
///
/// Binary-searches for any containing range, then walks back over
/// neighbours that also contain it.
pub fn first_match<T>(ranges: &[T], key: &IoSpan, span: impl Fn(&T) -> IoSpan) -> Option<usize> {
    debug_assert!(
        ranges.windows(2).all(|w| sort_cmp(&span(&w[0]), &span(&w[1])) != Ordering::Greater),
        "bus table not sorted"
    );

    let mut idx = ranges
        .binary_search_by(|r| range_cmp(key, &span(r)).reverse())
        .ok()?;
    while idx > 0 && range_cmp(key, &span(&ranges[idx - 1])) == Ordering::Equal {
        idx -= 1;
    }

    debug_assert_eq!(range_cmp(key, &span(&ranges[idx])), Ordering::Equal);
    Some(idx)
}

/// Indices of every range containing `key`, in dispatch order.
pub fn matches<'a, T>(
    ranges: &'a [T],
    key: &'a IoSpan,
    span: impl Fn(&T) -> IoSpan + Copy + 'a,
) -> impl Iterator<Item = usize> + 'a {
    let start = first_match(ranges, key, span).unwrap_or(ranges.len());
    (start..ranges.len()).take_while(move |&i| range_cmp(key, &span(&ranges[i])) == Ordering::Equal)
}
