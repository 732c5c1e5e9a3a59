//! Splitting guest byte ranges into per-page segments.

use memslots_abi::{gpa_to_gfn, offset_in_page, PAGE_SIZE};

/// One page-contained piece of a larger guest access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Guest frame the piece lives in.
    pub gfn: u64,
    /// Byte offset inside that frame.
    pub offset: usize,
    /// Bytes in this piece.
    pub len: usize,
    /// Offset of this piece inside the caller's buffer.
    pub buf_offset: usize,
}

/// Bytes that can be accessed from `offset` without crossing a page.
pub fn next_segment(len: usize, offset: usize) -> usize {
    debug_assert!((offset as u64) < PAGE_SIZE);
    len.min(PAGE_SIZE as usize - offset)
}

/// Iterate the per-page segments of `[gpa, gpa + len)`.
pub fn segments(gpa: u64, len: usize) -> Segments {
    Segments {
        gfn: gpa_to_gfn(gpa),
        offset: offset_in_page(gpa) as usize,
        remaining: len,
        done: 0,
    }
}

/// Iterator returned by [`segments`].
#[derive(Debug, Clone)]
pub struct Segments {
    gfn: u64,
    offset: usize,
    remaining: usize,
    done: usize,
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }
        let len = next_segment(self.remaining, self.offset);
        let seg = Segment {
            gfn: self.gfn,
            offset: self.offset,
            len,
            buf_offset: self.done,
        };
        self.remaining -= len;
        self.done += len;
        self.offset = 0;
        self.gfn += 1;
        Some(seg)
    }
}

/// Number of frames touched by `[gpa, gpa + len)`, or `None` if the
/// range wraps the address space.
pub fn pages_spanned(gpa: u64, len: u64) -> Option<u64> {
    if len == 0 {
        return Some(0);
    }
    let last = gpa.checked_add(len - 1)?;
    Some(gpa_to_gfn(last) - gpa_to_gfn(gpa) + 1)
}

/// True if `len` bytes at `offset` stay inside one page.
pub fn fits_in_page(offset: usize, len: usize) -> bool {
    offset
        .checked_add(len)
        .is_some_and(|end| end as u64 <= PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_segment_stops_at_page_end() {
        assert_eq!(next_segment(100, 0), 100);
        assert_eq!(next_segment(5000, 0), 4096);
        assert_eq!(next_segment(100, 4090), 6);
    }

    #[test]
    fn single_page_access_is_one_segment() {
        let segs: Vec<Segment> = segments(0x1010, 16).collect();
        assert_eq!(
            segs,
            vec![Segment {
                gfn: 1,
                offset: 0x10,
                len: 16,
                buf_offset: 0
            }]
        );
    }

    #[test]
    fn straddling_access_splits_at_boundaries() {
        let segs: Vec<Segment> = segments(0x1ff8, 0x1010).collect();
        assert_eq!(segs.len(), 3);
        assert_eq!((segs[0].gfn, segs[0].offset, segs[0].len), (1, 0xff8, 8));
        assert_eq!((segs[1].gfn, segs[1].offset, segs[1].len), (2, 0, 0x1000));
        assert_eq!((segs[2].gfn, segs[2].offset, segs[2].len), (3, 0, 8));
        assert_eq!(segs[2].buf_offset, 0x1008);
        assert_eq!(segs.iter().map(|s| s.len).sum::<usize>(), 0x1010);
    }

    #[test]
    fn empty_access_has_no_segments() {
        assert_eq!(segments(0x1000, 0).count(), 0);
        assert_eq!(pages_spanned(0x1000, 0), Some(0));
    }

    #[test]
    fn pages_spanned_counts_partial_pages() {
        assert_eq!(pages_spanned(0x1000, 0x1000), Some(1));
        assert_eq!(pages_spanned(0x1fff, 2), Some(2));
        assert_eq!(pages_spanned(0x1800, 0x2000), Some(3));
    }

    #[test]
    fn wrapping_range_has_no_page_count() {
        assert_eq!(pages_spanned(u64::MAX - 0xfff, 0x1000), Some(1));
        assert_eq!(pages_spanned(u64::MAX - 0xfff, 0x1001), None);
        assert_eq!(pages_spanned(u64::MAX, u64::MAX), None);
    }

    #[test]
    fn fits_in_page_checks_both_ends() {
        assert!(fits_in_page(0, 4096));
        assert!(fits_in_page(4092, 4));
        assert!(!fits_in_page(4092, 5));
        assert!(!fits_in_page(0, 4097));
        assert!(!fits_in_page(usize::MAX, 1));
    }
}
