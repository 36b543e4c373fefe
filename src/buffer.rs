//! # Buffer Segments
//!
//! A [`Segment`] is the pool's allocation unit: a fixed-capacity byte
//! region with a movable valid window `[start, start + len)`. Keeping the
//! window loose inside the storage is what makes header work zero-copy:
//! prepending into existing head room or truncating either end is pointer
//! arithmetic, never a `memmove`. Only when a prepend outgrows the head
//! room while tail room remains does the payload shift once to make room.
//!
//! Segments link into chains by arena index ([`SegId`]), never by
//! pointer; a segment belongs to exactly one chain or free list at a
//! time.

use crate::config::SEGMENT_SIZE;

/// Index of a segment in its pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegId(pub(crate) u16);

impl SegId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a chain in its pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainId(pub(crate) u16);

impl ChainId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One fixed-capacity data segment.
pub struct Segment {
    data: [u8; SEGMENT_SIZE],
    start: usize,
    len: usize,
    pub(crate) next: Option<SegId>,
}

impl Segment {
    pub(crate) const EMPTY: Segment =
        Segment { data: [0; SEGMENT_SIZE], start: 0, len: 0, next: None };

    /// Bytes of valid data in the window.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free bytes before the window, usable for zero-copy prepends.
    pub fn head_room(&self) -> usize {
        self.start
    }

    /// Free bytes after the window.
    pub fn tail_room(&self) -> usize {
        SEGMENT_SIZE - self.start - self.len
    }

    /// Total free bytes; a prepend of up to this much always fits, at the
    /// cost of one payload shift when the head room alone is short.
    pub fn space(&self) -> usize {
        SEGMENT_SIZE - self.len
    }

    /// Back to a pristine empty segment.
    pub(crate) fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
        self.next = None;
    }

    /// Turn all storage into head room. Used on a fresh segment about to
    /// be chained at the front of a chain and filled backwards.
    pub(crate) fn reserve_head(&mut self) {
        debug_assert!(self.len == 0);
        self.start = SEGMENT_SIZE;
    }

    /// Grow the window backwards by `n` bytes and return the new region.
    /// Shifts the payload toward the tail first if the head room alone is
    /// short; the caller has checked `space() >= n`.
    pub(crate) fn prepend_slot(&mut self, n: usize) -> &mut [u8] {
        assert!(self.space() >= n, "segment overflow: prepend {} into {}", n, self.space());
        if self.start < n {
            let shift = n - self.start;
            self.data.copy_within(self.start..self.start + self.len, self.start + shift);
            self.start += shift;
        }
        self.start -= n;
        self.len += n;
        &mut self.data[self.start..self.start + n]
    }

    /// Grow the window forwards by `n` bytes and return the new region.
    /// The caller has checked `tail_room() >= n`.
    pub(crate) fn append_slot(&mut self, n: usize) -> &mut [u8] {
        assert!(self.tail_room() >= n, "segment overflow: append {} into {}", n, self.tail_room());
        let at = self.start + self.len;
        self.len += n;
        &mut self.data[at..at + n]
    }

    /// Valid bytes `[offset, offset + n)`.
    pub(crate) fn slice(&self, offset: usize, n: usize) -> &[u8] {
        debug_assert!(offset + n <= self.len);
        &self.data[self.start + offset..self.start + offset + n]
    }

    pub(crate) fn slice_mut(&mut self, offset: usize, n: usize) -> &mut [u8] {
        debug_assert!(offset + n <= self.len);
        &mut self.data[self.start + offset..self.start + offset + n]
    }

    /// Discard `n` bytes from the front of the window (pointer shift).
    pub(crate) fn drop_head(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.start += n;
        self.len -= n;
    }

    /// Discard `n` bytes from the back of the window.
    pub(crate) fn drop_tail(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.len -= n;
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_prepend_in_place() {
        let mut seg = Segment::EMPTY;
        assert_eq!(seg.space(), SEGMENT_SIZE);

        seg.append_slot(4).copy_from_slice(b"data");
        assert_eq!(seg.len(), 4);
        assert_eq!(seg.head_room(), 0);
        assert_eq!(seg.tail_room(), SEGMENT_SIZE - 4);

        // No head room: the payload shifts once, then the header lands
        // in front of it.
        seg.prepend_slot(3).copy_from_slice(b"hdr");
        assert_eq!(seg.len(), 7);
        assert_eq!(seg.slice(0, 7), b"hdrdata");
    }

    #[test]
    fn drop_head_leaves_head_room() {
        let mut seg = Segment::EMPTY;
        seg.append_slot(8).copy_from_slice(b"xxxxyyyy");
        seg.drop_head(4);
        assert_eq!(seg.len(), 4);
        assert_eq!(seg.head_room(), 4);
        assert_eq!(seg.slice(0, 4), b"yyyy");

        // The freed head room takes a prepend without moving the payload.
        seg.prepend_slot(4).copy_from_slice(b"zzzz");
        assert_eq!(seg.slice(0, 8), b"zzzzyyyy");
    }

    #[test]
    fn reserve_head_fills_backwards() {
        let mut seg = Segment::EMPTY;
        seg.reserve_head();
        assert_eq!(seg.head_room(), SEGMENT_SIZE);
        assert_eq!(seg.tail_room(), 0);

        seg.prepend_slot(2).copy_from_slice(b"cd");
        seg.prepend_slot(2).copy_from_slice(b"ab");
        assert_eq!(seg.slice(0, 4), b"abcd");
    }

    #[test]
    fn drop_tail_and_reset() {
        let mut seg = Segment::EMPTY;
        seg.append_slot(6).copy_from_slice(b"abcdef");
        seg.drop_tail(2);
        assert_eq!(seg.len(), 4);
        assert_eq!(seg.slice(0, 4), b"abcd");

        seg.reset();
        assert!(seg.is_empty());
        assert_eq!(seg.head_room(), 0);
        assert_eq!(seg.space(), SEGMENT_SIZE);
    }
}
