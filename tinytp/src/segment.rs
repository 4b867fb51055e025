//! Cursor-addressed byte buffers.
//!
//! A [`Segment`] is the unit of data handed between every layer of the
//! transport: the codec writes headers into it, the work queues hold it, the
//! link fills it, and the client finally receives it.  It owns one physical
//! allocation and exposes a *visible region* inside it through three cursors:
//!
//! ```text
//!  0        base        mark             end         capacity
//!  ├─────────┼───────────┼────────────────┼──────────────┤
//!  │ hidden  │  consumed │   remaining    │    hidden    │
//!            └────────── visible ─────────┘
//! ```
//!
//! Invariant: `0 ≤ base ≤ mark ≤ end ≤ capacity`.  Every accessor clamps or
//! returns [`SegmentError`] instead of moving a cursor outside that range.
//!
//! Hidden bytes in front of `base` are *headroom*: the codec reveals them to
//! prepend a protocol header without copying the payload.

use thiserror::Error;

/// Errors from cursor operations on a [`Segment`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    /// A read or write ran past the end of the visible region.
    #[error("access past end of segment (wanted {wanted} byte(s), {remaining} remaining)")]
    OutOfBounds { wanted: usize, remaining: usize },
    /// Tried to reveal more bytes than are hidden on that side.
    #[error("cannot reveal {wanted} byte(s), only {hidden} hidden")]
    NoHeadroom { wanted: usize, hidden: usize },
}

/// An owned byte region with `base` / `mark` / `end` cursors.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    buf: Vec<u8>,
    base: usize,
    mark: usize,
    end: usize,
}

impl Segment {
    /// Allocate a zeroed segment whose visible region spans the whole
    /// allocation.  Used for inbound read buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            base: 0,
            mark: 0,
            end: capacity,
        }
    }

    /// Take ownership of `buf`; the visible region is all of it.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        let end = buf.len();
        Self {
            buf,
            base: 0,
            mark: 0,
            end,
        }
    }

    /// Copy `data` into a fresh segment with `headroom` hidden bytes in front.
    pub fn with_headroom(headroom: usize, data: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(headroom + data.len());
        buf.resize(headroom, 0);
        buf.extend_from_slice(data);
        Self {
            buf,
            base: headroom,
            mark: headroom,
            end: headroom + data.len(),
        }
    }

    /// Size of the visible region (`end - base`).
    pub fn len(&self) -> usize {
        self.end - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.base
    }

    /// Bytes between `mark` and `end`.
    pub fn remaining(&self) -> usize {
        self.end - self.mark
    }

    /// Reset `mark` to `base`.
    pub fn rewind(&mut self) {
        self.mark = self.base;
    }

    /// Read one byte at `mark`.
    pub fn get_u8(&mut self) -> Result<u8, SegmentError> {
        if self.remaining() == 0 {
            return Err(SegmentError::OutOfBounds {
                wanted: 1,
                remaining: 0,
            });
        }
        let b = self.buf[self.mark];
        self.mark += 1;
        Ok(b)
    }

    /// Copy up to `src.len()` bytes into the segment at `mark`; returns the
    /// count written.  Never grows the visible region.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.buf[self.mark..self.mark + n].copy_from_slice(&src[..n]);
        self.mark += n;
        n
    }

    /// Write one byte at `mark`.
    pub fn put_u8(&mut self, b: u8) -> Result<(), SegmentError> {
        if self.remaining() == 0 {
            return Err(SegmentError::OutOfBounds {
                wanted: 1,
                remaining: 0,
            });
        }
        self.buf[self.mark] = b;
        self.mark += 1;
        Ok(())
    }

    /// Shrink the visible region by up to `n` bytes at the front.  Returns the
    /// number of bytes actually hidden.
    pub fn hide_from_start(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.base += n;
        self.mark = self.mark.max(self.base);
        self.check();
        n
    }

    /// Grow the visible region `n` bytes into the headroom; `mark` moves to
    /// the new `base` so the caller can write a header.
    pub fn reveal_from_start(&mut self, n: usize) -> Result<(), SegmentError> {
        if n > self.base {
            return Err(SegmentError::NoHeadroom {
                wanted: n,
                hidden: self.base,
            });
        }
        self.base -= n;
        self.mark = self.base;
        self.check();
        Ok(())
    }

    /// Make the bytes written so far the whole visible region (`end = mark`)
    /// and rewind.  Turns a filled read buffer into a received packet.
    pub fn flip(&mut self) {
        self.end = self.mark;
        self.mark = self.base;
        self.check();
    }

    /// The visible bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.base..self.end]
    }

    #[inline]
    fn check(&self) {
        debug_assert!(
            self.base <= self.mark && self.mark <= self.end && self.end <= self.buf.len(),
            "segment cursors out of order: base={} mark={} end={} cap={}",
            self.base,
            self.mark,
            self.end,
            self.buf.len()
        );
    }
}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for Segment {
    /// Two segments are equal when their visible bytes are.
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Segment {}

impl From<Vec<u8>> for Segment {
    fn from(buf: Vec<u8>) -> Self {
        Self::from_vec(buf)
    }
}

impl From<&[u8]> for Segment {
    fn from(data: &[u8]) -> Self {
        Self::with_headroom(0, data)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
