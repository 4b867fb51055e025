//! Inbound SDU reassembly.
//!
//! When segmentation is enabled inbound (`rx_max_sdu_size > 0`), every
//! fragment of an SDU except the last arrives with the `more` bit set.
//! [`ReassemblyBuffer`] collects those fragments in arrival order until the
//! terminal fragment completes the SDU.
//!
//! The buffer is bounded by the max SDU size we advertised at connect time.
//! A peer that sends more than that is violating the protocol; the caller
//! drops the SDU and starts over with no reassembly in progress.

use thiserror::Error;

use crate::segment::Segment;

/// Errors from [`ReassemblyBuffer::append`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Accepting the fragment would exceed the advertised max SDU size.
    #[error("SDU overflow: {len} byte(s) exceeds max SDU size {capacity}")]
    Overflow { len: usize, capacity: usize },
}

/// Accumulates the fragments of one SDU.
///
/// Storage grows with the fragments actually received; `capacity` only
/// bounds it.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    sdu: Vec<u8>,
    capacity: usize,
    fragments: Vec<usize>,
}

impl ReassemblyBuffer {
    /// Start an empty SDU of at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            sdu: Vec::new(),
            capacity,
            fragments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Sizes of the fragments accepted so far, in arrival order.
    pub fn fragments(&self) -> &[usize] {
        &self.fragments
    }

    /// Append one fragment.  On overflow nothing is written.
    pub fn append(&mut self, fragment: &[u8]) -> Result<(), ReassemblyError> {
        let len = self.sdu.len() + fragment.len();
        if len > self.capacity {
            return Err(ReassemblyError::Overflow {
                len,
                capacity: self.capacity,
            });
        }
        self.sdu.extend_from_slice(fragment);
        self.fragments.push(fragment.len());
        Ok(())
    }

    /// Hand over the finished SDU together with its fragment sizes.
    pub fn finish(self) -> (Segment, Vec<usize>) {
        (Segment::from_vec(self.sdu), self.fragments)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
