//! Ordered queues of pending transmit and receive work.
//!
//! Each [`crate::connection::Connection`] owns one [`WorkQueue`] per direction.
//! Items enter at the tail and leave at the head; an item lives in exactly one
//! queue and owns at most one [`Segment`].  Queues are bounded so a client or
//! peer that outruns the link sees back-pressure instead of unbounded growth.

use std::collections::VecDeque;

use crate::event::DisconnectReason;
use crate::segment::Segment;

/// Default number of items a queue will hold.
pub const DEFAULT_QUEUE_LIMIT: usize = 50;

/// One unit of pending work.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkItem {
    /// Tear down the connection once everything ahead of it has gone out.
    Disconnect {
        reason: DisconnectReason,
        user_data: Option<Segment>,
    },
    /// One fragment of an SDU.  `more` is set on every fragment but the last.
    Data { more: bool, payload: Segment },
}

impl WorkItem {
    pub fn is_data(&self) -> bool {
        matches!(self, WorkItem::Data { .. })
    }
}

/// A bounded FIFO of [`WorkItem`]s.
#[derive(Debug)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
    limit: usize,
}

impl WorkQueue {
    /// Create an empty queue holding at most `limit` items.
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(limit.min(DEFAULT_QUEUE_LIMIT)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// `true` when `n` more items fit.
    pub fn has_room(&self, n: usize) -> bool {
        self.items.len() + n <= self.limit
    }

    /// Append `item` at the tail.  A full queue hands the item back.
    pub fn push(&mut self, item: WorkItem) -> Result<(), WorkItem> {
        if !self.has_room(1) {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Remove the head item.
    pub fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    /// Peek at the head item.
    pub fn front(&self) -> Option<&WorkItem> {
        self.items.front()
    }

    /// Drop every queued item and return how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_LIMIT)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
