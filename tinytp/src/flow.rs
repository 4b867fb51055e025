//! Credit-based flow control.
//!
//! TinyTP grants the right to send one PDU per unit of credit.  Three counters
//! describe the state of one connection:
//!
//! ```text
//!   avail_credit   local receive buffers freed but not yet advertised
//!   remote_credit  buffers advertised to the peer (peer may still send this many)
//!   send_credit    buffers the peer advertised to us (we may still send this many)
//! ```
//!
//! Credit moves `avail → remote` when it is advertised on the wire, at most
//! [`MAX_CREDIT`] units per PDU.  Every data PDU we transmit consumes one unit
//! of `send_credit`; every data PDU we receive consumes one unit of
//! `remote_credit`.
//!
//! [`CreditLedger`] turns the client's "I consumed N bytes" reports back into
//! freed receive buffers.
//!
//! This module only manages counters; the connection decides when to put
//! PDUs on the wire.

use std::collections::VecDeque;

use crate::pdu::MAX_CREDIT;

/// Default ceiling on `send_credit`.
///
/// Some peers keep granting credit far beyond the buffers they actually hold.
/// Clamping bounds how far ahead of the peer we can run; 30 matches the limit
/// long used against those implementations.
pub const DEFAULT_SEND_CREDIT_CEILING: u32 = 30;

/// Advertise credit standalone once the peer holds this many units or fewer.
pub const DEFAULT_LOW_REMOTE_CREDIT: u32 = 2;

/// Advertise credit standalone once more than this many units are unadvertised.
pub const DEFAULT_SURPLUS_CREDIT: u32 = 3;

// ---------------------------------------------------------------------------
// FlowController
// ---------------------------------------------------------------------------

/// The three credit counters of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowController {
    avail_credit: u32,
    remote_credit: u32,
    send_credit: u32,
    ceiling: u32,
    low_remote_credit: u32,
    surplus_credit: u32,
}

impl FlowController {
    /// `initial_credit` receive buffers, none advertised yet; no send credit.
    pub fn new(initial_credit: u32, ceiling: u32) -> Self {
        Self {
            avail_credit: initial_credit,
            remote_credit: 0,
            send_credit: 0,
            ceiling,
            low_remote_credit: DEFAULT_LOW_REMOTE_CREDIT,
            surplus_credit: DEFAULT_SURPLUS_CREDIT,
        }
    }

    /// Override the thresholds that trigger a dataless credit PDU.
    pub fn with_thresholds(mut self, low_remote_credit: u32, surplus_credit: u32) -> Self {
        self.low_remote_credit = low_remote_credit;
        self.surplus_credit = surplus_credit;
        self
    }

    pub fn avail_credit(&self) -> u32 {
        self.avail_credit
    }

    pub fn remote_credit(&self) -> u32 {
        self.remote_credit
    }

    pub fn send_credit(&self) -> u32 {
        self.send_credit
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Move up to [`MAX_CREDIT`] units from `avail` to `remote` and return the
    /// amount to write into the outgoing PDU's credit field.
    pub fn take_advertisement(&mut self) -> u8 {
        let n = self.avail_credit.min(u32::from(MAX_CREDIT));
        self.avail_credit -= n;
        self.remote_credit += n;
        n as u8
    }

    /// Seed `send_credit` from the peer's Connect PDU.
    pub fn set_send_credit(&mut self, initial: u8) {
        self.send_credit = u32::from(initial).min(self.ceiling);
    }

    /// Apply the credit field of an inbound Data PDU.
    ///
    /// Returns `true` when the peer granted anything (the client should be
    /// told that sending may resume).
    pub fn on_peer_credit(&mut self, delta: u8) -> bool {
        if delta == 0 {
            return false;
        }
        let raw = self.send_credit + u32::from(delta);
        if raw > self.ceiling {
            log::debug!(
                "[ttp:flow] peer credit {} clamped to {}",
                raw,
                self.ceiling
            );
        }
        self.send_credit = raw.min(self.ceiling);
        true
    }

    /// Spend one unit of `send_credit` for an outgoing data PDU.
    ///
    /// Returns `false` (and changes nothing) when no credit is left.
    pub fn consume_send_credit(&mut self) -> bool {
        if self.send_credit == 0 {
            return false;
        }
        self.send_credit -= 1;
        true
    }

    /// Account for one inbound data PDU.
    ///
    /// Returns `false` if the peer sent without credit.
    pub fn on_data_received(&mut self) -> bool {
        if self.remote_credit == 0 {
            return false;
        }
        self.remote_credit -= 1;
        true
    }

    /// `n` local receive buffers became free again.
    pub fn credit_return(&mut self, n: u32) {
        self.avail_credit = self.avail_credit.saturating_add(n);
    }

    /// Should a dataless PDU go out right now purely to extend credit?
    ///
    /// `tx_idle` is `true` when no data PDU could carry the credit instead
    /// (transmit queue empty, or no send credit to send it with).
    pub fn wants_dataless(&self, tx_idle: bool) -> bool {
        tx_idle
            && (self.remote_credit <= self.low_remote_credit
                || self.avail_credit > self.surplus_credit)
            && self.avail_credit > 0
    }
}

// ---------------------------------------------------------------------------
// CreditLedger
// ---------------------------------------------------------------------------

/// Sizes of delivered packets whose receive buffers the client still holds.
///
/// The client reports consumption in bytes; each time the reported bytes
/// cover the oldest delivered packet, that packet's buffer is freed.
#[derive(Debug, Default, Clone)]
pub struct CreditLedger {
    sizes: VecDeque<usize>,
    consumed: usize,
}

impl CreditLedger {
    /// Record one packet of `size` bytes handed to the client.
    pub fn record(&mut self, size: usize) {
        self.sizes.push_back(size);
    }

    /// Apply `bytes` of client consumption; returns the number of packets
    /// fully consumed, i.e. credit to give back.
    pub fn consume(&mut self, bytes: usize) -> u32 {
        self.consumed += bytes;
        let mut freed = 0;
        while let Some(&front) = self.sizes.front() {
            if front > self.consumed {
                break;
            }
            self.consumed -= front;
            self.sizes.pop_front();
            freed += 1;
        }
        if self.sizes.is_empty() {
            // Over-reporting cannot pre-pay packets not yet delivered.
            self.consumed = 0;
        }
        freed
    }

    /// Packets delivered but not yet consumed.
    pub fn outstanding(&self) -> usize {
        self.sizes.len()
    }

    pub fn clear(&mut self) {
        self.sizes.clear();
        self.consumed = 0;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
