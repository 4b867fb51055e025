//! The lower-layer (LSAP) service TinyTP runs on.
//!
//! The link is consumed through two halves:
//! - [`Link`]: the eight request primitives the engine issues.  None of them
//!   block; each one is answered later by a completion.
//! - [`LinkCompletion`]: the answers, fed back into
//!   [`crate::connection::Connection::handle_completion`].
//!
//! [`LinkRequest`] is the value form of the request primitives.  Two ready-made
//! [`Link`] implementations record requests as values: a `VecDeque` for
//! synchronous drivers such as [`crate::simulator`], and an unbounded tokio
//! channel for [`crate::session`].

use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::segment::Segment;

/// 32-bit device address of a link peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceAddress(pub u32);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Negotiated link parameters for one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qos {
    pub baud_rate: u32,
    /// Largest link-level data field, including link headers.
    pub data_size: usize,
}

/// One device found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLog {
    pub address: DeviceAddress,
    /// Service hint bits the device advertises.
    pub hints: u16,
    pub nickname: String,
}

/// Failures reported by the link in a completion.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("link failed")]
    Failed,
    #[error("no response from peer")]
    NoResponse,
    #[error("no such IAS entry")]
    NoSuchEntry,
    #[error("connection refused")]
    Refused,
    #[error("packet of {len} byte(s) does not fit read buffer of {capacity}")]
    PacketTooLarge { len: usize, capacity: usize },
    #[error("request cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// The request primitives of the lower layer.
pub trait Link {
    /// Look for devices in range using `slots` discovery slots.
    fn discover(&mut self, slots: u8);
    /// Ask `addr` for the value of `attr_name` in IAS class `class_name`.
    fn lookup(&mut self, class_name: &str, attr_name: &str, addr: DeviceAddress);
    /// Connect to LSAP `sap` on `addr`, carrying our Connect PDU.
    fn connect(&mut self, addr: DeviceAddress, sap: u8, pdu: Segment);
    /// Accept the pending inbound connection, carrying our Connect PDU.
    fn accept(&mut self, pdu: Segment);
    /// Wait for an inbound connection; `buffer` receives the peer's Connect PDU.
    fn listen(&mut self, buffer: Segment);
    /// Drop the connection (or cancel a pending connect/listen).
    fn disconnect(&mut self, user_data: Option<Segment>);
    /// Transmit one PDU.
    fn put(&mut self, pdu: Segment);
    /// Post `buffer` to receive the next inbound PDU.
    fn get(&mut self, buffer: Segment);
}

/// A link request as a value.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkRequest {
    Discover {
        slots: u8,
    },
    Lookup {
        class_name: String,
        attr_name: String,
        addr: DeviceAddress,
    },
    Connect {
        addr: DeviceAddress,
        sap: u8,
        pdu: Segment,
    },
    Accept {
        pdu: Segment,
    },
    Listen {
        buffer: Segment,
    },
    Disconnect {
        user_data: Option<Segment>,
    },
    Put {
        pdu: Segment,
    },
    Get {
        buffer: Segment,
    },
}

impl LinkRequest {
    fn lookup(class_name: &str, attr_name: &str, addr: DeviceAddress) -> Self {
        LinkRequest::Lookup {
            class_name: class_name.to_string(),
            attr_name: attr_name.to_string(),
            addr,
        }
    }
}

/// Records requests in order; the driver pops them from the front.
impl Link for VecDeque<LinkRequest> {
    fn discover(&mut self, slots: u8) {
        self.push_back(LinkRequest::Discover { slots });
    }

    fn lookup(&mut self, class_name: &str, attr_name: &str, addr: DeviceAddress) {
        self.push_back(LinkRequest::lookup(class_name, attr_name, addr));
    }

    fn connect(&mut self, addr: DeviceAddress, sap: u8, pdu: Segment) {
        self.push_back(LinkRequest::Connect { addr, sap, pdu });
    }

    fn accept(&mut self, pdu: Segment) {
        self.push_back(LinkRequest::Accept { pdu });
    }

    fn listen(&mut self, buffer: Segment) {
        self.push_back(LinkRequest::Listen { buffer });
    }

    fn disconnect(&mut self, user_data: Option<Segment>) {
        self.push_back(LinkRequest::Disconnect { user_data });
    }

    fn put(&mut self, pdu: Segment) {
        self.push_back(LinkRequest::Put { pdu });
    }

    fn get(&mut self, buffer: Segment) {
        self.push_back(LinkRequest::Get { buffer });
    }
}

/// Streams requests to an async link driver.  A closed channel means the
/// driver is gone; the request is dropped and logged.
impl Link for mpsc::UnboundedSender<LinkRequest> {
    fn discover(&mut self, slots: u8) {
        forward(self, LinkRequest::Discover { slots });
    }

    fn lookup(&mut self, class_name: &str, attr_name: &str, addr: DeviceAddress) {
        forward(self, LinkRequest::lookup(class_name, attr_name, addr));
    }

    fn connect(&mut self, addr: DeviceAddress, sap: u8, pdu: Segment) {
        forward(self, LinkRequest::Connect { addr, sap, pdu });
    }

    fn accept(&mut self, pdu: Segment) {
        forward(self, LinkRequest::Accept { pdu });
    }

    fn listen(&mut self, buffer: Segment) {
        forward(self, LinkRequest::Listen { buffer });
    }

    fn disconnect(&mut self, user_data: Option<Segment>) {
        forward(self, LinkRequest::Disconnect { user_data });
    }

    fn put(&mut self, pdu: Segment) {
        forward(self, LinkRequest::Put { pdu });
    }

    fn get(&mut self, buffer: Segment) {
        forward(self, LinkRequest::Get { buffer });
    }
}

fn forward(tx: &mpsc::UnboundedSender<LinkRequest>, req: LinkRequest) {
    if let Err(mpsc::error::SendError(req)) = tx.send(req) {
        log::warn!("[ttp:link] driver gone; dropping {req:?}");
    }
}

// ---------------------------------------------------------------------------
// Completions
// ---------------------------------------------------------------------------

/// Outcome of a successful outbound connect.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectConfirm {
    pub sap: u8,
    pub our_qos: Qos,
    pub peer_qos: Qos,
    /// The peer's Connect PDU.
    pub pdu: Segment,
}

/// A peer connected to our listening LSAP.
#[derive(Debug, PartialEq, Eq)]
pub struct ListenIndication {
    pub addr: DeviceAddress,
    pub sap: u8,
    pub our_qos: Qos,
    pub peer_qos: Qos,
    /// The peer's Connect PDU, in the listen buffer.
    pub pdu: Segment,
}

/// A completion reported by the link.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkCompletion {
    Discover(Result<Vec<DiscoveryLog>, LinkError>),
    /// LSAP selector found by the lookup.
    Lookup(Result<u8, LinkError>),
    Connect(Result<ConnectConfirm, LinkError>),
    Listen(Result<ListenIndication, LinkError>),
    Accept(Result<(), LinkError>),
    /// Our own disconnect finished.
    Disconnect,
    /// The peer disconnected.
    DisconnectIndication { user_data: Option<Segment> },
    Put(Result<(), LinkError>),
    /// The read buffer, filled with one inbound PDU.
    Get(Result<Segment, LinkError>),
}
