//! Indications delivered from a [`crate::connection::Connection`] to its client.
//!
//! The engine never calls into the client while it is advancing its queues.
//! Instead every indication is queued as an [`Event`] and handed out by
//! [`crate::connection::Connection::poll_event`].  A client reacting to an
//! event is free to issue new requests on the connection straight away.

use crate::link::{DeviceAddress, LinkError, Qos};
use crate::segment::Segment;

/// Why a connection ended (or never came up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local client asked for it.
    UserRequest,
    /// The peer disconnected.
    PeerRequest,
    /// The lower layer reported a failure on an established link.
    LinkFailure,
    /// Discovery failed at the link level.
    DiscoveryFailed,
    /// Discovery finished but no device advertised the wanted service.
    NoService,
    /// The peer has no LSAP registered for the service.
    LookupFailed,
    /// The link-level connect or accept failed.
    ConnectFailed,
    /// The peer sent a Connect PDU we could not parse.
    ProtocolError,
}

/// How a delivered SDU was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Delivered straight from a single PDU.
    Complete,
    /// Rebuilt from `fragments` PDUs.
    Reassembled { fragments: usize },
}

/// Everything the client learns about a connection coming up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Device address of the peer.
    pub peer: DeviceAddress,
    /// Peer's LSAP selector.
    pub sap: u8,
    /// Our side of the negotiated link parameters.
    pub our_qos: Qos,
    /// The peer's side of the negotiated link parameters.
    pub peer_qos: Qos,
    /// Largest SDU the peer will reassemble (`0` = SAR disabled).
    pub max_sdu_size: u32,
    /// User data carried by the peer's Connect PDU.
    pub user_data: Segment,
}

/// A client-facing indication.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// A peer connected to our listening endpoint; answer with
    /// `connect_response`.
    ConnectIndication(ConnectInfo),
    /// Our outbound connect completed.
    ConnectConfirm(ConnectInfo),
    /// The accept issued by `connect_response` completed.
    AcceptDone(Result<(), LinkError>),
    /// The connection is gone.
    DisconnectIndication {
        reason: DisconnectReason,
        user_data: Option<Segment>,
    },
    /// One complete SDU from the peer.
    DataIndication {
        payload: Segment,
        status: DeliveryStatus,
    },
    /// The peer granted credit; blocked senders may retry.
    BackEnable,
}
