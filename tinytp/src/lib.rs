//! `tinytp`: TinyTP, a thin reliable transport over an LSAP link.
//!
//! # Architecture
//!
//! ```text
//!  Client ──requests──▶ ┌──────────────────────────────┐ ──Event──▶ Client
//!                       │          Connection          │
//!                       │  tx WorkQueue   rx WorkQueue │
//!                       │  FlowController Reassembly   │
//!                       └──────────────┬───────────────┘
//!                          LinkRequest │ ▲ LinkCompletion
//!                       ┌──────────────▼─┴─────────────┐
//!                       │     Link (LSAP service)      │
//!                       └──────────────────────────────┘
//! ```
//!
//! TinyTP adds two things to a link that already delivers packets in order:
//! credit-based flow control (the receiver grants the sender one credit per
//! free receive buffer) and segmentation/reassembly of SDUs larger than one
//! link packet.
//!
//! Each module has a single responsibility:
//! - [`segment`]    : byte region with movable cursors and headroom
//! - [`pdu`]        : Connect and Data PDU wire format
//! - [`work_queue`] : bounded FIFO of pending sends and deliveries
//! - [`flow`]       : credit counters and the receive-credit ledger
//! - [`reassembly`] : inbound SDU reassembly
//! - [`state`]      : finite-state-machine types
//! - [`config`]     : tunables
//! - [`link`]       : the lower-layer contract
//! - [`event`]      : client indications
//! - [`connection`] : the engine and its `drain` dispatcher
//! - [`session`]    : async actor owning one connection
//! - [`simulator`]  : in-memory back-to-back link for tests and the demo

pub mod config;
pub mod connection;
pub mod event;
pub mod flow;
pub mod link;
pub mod pdu;
pub mod reassembly;
pub mod segment;
pub mod session;
pub mod simulator;
pub mod state;
pub mod work_queue;

pub use config::Config;
pub use connection::{ConnError, Connection};
pub use event::{DeliveryStatus, DisconnectReason, Event};
pub use link::{DeviceAddress, Link, LinkCompletion, LinkError, LinkRequest};
pub use segment::Segment;
pub use session::{LinkDriver, Session, SessionError};
