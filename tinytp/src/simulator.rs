//! In-memory link for running two TinyTP endpoints back to back.
//!
//! [`Wire`] models a reliable point-to-point link between two endpoints,
//! `A` and `B`.  It takes the [`LinkRequest`]s one side issues and answers
//! them with [`LinkCompletion`]s for either side:
//!
//! | Request      | Result                                                   |
//! |--------------|----------------------------------------------------------|
//! | `Discover`   | the peer's discovery log                                 |
//! | `Lookup`     | the peer's SAP, if the peer is listening                 |
//! | `Connect`    | listen indication at the peer, refused if not listening  |
//! | `Accept`     | accept done here, connect confirm at the peer            |
//! | `Put`        | put done here, PDU into the peer's read buffer or inbox  |
//! | `Get`        | oldest inbox PDU, or the buffer waits for the next put   |
//! | `Disconnect` | disconnect done here, indication at the peer after it    |
//! |              | has read every PDU sent before the disconnect            |
//!
//! A PDU larger than the read buffer fails that read with
//! [`LinkError::PacketTooLarge`].
//!
//! Fault injection is driven by a seeded [`StdRng`] so every run with the same
//! [`SimulatorConfig`] replays identically.  A failed put breaks the link: the
//! sender sees the put fail and the peer sees a disconnect.
//!
//! Two drivers share the same `Wire`:
//! - [`LinkSimulator`] owns two synchronous [`Connection`]s and shuttles
//!   requests with [`LinkSimulator::pump`].
//! - [`bridge`] serves two [`Session`](crate::session::Session)s through their
//!   [`LinkDriver`]s.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{Config, ConfigError, HINT_IRCOMM};
use crate::connection::Connection;
use crate::event::Event;
use crate::link::{
    ConnectConfirm, DeviceAddress, DiscoveryLog, LinkCompletion, LinkError, LinkRequest,
    ListenIndication, Qos,
};
use crate::segment::Segment;
use crate::session::LinkDriver;

/// One end of the simulated link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

/// Identity of one simulated device.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub address: DeviceAddress,
    pub nickname: String,
    /// Service hint bits returned by discovery.
    pub hints: u16,
    /// LSAP selector the device listens on.
    pub sap: u8,
    /// Link data size this device offers during negotiation.
    pub data_size: usize,
    pub baud_rate: u32,
}

impl Endpoint {
    fn qos(&self) -> Qos {
        Qos {
            baud_rate: self.baud_rate,
            data_size: self.data_size,
        }
    }
}

/// Configuration for the simulated link and its fault model.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability in `[0.0, 1.0]` that a put fails and breaks the link.
    pub put_failure_rate: f64,
    /// Seed for the fault-injection RNG.
    pub seed: u64,
    pub a: Endpoint,
    pub b: Endpoint,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default; the link is reliable.
        Self {
            put_failure_rate: 0.0,
            seed: 0,
            a: Endpoint {
                address: DeviceAddress(0x0000_0a0a),
                nickname: "tinytp-a".to_string(),
                hints: HINT_IRCOMM,
                sap: 0x10,
                data_size: 64,
                baud_rate: 115_200,
            },
            b: Endpoint {
                address: DeviceAddress(0x0000_0b0b),
                nickname: "tinytp-b".to_string(),
                hints: HINT_IRCOMM,
                sap: 0x11,
                data_size: 64,
                baud_rate: 115_200,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Wire
// ---------------------------------------------------------------------------

/// Link-side state of one endpoint.
#[derive(Debug)]
struct End {
    endpoint: Endpoint,
    /// Posted listen buffer.
    listen: Option<Segment>,
    /// Outbound connect delivered to the peer; waiting for its accept.
    connecting: bool,
    /// Inbound connect indicated; waiting for our accept.
    indicated: bool,
    connected: bool,
    /// Posted read buffer.
    read: Option<Segment>,
    /// PDUs that arrived with no read posted.
    inbox: VecDeque<Segment>,
    /// The peer disconnected; the indication waits until `inbox` is read.
    closing: Option<Option<Segment>>,
}

impl End {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            listen: None,
            connecting: false,
            indicated: false,
            connected: false,
            read: None,
            inbox: VecDeque::new(),
            closing: None,
        }
    }

    fn is_linked(&self) -> bool {
        self.connected || self.connecting || self.indicated || self.closing.is_some()
    }

    fn unlink(&mut self) {
        self.connecting = false;
        self.indicated = false;
        self.connected = false;
        self.read = None;
        self.inbox.clear();
        self.closing = None;
    }
}

/// Counters kept by the [`Wire`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireStats {
    /// PDUs handed to the peer.
    pub delivered: usize,
    /// Puts failed by fault injection.
    pub dropped: usize,
    /// Reads posted while another read was still outstanding.
    pub overlapping_reads: usize,
}

/// Routing core of the simulated link.
#[derive(Debug)]
pub struct Wire {
    put_failure_rate: f64,
    rng: StdRng,
    ends: [End; 2],
    stats: WireStats,
}

impl Wire {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            put_failure_rate: config.put_failure_rate.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(config.seed),
            ends: [End::new(config.a), End::new(config.b)],
            stats: WireStats::default(),
        }
    }

    pub fn stats(&self) -> WireStats {
        self.stats
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint {
        &self.ends[side.index()].endpoint
    }

    fn end(&mut self, side: Side) -> &mut End {
        &mut self.ends[side.index()]
    }

    /// Carry out one request issued by `from`; returns the completions it
    /// produces, in delivery order, tagged with the side they belong to.
    pub fn route(&mut self, from: Side, req: LinkRequest) -> Vec<(Side, LinkCompletion)> {
        let to = from.peer();
        let mut out = Vec::new();

        match req {
            LinkRequest::Discover { slots } => {
                let peer = self.endpoint(to);
                log::debug!("[sim] {from:?} DISCOVER slots={slots}: found {}", peer.address);
                let entry = DiscoveryLog {
                    address: peer.address,
                    hints: peer.hints,
                    nickname: peer.nickname.clone(),
                };
                out.push((from, LinkCompletion::Discover(Ok(vec![entry]))));
            }

            LinkRequest::Lookup {
                class_name,
                attr_name,
                addr,
            } => {
                let peer = &self.ends[to.index()];
                let result = if addr == peer.endpoint.address && peer.listen.is_some() {
                    Ok(peer.endpoint.sap)
                } else {
                    Err(LinkError::NoSuchEntry)
                };
                log::debug!("[sim] {from:?} LOOKUP {class_name}/{attr_name} at {addr}: {result:?}");
                out.push((from, LinkCompletion::Lookup(result)));
            }

            LinkRequest::Connect { addr, sap, pdu } => {
                let reachable = {
                    let peer = self.endpoint(to);
                    addr == peer.address && sap == peer.sap
                };
                let listen = self.end(to).listen.take();
                match listen {
                    Some(buffer) if reachable => match fill(buffer, &pdu) {
                        Ok(buffer) => {
                            self.end(from).connecting = true;
                            self.end(to).indicated = true;
                            let indication = ListenIndication {
                                addr: self.endpoint(from).address,
                                sap: self.endpoint(from).sap,
                                our_qos: self.endpoint(to).qos(),
                                peer_qos: self.endpoint(from).qos(),
                                pdu: buffer,
                            };
                            log::debug!("[sim] {from:?} CONNECT {addr} sap={sap}: indicated");
                            out.push((to, LinkCompletion::Listen(Ok(indication))));
                        }
                        Err(e) => {
                            out.push((to, LinkCompletion::Listen(Err(e))));
                            out.push((from, LinkCompletion::Connect(Err(LinkError::Refused))));
                        }
                    },
                    listen => {
                        self.end(to).listen = listen;
                        log::debug!("[sim] {from:?} CONNECT {addr} sap={sap}: refused");
                        out.push((from, LinkCompletion::Connect(Err(LinkError::Refused))));
                    }
                }
            }

            LinkRequest::Accept { pdu } => {
                if self.end(from).indicated && self.end(to).connecting {
                    for side in [from, to] {
                        let end = self.end(side);
                        end.indicated = false;
                        end.connecting = false;
                        end.connected = true;
                    }
                    let confirm = ConnectConfirm {
                        sap: self.endpoint(from).sap,
                        our_qos: self.endpoint(to).qos(),
                        peer_qos: self.endpoint(from).qos(),
                        pdu,
                    };
                    log::debug!("[sim] {from:?} ACCEPT: linked");
                    out.push((from, LinkCompletion::Accept(Ok(()))));
                    out.push((to, LinkCompletion::Connect(Ok(confirm))));
                } else {
                    out.push((from, LinkCompletion::Accept(Err(LinkError::Failed))));
                }
            }

            LinkRequest::Listen { buffer } => {
                self.end(from).listen = Some(buffer);
            }

            LinkRequest::Disconnect { user_data } => {
                let was_linked = self.end(from).is_linked();
                self.end(from).listen = None;
                self.end(from).unlink();
                log::debug!("[sim] {from:?} DISCONNECT");
                out.push((from, LinkCompletion::Disconnect));
                if was_linked && self.end(to).is_linked() {
                    let peer = self.end(to);
                    if peer.inbox.is_empty() {
                        peer.unlink();
                        out.push((to, LinkCompletion::DisconnectIndication { user_data }));
                    } else {
                        // Data sent before the disconnect is read first.
                        peer.connected = false;
                        peer.closing = Some(user_data);
                    }
                }
            }

            LinkRequest::Put { pdu } => {
                let sender = self.end(from);
                if !(sender.connected || sender.closing.is_some()) {
                    out.push((from, LinkCompletion::Put(Err(LinkError::Failed))));
                } else if self.put_failure_rate > 0.0
                    && self.rng.random_bool(self.put_failure_rate)
                {
                    log::warn!("[sim] {from:?} PUT len={} failed; link down", pdu.len());
                    self.stats.dropped += 1;
                    self.end(from).unlink();
                    self.end(to).unlink();
                    out.push((from, LinkCompletion::Put(Err(LinkError::Failed))));
                    out.push((to, LinkCompletion::DisconnectIndication { user_data: None }));
                } else {
                    out.push((from, LinkCompletion::Put(Ok(()))));
                    if self.end(to).connected {
                        self.stats.delivered += 1;
                        let read = self.end(to).read.take();
                        match read {
                            Some(buffer) => out.push((to, LinkCompletion::Get(fill(buffer, &pdu)))),
                            None => self.end(to).inbox.push_back(pdu),
                        }
                    }
                }
            }

            LinkRequest::Get { buffer } => {
                let end = self.end(from);
                if let Some(pdu) = end.inbox.pop_front() {
                    out.push((from, LinkCompletion::Get(fill(buffer, &pdu))));
                } else if let Some(user_data) = end.closing.take() {
                    end.unlink();
                    out.push((from, LinkCompletion::DisconnectIndication { user_data }));
                } else if end.read.replace(buffer).is_some() {
                    log::error!("[sim] {from:?} posted a second read");
                    self.stats.overlapping_reads += 1;
                }
            }
        }

        out
    }
}

/// Copy `pdu` into a posted buffer, making it exactly the PDU.
fn fill(mut buffer: Segment, pdu: &Segment) -> Result<Segment, LinkError> {
    if pdu.len() > buffer.len() {
        return Err(LinkError::PacketTooLarge {
            len: pdu.len(),
            capacity: buffer.len(),
        });
    }
    buffer.put(pdu.as_slice());
    buffer.flip();
    Ok(buffer)
}

// ---------------------------------------------------------------------------
// LinkSimulator: synchronous driver
// ---------------------------------------------------------------------------

/// Two connections joined by a [`Wire`].
#[derive(Debug)]
pub struct LinkSimulator {
    wire: Wire,
    conns: [Connection<VecDeque<LinkRequest>>; 2],
}

impl LinkSimulator {
    pub fn new(sim: SimulatorConfig, a: Config, b: Config) -> Result<Self, ConfigError> {
        Ok(Self {
            wire: Wire::new(sim),
            conns: [
                Connection::new(a, VecDeque::new())?,
                Connection::new(b, VecDeque::new())?,
            ],
        })
    }

    pub fn conn(&self, side: Side) -> &Connection<VecDeque<LinkRequest>> {
        &self.conns[side.index()]
    }

    pub fn conn_mut(&mut self, side: Side) -> &mut Connection<VecDeque<LinkRequest>> {
        &mut self.conns[side.index()]
    }

    pub fn wire(&self) -> &Wire {
        &self.wire
    }

    /// Route requests from both sides until neither has any left.  Returns
    /// the number of requests routed.
    pub fn pump(&mut self) -> usize {
        let mut routed = 0;
        loop {
            let mut progressed = false;
            for side in [Side::A, Side::B] {
                let Some(req) = self.conn_mut(side).link_mut().pop_front() else {
                    continue;
                };
                progressed = true;
                routed += 1;
                for (to, completion) in self.wire.route(side, req) {
                    self.conn_mut(to).handle_completion(completion);
                }
            }
            if !progressed {
                return routed;
            }
        }
    }

    /// Take every pending event of `side`.
    pub fn events(&mut self, side: Side) -> Vec<Event> {
        let conn = self.conn_mut(side);
        std::iter::from_fn(|| conn.poll_event()).collect()
    }
}

// ---------------------------------------------------------------------------
// bridge: async driver
// ---------------------------------------------------------------------------

/// Serve two sessions over `wire` until both have stopped.
pub async fn bridge(mut wire: Wire, mut a: LinkDriver, mut b: LinkDriver) {
    let (mut a_open, mut b_open) = (true, true);
    while a_open || b_open {
        let (from, req) = tokio::select! {
            req = a.next_request(), if a_open => match req {
                Some(req) => (Side::A, req),
                None => {
                    a_open = false;
                    continue;
                }
            },
            req = b.next_request(), if b_open => match req {
                Some(req) => (Side::B, req),
                None => {
                    b_open = false;
                    continue;
                }
            },
        };

        for (to, completion) in wire.route(from, req) {
            let driver = match to {
                Side::A => &a,
                Side::B => &b,
            };
            if driver.complete(completion).await.is_err() {
                log::debug!("[sim] {to:?} session gone; completion dropped");
            }
        }
    }
    log::debug!("[sim] bridge stopped: {:?}", wire.stats());
}
