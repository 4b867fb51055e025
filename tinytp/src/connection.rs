//! The TinyTP connection engine.
//!
//! A [`Connection`] owns the complete state for one TinyTP session:
//!
//! ```text
//!  client requests                               Event queue (poll_event)
//!      │ data_request / return_credit / ...             ▲
//!      ▼                                                │
//!  ┌────────────────────────── Connection ──────────────┴──────────┐
//!  │  tx WorkQueue ──┐                          ┌── rx WorkQueue   │
//!  │                 ├──▶  drain (fixed point) ◀┤                  │
//!  │  FlowController ┘            │             └ ReassemblyBuffer │
//!  └──────────────────────────────┼───────────────────────────────┘
//!           Link requests (put, get, ...) ▼     ▲ LinkCompletion
//!                                   lower layer (LSAP)
//! ```
//!
//! Every entry point runs to completion without blocking.  Callers must
//! serialise them (one thread, one task, or one lock); the engine itself has
//! no internal locking.  After each request and each completion the engine
//! runs [`Connection::drain`], which keeps advancing both queues until a full
//! pass changes nothing.
//!
//! Client indications never run inside `drain`: they are queued as
//! [`Event`]s and the client picks them up with [`Connection::poll_event`].

use std::collections::VecDeque;

use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::event::{ConnectInfo, DeliveryStatus, DisconnectReason, Event};
use crate::flow::{CreditLedger, FlowController};
use crate::link::{
    ConnectConfirm, DeviceAddress, DiscoveryLog, Link, LinkCompletion, LinkError,
    ListenIndication, Qos,
};
use crate::pdu::{self, ConnectParams, DataHeader, DATA_HEADER_LEN};
use crate::reassembly::ReassemblyBuffer;
use crate::segment::Segment;
use crate::state::State;
use crate::work_queue::{WorkItem, WorkQueue};

/// Requests rejected synchronously.  Nothing reaches the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    #[error("not connected")]
    NotConnected,
    #[error("empty payload")]
    EmptyPayload,
    #[error("SDU of {len} byte(s) exceeds limit of {max}")]
    SduTooLarge { len: usize, max: usize },
    #[error("transmit queue full")]
    QueueFull,
    #[error("request not valid in state {0}")]
    BadState(State),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One TinyTP endpoint running on link handle `L`.
#[derive(Debug)]
pub struct Connection<L: Link> {
    config: Config,
    state: State,
    link: L,

    flow: FlowController,
    ledger: CreditLedger,
    tx_queue: WorkQueue,
    rx_queue: WorkQueue,
    reassembly: Option<ReassemblyBuffer>,

    peer: Option<DeviceAddress>,
    peer_sap: u8,
    /// Largest payload per data PDU.
    max_seg_size: usize,
    /// Largest SDU the peer reassembles; 0 = SAR disabled outbound.
    tx_max_sdu_size: u32,
    /// Largest SDU we reassemble; 0 = SAR disabled inbound.
    rx_max_sdu_size: u32,

    discover_pending: bool,
    accept_sent: bool,
    read_pending: bool,
    puts_in_flight: usize,

    events: VecDeque<Event>,
}

impl<L: Link> Connection<L> {
    /// Create an idle connection that issues link requests on `link`.
    pub fn new(config: Config, link: L) -> Result<Self, ConfigError> {
        config.validate()?;
        let tx_queue = WorkQueue::new(config.tx_queue_limit);
        let rx_queue = WorkQueue::new(config.rx_queue_limit);
        Ok(Self {
            flow: new_flow(&config),
            rx_max_sdu_size: config.rx_max_sdu_size,
            config,
            state: State::Idle,
            link,
            ledger: CreditLedger::default(),
            tx_queue,
            rx_queue,
            reassembly: None,
            peer: None,
            peer_sap: 0,
            max_seg_size: 0,
            tx_max_sdu_size: 0,
            discover_pending: false,
            accept_sent: false,
            read_pending: false,
            puts_in_flight: 0,
            events: VecDeque::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    pub fn tx_queue(&self) -> &WorkQueue {
        &self.tx_queue
    }

    pub fn rx_queue(&self) -> &WorkQueue {
        &self.rx_queue
    }

    pub fn max_seg_size(&self) -> usize {
        self.max_seg_size
    }

    pub fn tx_max_sdu_size(&self) -> u32 {
        self.tx_max_sdu_size
    }

    pub fn rx_max_sdu_size(&self) -> u32 {
        self.rx_max_sdu_size
    }

    /// Peer device and LSAP selector, once known.
    pub fn peer(&self) -> Option<(DeviceAddress, u8)> {
        self.peer.map(|addr| (addr, self.peer_sap))
    }

    pub fn is_discover_pending(&self) -> bool {
        self.discover_pending
    }

    /// `true` while a read buffer is posted with the link.
    pub fn is_read_pending(&self) -> bool {
        self.read_pending
    }

    /// Data PDUs handed to the link whose put has not completed.
    pub fn puts_in_flight(&self) -> usize {
        self.puts_in_flight
    }

    /// `true` while fragments of an SDU are being collected.
    pub fn is_reassembling(&self) -> bool {
        self.reassembly.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// `true` once a disconnect waits behind queued data.  No further sends
    /// are accepted.
    pub fn is_disconnect_queued(&self) -> bool {
        !self.tx_queue.iter().all(WorkItem::is_data)
    }

    /// Delivered packets the client has not yet reported consumed.
    pub fn unreturned_packets(&self) -> usize {
        self.ledger.outstanding()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Take the oldest pending client indication.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // -----------------------------------------------------------------------
    // Client requests
    // -----------------------------------------------------------------------

    /// Start discovery; the connection proceeds to lookup and connect on
    /// its own.  A second call while discovering does nothing.
    ///
    /// A discovery abandoned by [`Connection::disconnect_request`] is still
    /// outstanding with the link.  A new request adopts it instead of issuing
    /// another, and its result drives the new attempt.
    pub fn discover_request(&mut self, slots: u8) -> Result<(), ConnError> {
        match self.state {
            State::Idle => {}
            State::Discovering => {
                log::debug!("[ttp] discovery already pending");
                return Ok(());
            }
            state => return Err(ConnError::BadState(state)),
        }
        self.reset_session();
        self.state = State::Discovering;
        if self.discover_pending {
            log::debug!("[ttp] adopting outstanding discovery");
            return Ok(());
        }
        self.discover_pending = true;
        log::debug!("[ttp] → DISCOVER slots={slots}");
        self.link.discover(slots);
        Ok(())
    }

    /// Connect straight to LSAP `sap` on `addr`.
    pub fn connect_request(
        &mut self,
        addr: DeviceAddress,
        sap: u8,
        user_data: &[u8],
    ) -> Result<(), ConnError> {
        if self.state != State::Idle {
            return Err(ConnError::BadState(self.state));
        }
        self.reset_session();
        self.peer = Some(addr);
        self.send_connect(addr, sap, user_data);
        Ok(())
    }

    /// Wait for a peer to connect.  The peer's arrival is reported as
    /// [`Event::ConnectIndication`].
    pub fn listen_request(&mut self) -> Result<(), ConnError> {
        if self.state != State::Idle {
            return Err(ConnError::BadState(self.state));
        }
        self.reset_session();
        self.state = State::Listening;
        log::debug!("[ttp] → LISTEN");
        self.link
            .listen(Segment::new(self.config.max_rx_packet_size));
        Ok(())
    }

    /// Accept the peer announced by [`Event::ConnectIndication`].
    pub fn connect_response(&mut self, user_data: &[u8]) -> Result<(), ConnError> {
        if self.state != State::Accepting || self.accept_sent {
            return Err(ConnError::BadState(self.state));
        }
        self.accept_sent = true;
        let pdu = self.connect_pdu(user_data);
        log::debug!("[ttp] → ACCEPT credit={}", self.flow.remote_credit());
        self.link.accept(pdu);
        Ok(())
    }

    /// Tear the connection down.
    ///
    /// Data already queued goes out first: the disconnect waits at the tail of
    /// the transmit queue, and sends issued after it are refused.  A repeat
    /// request while it waits changes nothing.  When nothing is connected the
    /// request is reported straight back as a [`Event::DisconnectIndication`].
    pub fn disconnect_request(&mut self, user_data: Option<&[u8]>) {
        let user_data = user_data.map(Segment::from);
        match self.state {
            State::Connected if self.is_disconnect_queued() => {
                log::debug!("[ttp] disconnect already queued");
            }
            State::Connected if !self.tx_queue.is_empty() => {
                let item = WorkItem::Disconnect {
                    reason: DisconnectReason::UserRequest,
                    user_data,
                };
                if let Err(WorkItem::Disconnect { user_data, .. }) = self.tx_queue.push(item) {
                    log::warn!("[ttp] tx queue full; disconnecting without draining");
                    self.execute_disconnect(DisconnectReason::UserRequest, user_data);
                }
                self.drain();
            }
            State::Connected | State::Connecting | State::Listening | State::Accepting => {
                self.execute_disconnect(DisconnectReason::UserRequest, user_data);
            }
            State::Discovering | State::LookingUp => {
                log::debug!("[ttp] abandoning {} on user request", self.state);
                self.fail_open(DisconnectReason::UserRequest);
            }
            State::Idle | State::Disconnecting => {
                self.events.push_back(Event::DisconnectIndication {
                    reason: DisconnectReason::UserRequest,
                    user_data: None,
                });
            }
        }
    }

    /// Queue one SDU for transmission and return the number of bytes accepted.
    ///
    /// With segmentation disabled the SDU must fit one PDU.  With segmentation
    /// enabled it is split into `max_seg_size` fragments, each copied out of
    /// `data`, so the caller may reuse `data` as soon as this returns.
    pub fn data_request(&mut self, data: &[u8]) -> Result<usize, ConnError> {
        if data.is_empty() {
            return Err(ConnError::EmptyPayload);
        }
        if self.state != State::Connected || self.is_disconnect_queued() {
            return Err(ConnError::NotConnected);
        }

        let sar = self.tx_max_sdu_size != 0;
        let limit = if sar {
            self.tx_max_sdu_size as usize
        } else {
            self.max_seg_size
        };
        if data.len() > limit {
            return Err(ConnError::SduTooLarge {
                len: data.len(),
                max: limit,
            });
        }

        let fragments = data.len().div_ceil(self.max_seg_size);
        if !self.tx_queue.has_room(fragments) {
            log::warn!(
                "[ttp] tx queue full ({} / {}); refusing {} fragment(s)",
                self.tx_queue.len(),
                self.tx_queue.limit(),
                fragments
            );
            return Err(ConnError::QueueFull);
        }

        for (i, chunk) in data.chunks(self.max_seg_size).enumerate() {
            let item = WorkItem::Data {
                more: i + 1 < fragments,
                payload: pdu::data_segment(chunk),
            };
            if self.tx_queue.push(item).is_err() {
                log::error!("[ttp] tx queue overflowed after room check");
            }
        }
        log::trace!(
            "[ttp] queued SDU len={} fragments={} depth={}",
            data.len(),
            fragments,
            self.tx_queue.len()
        );

        self.drain();
        Ok(data.len())
    }

    /// The client consumed `byte_count` bytes of delivered data; free the
    /// receive buffers they occupied.
    pub fn return_credit(&mut self, byte_count: usize) {
        let freed = self.ledger.consume(byte_count);
        if freed > 0 {
            self.flow.credit_return(freed);
            log::trace!(
                "[ttp] {} buffer(s) freed, avail_credit={}",
                freed,
                self.flow.avail_credit()
            );
        }
        self.drain();
    }

    /// How many writes of up to `max_packet_size` bytes can be accepted now
    /// without queuing behind exhausted credit.
    ///
    /// At least 1 is reported while any credit is left, so a caller writing
    /// large SDUs is never stalled while the link could still make progress.
    pub fn xmit_queue_size(&self, max_packet_size: usize) -> usize {
        if self.state != State::Connected || self.is_disconnect_queued() {
            return 0;
        }
        let free = (self.flow.send_credit() as usize).saturating_sub(self.tx_queue.len());
        if self.tx_max_sdu_size == 0 || self.max_seg_size == 0 {
            return free;
        }
        let per_write = max_packet_size.div_ceil(self.max_seg_size).max(1);
        match free / per_write {
            0 if free > 0 => 1,
            n => n,
        }
    }

    // -----------------------------------------------------------------------
    // Link completions
    // -----------------------------------------------------------------------

    /// Feed one link completion into the engine.
    pub fn handle_completion(&mut self, completion: LinkCompletion) {
        match completion {
            LinkCompletion::Discover(result) => self.on_discover_complete(result),
            LinkCompletion::Lookup(result) => self.on_lookup_complete(result),
            LinkCompletion::Connect(result) => self.on_connect_complete(result),
            LinkCompletion::Listen(result) => self.on_listen_complete(result),
            LinkCompletion::Accept(result) => self.on_accept_complete(result),
            LinkCompletion::Disconnect => self.on_disconnect_complete(),
            LinkCompletion::DisconnectIndication { user_data } => {
                self.on_disconnect_indication(user_data)
            }
            LinkCompletion::Put(result) => self.on_put_complete(result),
            LinkCompletion::Get(result) => self.on_get_complete(result),
        }
    }

    pub fn on_discover_complete(&mut self, result: Result<Vec<DiscoveryLog>, LinkError>) {
        self.discover_pending = false;
        if self.state != State::Discovering {
            log::debug!("[ttp] late discovery result ignored in {}", self.state);
            return;
        }
        let logs = match result {
            Ok(logs) => logs,
            Err(e) => {
                log::warn!("[ttp] discovery failed: {e}");
                return self.fail_open(DisconnectReason::DiscoveryFailed);
            }
        };
        let hints = self.config.service_hints;
        let Some(found) = logs.iter().find(|log| log.hints & hints != 0) else {
            log::warn!("[ttp] {} device(s) found, none offers hints {hints:#06x}", logs.len());
            return self.fail_open(DisconnectReason::NoService);
        };

        log::debug!(
            "[ttp] ← DISCOVER found {} \"{}\"; → LOOKUP",
            found.address,
            found.nickname
        );
        self.peer = Some(found.address);
        self.state = State::LookingUp;
        self.link
            .lookup(&self.config.class_name, &self.config.attr_name, found.address);
    }

    pub fn on_lookup_complete(&mut self, result: Result<u8, LinkError>) {
        if self.state != State::LookingUp {
            log::debug!("[ttp] late lookup result ignored in {}", self.state);
            return;
        }
        match (result, self.peer) {
            (Ok(sap), Some(addr)) => self.send_connect(addr, sap, &[]),
            (Ok(_), None) => self.fail_open(DisconnectReason::LookupFailed),
            (Err(e), _) => {
                log::warn!("[ttp] lookup failed: {e}");
                self.fail_open(DisconnectReason::LookupFailed);
            }
        }
    }

    pub fn on_connect_complete(&mut self, result: Result<ConnectConfirm, LinkError>) {
        if self.state != State::Connecting {
            log::warn!("[ttp] unexpected connect completion in {}", self.state);
            return;
        }
        let ConnectConfirm {
            sap,
            our_qos,
            peer_qos,
            mut pdu,
        } = match result {
            Ok(confirm) => confirm,
            Err(e) => {
                log::warn!("[ttp] connect failed: {e}");
                return self.fail_open(DisconnectReason::ConnectFailed);
            }
        };
        let params = match pdu::decode_connect(&mut pdu) {
            Ok(params) => params,
            Err(e) => {
                log::warn!("[ttp] bad Connect PDU from peer: {e}");
                return self.execute_disconnect(DisconnectReason::ProtocolError, None);
            }
        };

        self.peer_sap = sap;
        self.establish(params, our_qos, peer_qos);
        self.state = State::Connected;
        self.ensure_read_pending();
        log::debug!(
            "[ttp] ← CONNECT confirm send_credit={} max_seg={} tx_max_sdu={}",
            self.flow.send_credit(),
            self.max_seg_size,
            self.tx_max_sdu_size
        );
        let info = self.connect_info(our_qos, peer_qos, pdu);
        self.events.push_back(Event::ConnectConfirm(info));
        self.drain();
    }

    pub fn on_listen_complete(&mut self, result: Result<ListenIndication, LinkError>) {
        if self.state != State::Listening {
            log::warn!("[ttp] unexpected listen completion in {}", self.state);
            return;
        }
        let ListenIndication {
            addr,
            sap,
            our_qos,
            peer_qos,
            mut pdu,
        } = match result {
            Ok(ind) => ind,
            Err(e) => {
                log::warn!("[ttp] listen failed: {e}");
                return self.fail_open(DisconnectReason::ConnectFailed);
            }
        };
        let params = match pdu::decode_connect(&mut pdu) {
            Ok(params) => params,
            Err(e) => {
                log::warn!("[ttp] bad Connect PDU from {addr}: {e}");
                return self.execute_disconnect(DisconnectReason::ProtocolError, None);
            }
        };

        self.peer = Some(addr);
        self.peer_sap = sap;
        self.establish(params, our_qos, peer_qos);
        self.state = State::Accepting;
        self.accept_sent = false;
        log::debug!(
            "[ttp] ← CONNECT indication from {addr} sap={sap} send_credit={}",
            self.flow.send_credit()
        );
        let info = self.connect_info(our_qos, peer_qos, pdu);
        self.events.push_back(Event::ConnectIndication(info));
    }

    pub fn on_accept_complete(&mut self, result: Result<(), LinkError>) {
        if self.state != State::Accepting {
            log::warn!("[ttp] unexpected accept completion in {}", self.state);
            return;
        }
        match result {
            Ok(()) => {
                self.state = State::Connected;
                self.ensure_read_pending();
                log::debug!("[ttp] accept done; connected");
                self.events.push_back(Event::AcceptDone(Ok(())));
                self.drain();
            }
            Err(e) => {
                log::warn!("[ttp] accept failed: {e}");
                self.events.push_back(Event::AcceptDone(Err(e)));
                self.fail_open(DisconnectReason::ConnectFailed);
            }
        }
    }

    /// Our own disconnect reached the link.
    pub fn on_disconnect_complete(&mut self) {
        if self.state == State::Disconnecting {
            self.reset_session();
            self.state = State::Idle;
            log::debug!("[ttp] disconnect complete");
        }
    }

    /// The peer dropped the connection.
    pub fn on_disconnect_indication(&mut self, user_data: Option<Segment>) {
        let was = self.state;
        if was == State::Idle {
            return;
        }
        let flushed = self.tx_queue.len() + self.rx_queue.len();
        self.reset_session();
        self.state = State::Idle;
        log::debug!("[ttp] ← DISCONNECT in {was}; {flushed} queued item(s) flushed");
        if was != State::Disconnecting {
            self.events.push_back(Event::DisconnectIndication {
                reason: DisconnectReason::PeerRequest,
                user_data,
            });
        }
    }

    pub fn on_put_complete(&mut self, result: Result<(), LinkError>) {
        self.puts_in_flight = self.puts_in_flight.saturating_sub(1);
        if let Err(e) = result {
            if self.state == State::Connected {
                return self.link_failure(e);
            }
        }
        self.drain();
    }

    pub fn on_get_complete(&mut self, result: Result<Segment, LinkError>) {
        self.read_pending = false;
        if self.state != State::Connected {
            log::debug!("[ttp:rx] read completion dropped in {}", self.state);
            return;
        }
        match result {
            Ok(pdu) => self.receive_pdu(pdu),
            Err(e) => return self.link_failure(e),
        }
        self.drain();
    }

    // -----------------------------------------------------------------------
    // drain
    // -----------------------------------------------------------------------

    /// Advance both queues until a whole pass makes no progress.
    ///
    /// Each pass may emit one dataless credit PDU, sends queued data while
    /// send credit lasts, and delivers every queued inbound fragment.  Every
    /// productive pass removes at least one queue item or moves credit out of
    /// `avail`, so the loop terminates.
    fn drain(&mut self) {
        loop {
            let mut progressed = self.send_dataless();
            progressed |= self.drain_tx();
            progressed |= self.drain_rx();
            if !progressed {
                break;
            }
        }
        self.ensure_read_pending();
    }

    fn send_dataless(&mut self) -> bool {
        if self.state != State::Connected {
            return false;
        }
        let tx_idle = self.tx_queue.is_empty() || self.flow.send_credit() == 0;
        if !self.flow.wants_dataless(tx_idle) {
            return false;
        }
        let credit = self.flow.take_advertisement();
        log::debug!("[ttp] → DATALESS credit={credit}");
        self.put(pdu::encode_data(DataHeader { more: false, credit }, &[]));
        true
    }

    fn drain_tx(&mut self) -> bool {
        let mut progressed = false;
        while self.state == State::Connected {
            match self.tx_queue.front() {
                None => break,
                Some(WorkItem::Data { .. }) if self.flow.send_credit() == 0 => {
                    log::trace!("[ttp] out of send credit, {} queued", self.tx_queue.len());
                    break;
                }
                Some(_) => {}
            }
            let Some(item) = self.tx_queue.pop() else {
                break;
            };
            progressed = true;

            match item {
                WorkItem::Disconnect { reason, user_data } => {
                    self.execute_disconnect(reason, user_data);
                }
                WorkItem::Data { more, mut payload } => {
                    self.flow.consume_send_credit();
                    let credit = self.flow.take_advertisement();
                    if let Err(e) = pdu::write_data_header(&mut payload, DataHeader { more, credit }) {
                        log::error!("[ttp] dropping fragment: {e}");
                        continue;
                    }
                    log::debug!(
                        "[ttp] → DATA len={} more={} credit={} send_credit={}",
                        payload.len() - DATA_HEADER_LEN,
                        more,
                        credit,
                        self.flow.send_credit()
                    );
                    self.put(payload);
                }
            }
        }
        progressed
    }

    fn drain_rx(&mut self) -> bool {
        let mut progressed = false;
        while let Some(item) = self.rx_queue.pop() {
            progressed = true;
            match item {
                WorkItem::Data { more, payload } => self.deliver(more, payload),
                WorkItem::Disconnect { .. } => {
                    log::error!("[ttp:rx] disconnect item on receive queue ignored");
                }
            }
        }
        progressed
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Parse one inbound PDU and queue its payload for delivery.
    fn receive_pdu(&mut self, mut seg: Segment) {
        let header = match pdu::decode_data(&mut seg) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("[ttp:rx] dropping malformed PDU: {e}");
                return;
            }
        };

        if self.flow.on_peer_credit(header.credit) {
            self.events.push_back(Event::BackEnable);
        }
        if seg.is_empty() {
            log::trace!("[ttp:rx] ← DATALESS credit={}", header.credit);
            return;
        }
        if !self.flow.on_data_received() {
            log::warn!("[ttp:rx] peer sent without credit");
        }
        log::debug!(
            "[ttp:rx] ← DATA len={} more={} credit={} send_credit={}",
            seg.len(),
            header.more,
            header.credit,
            self.flow.send_credit()
        );

        let item = WorkItem::Data {
            more: header.more,
            payload: seg,
        };
        if self.rx_queue.push(item).is_err() {
            log::warn!("[ttp:rx] rx queue full; dropping fragment");
            self.flow.credit_return(1);
        }
    }

    /// Hand one fragment to the client, directly or through reassembly.
    ///
    /// A non-terminal fragment's receive buffer is free once its bytes are
    /// copied into the reassembly buffer, so its credit goes back at once.
    /// The terminal fragment's credit stays with the delivered SDU until the
    /// client reports it consumed.
    fn deliver(&mut self, more: bool, payload: Segment) {
        if self.rx_max_sdu_size == 0 || (!more && self.reassembly.is_none()) {
            return self.indicate_data(payload, DeliveryStatus::Complete);
        }

        let capacity = self.rx_max_sdu_size as usize;
        let buffer = self
            .reassembly
            .get_or_insert_with(|| ReassemblyBuffer::new(capacity));
        if let Err(e) = buffer.append(payload.as_slice()) {
            log::warn!(
                "[ttp:rx] {e}; dropping SDU after {} fragment(s)",
                buffer.fragments().len() + 1
            );
            self.reassembly = None;
            self.flow.credit_return(1);
            return;
        }

        if more {
            self.flow.credit_return(1);
        } else if let Some(buffer) = self.reassembly.take() {
            let (sdu, fragments) = buffer.finish();
            let status = DeliveryStatus::Reassembled {
                fragments: fragments.len(),
            };
            self.indicate_data(sdu, status);
        }
    }

    fn indicate_data(&mut self, payload: Segment, status: DeliveryStatus) {
        self.ledger.record(payload.len());
        self.events
            .push_back(Event::DataIndication { payload, status });
        self.ensure_read_pending();
    }

    /// Keep exactly one read posted while connected.
    fn ensure_read_pending(&mut self) {
        if self.state == State::Connected && !self.read_pending {
            self.read_pending = true;
            self.link.get(Segment::new(self.config.max_rx_packet_size));
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn put(&mut self, pdu: Segment) {
        self.puts_in_flight += 1;
        self.link.put(pdu);
    }

    fn connect_pdu(&mut self, user_data: &[u8]) -> Segment {
        let params = ConnectParams {
            initial_credit: self.flow.take_advertisement(),
            max_sdu_size: self.rx_max_sdu_size,
        };
        pdu::encode_connect(params, user_data)
    }

    fn send_connect(&mut self, addr: DeviceAddress, sap: u8, user_data: &[u8]) {
        self.peer_sap = sap;
        self.state = State::Connecting;
        let pdu = self.connect_pdu(user_data);
        log::debug!(
            "[ttp] → CONNECT {addr} sap={sap} credit={} rx_max_sdu={}",
            self.flow.remote_credit(),
            self.rx_max_sdu_size
        );
        self.link.connect(addr, sap, pdu);
    }

    /// Apply the peer's Connect PDU and the negotiated link parameters.
    fn establish(&mut self, params: ConnectParams, our_qos: Qos, peer_qos: Qos) {
        self.flow.set_send_credit(params.initial_credit);
        self.tx_max_sdu_size = params.max_sdu_size;
        self.max_seg_size = our_qos
            .data_size
            .min(peer_qos.data_size)
            .saturating_sub(self.config.link_header_len + DATA_HEADER_LEN)
            .max(1);
    }

    fn connect_info(&self, our_qos: Qos, peer_qos: Qos, user_data: Segment) -> ConnectInfo {
        ConnectInfo {
            peer: self.peer.unwrap_or_default(),
            sap: self.peer_sap,
            our_qos,
            peer_qos,
            max_sdu_size: self.tx_max_sdu_size,
            user_data,
        }
    }

    /// Flush everything and forward a disconnect to the link.
    fn execute_disconnect(&mut self, reason: DisconnectReason, user_data: Option<Segment>) {
        let flushed = self.tx_queue.clear() + self.rx_queue.clear();
        self.reassembly = None;
        self.read_pending = false;
        self.state = State::Disconnecting;
        log::debug!("[ttp] → DISCONNECT ({reason:?}); {flushed} queued item(s) flushed");
        self.link.disconnect(user_data);
        self.events.push_back(Event::DisconnectIndication {
            reason,
            user_data: None,
        });
    }

    /// Give up on a connection that never came up.
    fn fail_open(&mut self, reason: DisconnectReason) {
        self.reset_session();
        self.state = State::Idle;
        self.events.push_back(Event::DisconnectIndication {
            reason,
            user_data: None,
        });
    }

    /// The link failed under an established connection.
    fn link_failure(&mut self, e: LinkError) {
        log::warn!("[ttp] link failure: {e}; dropping connection");
        self.reset_session();
        self.state = State::Idle;
        self.events.push_back(Event::DisconnectIndication {
            reason: DisconnectReason::LinkFailure,
            user_data: None,
        });
    }

    /// Return all per-session state to its pre-connect values.
    fn reset_session(&mut self) {
        self.flow = new_flow(&self.config);
        self.ledger.clear();
        self.tx_queue.clear();
        self.rx_queue.clear();
        self.reassembly = None;
        self.peer = None;
        self.peer_sap = 0;
        self.max_seg_size = 0;
        self.tx_max_sdu_size = 0;
        self.rx_max_sdu_size = self.config.rx_max_sdu_size;
        self.accept_sent = false;
        self.read_pending = false;
    }
}

fn new_flow(config: &Config) -> FlowController {
    FlowController::new(config.initial_credit, config.send_credit_ceiling)
        .with_thresholds(config.low_remote_credit, config.surplus_credit)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
