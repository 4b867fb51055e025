//! Entry point for `tinytp`.
//!
//! Runs a complete TinyTP transfer between two simulated devices: discovery,
//! IAS lookup, connect, a segmented data transfer with credit flow control,
//! and disconnect.  `main` owns only process setup (logging, argument
//! parsing); the protocol work happens in the library.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};

use tinytp::pdu::DATA_HEADER_LEN;
use tinytp::simulator::{self, LinkSimulator, Side, SimulatorConfig, Wire};
use tinytp::{Config, ConnError, DisconnectReason, Event, Session, SessionError};

/// Discovery slots used by the demo.
const DISCOVERY_SLOTS: u8 = 6;

/// TinyTP transport over a simulated IrLMP link.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Connect two simulated devices and transfer a payload from A to B.
    Transfer(TransferArgs),
}

#[derive(Args, Debug, Clone)]
struct TransferArgs {
    /// Text repeated to build the payload.
    #[arg(short, long, default_value = "The quick brown fox jumps over the lazy dog. ")]
    message: String,

    /// Total payload size in bytes.
    #[arg(short, long, default_value_t = 4096)]
    size: usize,

    /// Bytes handed to each send request.
    #[arg(long, default_value_t = 256)]
    chunk: usize,

    /// Link data size offered by both devices.
    #[arg(long, default_value_t = 64)]
    data_size: usize,

    /// Largest SDU the receiver reassembles; 0 disables segmentation.
    #[arg(long, default_value_t = 1024)]
    max_sdu: u32,

    /// Receive buffers each side grants at connect time.
    #[arg(long, default_value_t = 7)]
    credit: u32,

    /// Upper bound on credit accepted from the peer.
    #[arg(long, default_value_t = 30)]
    credit_ceiling: u32,

    /// Probability that a link put fails and drops the link.
    #[arg(long, default_value_t = 0.0)]
    put_failure_rate: f64,

    /// Seed for the simulator's fault injection.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Drive both endpoints through async sessions instead of the
    /// synchronous simulator.
    #[arg(long)]
    session: bool,
}

impl TransferArgs {
    fn sender_config(&self) -> Config {
        Config {
            initial_credit: self.credit,
            send_credit_ceiling: self.credit_ceiling,
            ..Config::default()
        }
    }

    fn receiver_config(&self) -> Config {
        Config {
            rx_max_sdu_size: self.max_sdu,
            ..self.sender_config()
        }
    }

    fn sim_config(&self) -> SimulatorConfig {
        let mut sim = SimulatorConfig {
            put_failure_rate: self.put_failure_rate,
            seed: self.seed,
            ..SimulatorConfig::default()
        };
        sim.a.data_size = self.data_size;
        sim.b.data_size = self.data_size;
        sim
    }

    /// Send size that the negotiated connection will accept.
    fn write_size(&self) -> usize {
        let max_seg = self
            .data_size
            .saturating_sub(Config::default().link_header_len + DATA_HEADER_LEN)
            .max(1);
        let limit = if self.max_sdu == 0 {
            max_seg
        } else {
            self.max_sdu as usize
        };
        self.chunk.clamp(1, limit)
    }

    fn payload(&self) -> Result<Vec<u8>> {
        ensure!(!self.message.is_empty(), "message must not be empty");
        ensure!(self.size > 0, "size must be at least 1");
        Ok(self.message.bytes().cycle().take(self.size).collect())
    }
}

/// Outcome of one transfer.
#[derive(Debug)]
struct Report {
    bytes: usize,
    sdus: usize,
    elapsed: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Transfer(args) => {
            log::info!(
                "Transferring {} byte(s) in writes of {} ({} mode)",
                args.size,
                args.write_size(),
                if args.session { "session" } else { "simulator" }
            );
            let report = if args.session {
                run_session(&args).await?
            } else {
                run_simulator(&args)?
            };
            println!(
                "transferred {} byte(s) in {} SDU(s) in {:?}",
                report.bytes, report.sdus, report.elapsed
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Synchronous transfer
// ---------------------------------------------------------------------------

fn run_simulator(args: &TransferArgs) -> Result<Report> {
    let started = Instant::now();
    let payload = args.payload()?;
    let mut sim = LinkSimulator::new(args.sim_config(), args.sender_config(), args.receiver_config())
        .context("invalid configuration")?;

    // Connection setup: B listens, A discovers it and connects.
    sim.conn_mut(Side::B).listen_request()?;
    sim.conn_mut(Side::A).discover_request(DISCOVERY_SLOTS)?;
    sim.pump();
    match sim.events(Side::B).into_iter().next() {
        Some(Event::ConnectIndication(info)) => {
            log::info!("B: connect indication from {} (sap {:#04x})", info.peer, info.sap)
        }
        other => bail!("B: expected a connect indication, got {other:?}"),
    }
    sim.conn_mut(Side::B).connect_response(b"")?;
    sim.pump();
    match sim.events(Side::A).into_iter().next() {
        Some(Event::ConnectConfirm(info)) => log::info!(
            "A: connected to {}, peer max SDU {}",
            info.peer,
            info.max_sdu_size
        ),
        other => bail!("A: expected a connect confirm, got {other:?}"),
    }

    let mut pending: VecDeque<&[u8]> = payload.chunks(args.write_size()).collect();
    let mut received = Vec::with_capacity(payload.len());
    let mut sdus = 0;

    while received.len() < payload.len() {
        let mut progressed = false;
        while let Some(chunk) = pending.front() {
            match sim.conn_mut(Side::A).data_request(chunk) {
                Ok(_) => {
                    pending.pop_front();
                    progressed = true;
                }
                Err(ConnError::QueueFull) => break,
                Err(e) => return Err(e.into()),
            }
        }
        progressed |= sim.pump() > 0;

        for event in sim.events(Side::A) {
            if let Event::DisconnectIndication { reason, .. } = event {
                bail!("A: connection lost ({reason:?})");
            }
        }
        let mut consumed = 0;
        for event in sim.events(Side::B) {
            match event {
                Event::DataIndication { payload, .. } => {
                    consumed += payload.len();
                    sdus += 1;
                    received.extend_from_slice(payload.as_slice());
                }
                Event::DisconnectIndication { reason, .. } => {
                    bail!("B: connection lost ({reason:?})")
                }
                _ => {}
            }
        }
        if consumed > 0 {
            sim.conn_mut(Side::B).return_credit(consumed);
            progressed = true;
        }
        if !progressed {
            bail!(
                "transfer stalled after {} of {} byte(s)",
                received.len(),
                payload.len()
            );
        }
    }

    sim.conn_mut(Side::A).disconnect_request(None);
    sim.pump();
    ensure!(
        sim.events(Side::B).iter().any(|e| matches!(
            e,
            Event::DisconnectIndication {
                reason: DisconnectReason::PeerRequest,
                ..
            }
        )),
        "B: no disconnect indication"
    );

    ensure!(received == payload, "received data differs from sent data");
    log::debug!("simulator stats: {:?}", sim.wire().stats());
    Ok(Report {
        bytes: received.len(),
        sdus,
        elapsed: started.elapsed(),
    })
}

// ---------------------------------------------------------------------------
// Async transfer
// ---------------------------------------------------------------------------

async fn run_session(args: &TransferArgs) -> Result<Report> {
    let started = Instant::now();
    let payload = args.payload()?;
    let (mut a, a_link) = Session::spawn(args.sender_config()).context("invalid configuration")?;
    let (mut b, b_link) = Session::spawn(args.receiver_config()).context("invalid configuration")?;
    let bridge = tokio::spawn(simulator::bridge(Wire::new(args.sim_config()), a_link, b_link));

    b.listen().await?;
    a.discover(DISCOVERY_SLOTS).await?;
    match b.next_event().await {
        Some(Event::ConnectIndication(info)) => {
            log::info!("B: connect indication from {} (sap {:#04x})", info.peer, info.sap)
        }
        other => bail!("B: expected a connect indication, got {other:?}"),
    }
    b.connect_response(b"").await?;
    match a.next_event().await {
        Some(Event::ConnectConfirm(info)) => log::info!("A: connected to {}", info.peer),
        other => bail!("A: expected a connect confirm, got {other:?}"),
    }

    let total = payload.len();
    let receiver = tokio::spawn(async move {
        let mut received = Vec::with_capacity(total);
        let mut sdus = 0;
        while received.len() < total {
            match b.next_event().await {
                Some(Event::DataIndication { payload, .. }) => {
                    sdus += 1;
                    received.extend_from_slice(payload.as_slice());
                    b.return_credit(payload.len()).await?;
                }
                Some(Event::DisconnectIndication { reason, .. }) => {
                    bail!("B: connection lost ({reason:?})")
                }
                Some(_) => {}
                None => bail!("B: session stopped"),
            }
        }
        Ok((b, received, sdus))
    });

    for chunk in payload.chunks(args.write_size()) {
        loop {
            match a.send(chunk).await {
                Ok(_) => break,
                Err(SessionError::Conn(ConnError::QueueFull)) => wait_for_credit(&mut a).await?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    let (mut b, received, sdus) = receiver.await.context("receiver task panicked")??;
    a.disconnect(None).await?;
    loop {
        match b.next_event().await {
            Some(Event::DisconnectIndication { reason, .. }) => {
                log::info!("B: disconnected ({reason:?})");
                break;
            }
            Some(_) => {}
            None => bail!("B: session stopped before disconnect"),
        }
    }

    a.close().await;
    b.close().await;
    bridge.await.context("bridge task panicked")?;

    ensure!(received == payload, "received data differs from sent data");
    Ok(Report {
        bytes: received.len(),
        sdus,
        elapsed: started.elapsed(),
    })
}

/// Block until the peer grants credit.
async fn wait_for_credit(session: &mut Session) -> Result<()> {
    loop {
        match session.next_event().await {
            Some(Event::BackEnable) => return Ok(()),
            Some(Event::DisconnectIndication { reason, .. }) => {
                bail!("A: connection lost ({reason:?})")
            }
            Some(_) => {}
            None => bail!("A: session stopped"),
        }
    }
}
