//! Shared helpers for the integration tests.

#![allow(dead_code)]

use tinytp::simulator::{LinkSimulator, Side, SimulatorConfig};
use tinytp::{Config, DisconnectReason, Event};

/// Opt into log output with `RUST_LOG=debug cargo test`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Bring up a connection from A to B through discovery, lookup and connect.
pub fn connected_pair(sim: SimulatorConfig, a: Config, b: Config) -> LinkSimulator {
    init_logging();
    let mut sim = LinkSimulator::new(sim, a, b).expect("valid configuration");
    sim.conn_mut(Side::B).listen_request().expect("listen");
    sim.conn_mut(Side::A).discover_request(6).expect("discover");
    sim.pump();
    assert!(
        matches!(sim.events(Side::B).as_slice(), [Event::ConnectIndication(_)]),
        "B should see exactly one connect indication"
    );
    sim.conn_mut(Side::B).connect_response(b"").expect("connect response");
    sim.pump();
    assert!(
        matches!(sim.events(Side::A).as_slice(), [Event::ConnectConfirm(_)]),
        "A should see exactly one connect confirm"
    );
    let _ = sim.events(Side::B);
    assert!(sim.conn(Side::A).is_connected());
    assert!(sim.conn(Side::B).is_connected());
    sim
}

/// Payloads of every `DataIndication` in `events`.
pub fn payloads(events: &[Event]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::DataIndication { payload, .. } => Some(payload.as_slice().to_vec()),
            _ => None,
        })
        .collect()
}

/// Reason of the first `DisconnectIndication` in `events`.
pub fn disconnect_reason(events: &[Event]) -> Option<DisconnectReason> {
    events.iter().find_map(|e| match e {
        Event::DisconnectIndication { reason, .. } => Some(*reason),
        _ => None,
    })
}
