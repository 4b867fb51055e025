//! Integration tests for connection setup and teardown.
//!
//! Two engines run back to back on the in-memory `LinkSimulator`; each test
//! drives one of the ways a connection comes up (or fails to) and checks
//! what both clients were told.

mod common;

use tinytp::simulator::{LinkSimulator, Side, SimulatorConfig};
use tinytp::state::State;
use tinytp::{Config, DeviceAddress, DisconnectReason, Event};

use common::{connected_pair, disconnect_reason, init_logging};

fn simulator(sim: SimulatorConfig) -> LinkSimulator {
    init_logging();
    LinkSimulator::new(sim, Config::default(), Config::default()).unwrap()
}

// ---------------------------------------------------------------------------
// Successful setup
// ---------------------------------------------------------------------------

/// Discovery, lookup and connect bring both sides to `Connected` with the
/// credit each side advertised.
#[test]
fn discovery_connect_reaches_connected() {
    let sim = connected_pair(SimulatorConfig::default(), Config::default(), Config::default());

    let a = sim.conn(Side::A);
    let b = sim.conn(Side::B);
    assert_eq!(a.state(), State::Connected);
    assert_eq!(b.state(), State::Connected);
    assert_eq!(a.flow().send_credit(), 7);
    assert_eq!(b.flow().send_credit(), 7);
    // 64-byte data size, 2-byte link header, 1-byte TinyTP header.
    assert_eq!(a.max_seg_size(), 61);
    assert_eq!(b.max_seg_size(), 61);
    assert!(a.is_read_pending());
    assert!(b.is_read_pending());
    assert_eq!(a.peer(), Some((DeviceAddress(0x0b0b), 0x11)));
    assert_eq!(b.peer(), Some((DeviceAddress(0x0a0a), 0x10)));
}

/// A direct connect carries user data both ways.
#[test]
fn connect_carries_user_data() {
    let mut sim = simulator(SimulatorConfig::default());
    sim.conn_mut(Side::B).listen_request().unwrap();
    sim.pump();
    sim.conn_mut(Side::A)
        .connect_request(DeviceAddress(0x0b0b), 0x11, b"hello")
        .unwrap();
    sim.pump();

    match sim.events(Side::B).as_slice() {
        [Event::ConnectIndication(info)] => {
            assert_eq!(info.peer, DeviceAddress(0x0a0a));
            assert_eq!(info.sap, 0x10);
            assert_eq!(info.user_data.as_slice(), b"hello");
        }
        other => panic!("unexpected events at B: {other:?}"),
    }

    sim.conn_mut(Side::B).connect_response(b"welcome").unwrap();
    sim.pump();
    match sim.events(Side::A).as_slice() {
        [Event::ConnectConfirm(info)] => assert_eq!(info.user_data.as_slice(), b"welcome"),
        other => panic!("unexpected events at A: {other:?}"),
    }
    assert_eq!(sim.events(Side::B), vec![Event::AcceptDone(Ok(()))]);
    assert!(sim.conn(Side::A).is_connected());
}

/// The segment size comes from the smaller of the two offered data sizes.
#[test]
fn segment_size_uses_smaller_data_size() {
    let mut cfg = SimulatorConfig::default();
    cfg.b.data_size = 20;
    let sim = connected_pair(cfg, Config::default(), Config::default());
    assert_eq!(sim.conn(Side::A).max_seg_size(), 17);
    assert_eq!(sim.conn(Side::B).max_seg_size(), 17);
}

/// Each side learns the other's reassembly limit from its Connect PDU.
#[test]
fn max_sdu_size_is_exchanged() {
    let b = Config {
        rx_max_sdu_size: 100,
        ..Config::default()
    };
    let sim = connected_pair(SimulatorConfig::default(), Config::default(), b);
    assert_eq!(sim.conn(Side::A).tx_max_sdu_size(), 100);
    assert_eq!(sim.conn(Side::B).tx_max_sdu_size(), 0);
}

/// Initial credit above the ceiling is clamped.
#[test]
fn generous_peer_credit_is_clamped() {
    let b = Config {
        initial_credit: 100,
        ..Config::default()
    };
    let sim = connected_pair(SimulatorConfig::default(), Config::default(), b);
    assert_eq!(sim.conn(Side::A).flow().send_credit(), 30);
}

// ---------------------------------------------------------------------------
// Failed setup
// ---------------------------------------------------------------------------

#[test]
fn discovery_without_service_reports_no_service() {
    let mut cfg = SimulatorConfig::default();
    cfg.b.hints = 0x0001;
    let mut sim = simulator(cfg);
    sim.conn_mut(Side::B).listen_request().unwrap();
    sim.conn_mut(Side::A).discover_request(6).unwrap();
    sim.pump();

    assert_eq!(
        disconnect_reason(&sim.events(Side::A)),
        Some(DisconnectReason::NoService)
    );
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
    assert_eq!(sim.conn(Side::B).state(), State::Listening);
}

#[test]
fn lookup_fails_when_peer_not_listening() {
    let mut sim = simulator(SimulatorConfig::default());
    sim.conn_mut(Side::A).discover_request(6).unwrap();
    sim.pump();
    assert_eq!(
        disconnect_reason(&sim.events(Side::A)),
        Some(DisconnectReason::LookupFailed)
    );
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
}

#[test]
fn connect_to_wrong_sap_is_refused() {
    let mut sim = simulator(SimulatorConfig::default());
    sim.conn_mut(Side::B).listen_request().unwrap();
    sim.conn_mut(Side::A)
        .connect_request(DeviceAddress(0x0b0b), 0x42, b"")
        .unwrap();
    sim.pump();
    assert_eq!(
        disconnect_reason(&sim.events(Side::A)),
        Some(DisconnectReason::ConnectFailed)
    );
    assert!(sim.events(Side::B).is_empty());
    assert_eq!(sim.conn(Side::B).state(), State::Listening);
}

/// The caller may give up while a connect indication awaits its response.
#[test]
fn initiator_abandons_before_accept() {
    let mut sim = simulator(SimulatorConfig::default());
    sim.conn_mut(Side::B).listen_request().unwrap();
    sim.conn_mut(Side::A).discover_request(6).unwrap();
    sim.pump();
    assert_eq!(sim.conn(Side::B).state(), State::Accepting);

    sim.conn_mut(Side::A).disconnect_request(None);
    sim.pump();
    assert_eq!(
        disconnect_reason(&sim.events(Side::A)),
        Some(DisconnectReason::UserRequest)
    );
    assert_eq!(
        disconnect_reason(&sim.events(Side::B)),
        Some(DisconnectReason::PeerRequest)
    );
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
    assert_eq!(sim.conn(Side::B).state(), State::Idle);
}

/// A discovery abandoned before its result arrives is picked up by the next
/// discover request, so the connection still comes up.
#[test]
fn abandoned_discovery_then_rediscover_connects() {
    let mut sim = simulator(SimulatorConfig::default());
    sim.conn_mut(Side::B).listen_request().unwrap();
    sim.conn_mut(Side::A).discover_request(6).unwrap();
    sim.conn_mut(Side::A).disconnect_request(None);
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
    assert_eq!(
        disconnect_reason(&sim.events(Side::A)),
        Some(DisconnectReason::UserRequest)
    );

    sim.conn_mut(Side::A).discover_request(6).unwrap();
    assert_eq!(sim.conn(Side::A).state(), State::Discovering);
    sim.pump();
    assert!(matches!(
        sim.events(Side::B).as_slice(),
        [Event::ConnectIndication(_)]
    ));

    sim.conn_mut(Side::B).connect_response(b"").unwrap();
    sim.pump();
    assert!(matches!(
        sim.events(Side::A).as_slice(),
        [Event::ConnectConfirm(_)]
    ));
    assert!(sim.conn(Side::A).is_connected());
    assert!(sim.conn(Side::B).is_connected());
}

/// The result of an abandoned discovery changes nothing once it lands.
#[test]
fn abandoned_discovery_result_is_dropped() {
    let mut sim = simulator(SimulatorConfig::default());
    sim.conn_mut(Side::B).listen_request().unwrap();
    sim.conn_mut(Side::A).discover_request(6).unwrap();
    sim.conn_mut(Side::A).disconnect_request(None);
    let _ = sim.events(Side::A);

    sim.pump();
    assert!(sim.events(Side::A).is_empty());
    assert!(sim.events(Side::B).is_empty());
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
    assert_eq!(sim.conn(Side::B).state(), State::Listening);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn disconnect_carries_user_data_to_peer() {
    let mut sim = connected_pair(SimulatorConfig::default(), Config::default(), Config::default());
    sim.conn_mut(Side::B).disconnect_request(Some(&b"bye"[..]));
    sim.pump();

    assert_eq!(
        sim.events(Side::B),
        vec![Event::DisconnectIndication {
            reason: DisconnectReason::UserRequest,
            user_data: None,
        }]
    );
    match sim.events(Side::A).as_slice() {
        [Event::DisconnectIndication {
            reason: DisconnectReason::PeerRequest,
            user_data: Some(data),
        }] => assert_eq!(data.as_slice(), b"bye"),
        other => panic!("unexpected events at A: {other:?}"),
    }
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
    assert_eq!(sim.conn(Side::B).state(), State::Idle);
}

/// A connection can be brought up again after a disconnect.
#[test]
fn reconnect_after_disconnect() {
    let mut sim = connected_pair(SimulatorConfig::default(), Config::default(), Config::default());
    sim.conn_mut(Side::A).disconnect_request(None);
    sim.pump();
    let _ = sim.events(Side::A);
    let _ = sim.events(Side::B);

    sim.conn_mut(Side::B).listen_request().unwrap();
    sim.conn_mut(Side::A).discover_request(6).unwrap();
    sim.pump();
    sim.conn_mut(Side::B).connect_response(b"").unwrap();
    sim.pump();
    assert!(sim.conn(Side::A).is_connected());
    assert!(sim.conn(Side::B).is_connected());
    assert_eq!(sim.conn(Side::A).flow().send_credit(), 7);
}
