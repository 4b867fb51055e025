//! Integration tests for data transfer: segmentation and reassembly, credit
//! flow control, disconnect ordering, and a seeded randomized workload.

mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tinytp::simulator::{LinkSimulator, Side, SimulatorConfig};
use tinytp::state::State;
use tinytp::{Config, ConnError, DeliveryStatus, DisconnectReason, Event};

use common::{connected_pair, disconnect_reason, payloads};

/// Data size that yields a 4-byte max segment (2-byte link header).
const SMALL_DATA_SIZE: usize = 7;

fn small_link() -> SimulatorConfig {
    let mut sim = SimulatorConfig::default();
    sim.a.data_size = SMALL_DATA_SIZE;
    sim.b.data_size = SMALL_DATA_SIZE;
    sim
}

fn receiver(rx_max_sdu_size: u32, initial_credit: u32) -> Config {
    Config {
        rx_max_sdu_size,
        initial_credit,
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Segmentation and reassembly
// ---------------------------------------------------------------------------

/// A 9-byte SDU over 4-byte segments arrives as one reassembled SDU.
#[test]
fn sdu_is_segmented_and_reassembled() {
    let mut sim = connected_pair(small_link(), Config::default(), receiver(10, 7));
    assert_eq!(sim.conn(Side::A).max_seg_size(), 4);

    assert_eq!(sim.conn_mut(Side::A).data_request(b"ABCDEFGHI"), Ok(9));
    sim.pump();

    match sim.events(Side::B).as_slice() {
        [Event::DataIndication { payload, status }] => {
            assert_eq!(payload.as_slice(), b"ABCDEFGHI");
            assert_eq!(*status, DeliveryStatus::Reassembled { fragments: 3 });
        }
        other => panic!("unexpected events at B: {other:?}"),
    }
    assert!(!sim.conn(Side::B).is_reassembling());
}

#[test]
fn oversized_sdu_is_rejected_before_queuing() {
    let mut sim = connected_pair(small_link(), Config::default(), receiver(10, 7));
    assert_eq!(
        sim.conn_mut(Side::A).data_request(b"ABCDEFGHIJK"),
        Err(ConnError::SduTooLarge { len: 11, max: 10 })
    );
    assert!(sim.conn(Side::A).tx_queue().is_empty());
}

/// Without SAR every SDU must fit one segment and is delivered as is.
#[test]
fn sar_disabled_delivers_single_segments() {
    let mut sim = connected_pair(small_link(), Config::default(), Config::default());
    assert_eq!(sim.conn(Side::A).tx_max_sdu_size(), 0);
    assert_eq!(
        sim.conn_mut(Side::A).data_request(b"ABCDE"),
        Err(ConnError::SduTooLarge { len: 5, max: 4 })
    );
    sim.conn_mut(Side::A).data_request(b"ABCD").unwrap();
    sim.pump();
    match sim.events(Side::B).as_slice() {
        [Event::DataIndication { payload, status }] => {
            assert_eq!(payload.as_slice(), b"ABCD");
            assert_eq!(*status, DeliveryStatus::Complete);
        }
        other => panic!("unexpected events at B: {other:?}"),
    }
}

/// SDUs of many fragments get through even when the receiver grants far
/// less credit than one SDU needs.
#[test]
fn large_sdus_flow_with_little_credit() {
    let mut link = SimulatorConfig::default();
    link.a.data_size = 20;
    link.b.data_size = 20;
    let mut sim = connected_pair(link, Config::default(), receiver(200, 2));
    assert_eq!(sim.conn(Side::A).max_seg_size(), 17);
    let sdus: Vec<Vec<u8>> = (0..3u8).map(|i| vec![b'a' + i; 150]).collect();
    for sdu in &sdus {
        sim.conn_mut(Side::A).data_request(sdu).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..100 {
        sim.pump();
        let events = sim.events(Side::B);
        let got = payloads(&events);
        let bytes: usize = got.iter().map(Vec::len).sum();
        received.extend(got);
        if bytes > 0 {
            sim.conn_mut(Side::B).return_credit(bytes);
        }
        if received.len() == sdus.len() {
            break;
        }
    }
    assert_eq!(received, sdus);
}

// ---------------------------------------------------------------------------
// Credit flow control
// ---------------------------------------------------------------------------

/// The sender never transmits more data PDUs than the receiver granted, and
/// returned credit restarts the flow.
#[test]
fn sender_stops_at_granted_credit() {
    let mut sim = connected_pair(SimulatorConfig::default(), Config::default(), receiver(0, 3));
    for i in 0..10u8 {
        sim.conn_mut(Side::A).data_request(&[b'0' + i]).unwrap();
    }
    sim.pump();

    let first = payloads(&sim.events(Side::B));
    assert_eq!(first, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
    assert_eq!(sim.conn(Side::A).flow().send_credit(), 0);
    assert_eq!(sim.conn(Side::A).tx_queue().len(), 7);
    assert_eq!(sim.conn(Side::B).flow().remote_credit(), 0);

    // Consuming the three packets frees three buffers; B advertises them
    // in a dataless PDU and A resumes.
    sim.conn_mut(Side::B).return_credit(3);
    sim.pump();
    assert!(sim.events(Side::A).contains(&Event::BackEnable));
    let second = payloads(&sim.events(Side::B));
    assert_eq!(second, vec![b"3".to_vec(), b"4".to_vec(), b"5".to_vec()]);
    assert_eq!(sim.conn(Side::A).tx_queue().len(), 4);
}

/// Partial consumption returns credit only for whole packets.
#[test]
fn partial_consumption_holds_credit() {
    let mut sim = connected_pair(SimulatorConfig::default(), Config::default(), receiver(0, 2));
    sim.conn_mut(Side::A).data_request(b"hello").unwrap();
    sim.conn_mut(Side::A).data_request(b"world").unwrap();
    sim.conn_mut(Side::A).data_request(b"again").unwrap();
    sim.pump();
    assert_eq!(payloads(&sim.events(Side::B)).len(), 2);

    sim.conn_mut(Side::B).return_credit(3);
    sim.pump();
    assert!(payloads(&sim.events(Side::B)).is_empty());
    assert_eq!(sim.conn(Side::B).unreturned_packets(), 2);

    sim.conn_mut(Side::B).return_credit(2);
    sim.pump();
    assert_eq!(payloads(&sim.events(Side::B)), vec![b"again".to_vec()]);
}

/// The transmit queue bound is enforced per SDU, never splitting one.
#[test]
fn queue_limit_rejects_whole_sdu() {
    let a = Config {
        tx_queue_limit: 4,
        ..Config::default()
    };
    let mut sim = connected_pair(small_link(), a, receiver(64, 1));
    // One fragment goes out on the single credit, three stay queued.
    sim.conn_mut(Side::A).data_request(b"0123456789abcdef").unwrap();
    assert_eq!(sim.conn(Side::A).tx_queue().len(), 3);
    assert_eq!(
        sim.conn_mut(Side::A).data_request(b"ABCDEFGH"),
        Err(ConnError::QueueFull)
    );
    assert_eq!(sim.conn_mut(Side::A).data_request(b"ABCD"), Ok(4));
    assert_eq!(sim.conn(Side::A).tx_queue().len(), 4);
}

// ---------------------------------------------------------------------------
// Disconnect ordering
// ---------------------------------------------------------------------------

/// Data queued before a disconnect is delivered before the disconnect.
#[test]
fn queued_data_precedes_disconnect() {
    let mut sim = connected_pair(SimulatorConfig::default(), Config::default(), receiver(0, 1));
    sim.conn_mut(Side::A).data_request(b"first").unwrap();
    sim.conn_mut(Side::A).data_request(b"second").unwrap();
    sim.conn_mut(Side::A).disconnect_request(None);
    assert!(sim.conn(Side::A).is_connected());

    sim.pump();
    let events = sim.events(Side::B);
    assert_eq!(payloads(&events), vec![b"first".to_vec()]);
    assert_eq!(disconnect_reason(&events), None);

    sim.conn_mut(Side::B).return_credit(5);
    sim.pump();
    let events = sim.events(Side::B);
    assert_eq!(payloads(&events), vec![b"second".to_vec()]);
    assert_eq!(disconnect_reason(&events), Some(DisconnectReason::PeerRequest));
    assert!(matches!(
        events.last(),
        Some(Event::DisconnectIndication { .. })
    ));

    assert_eq!(
        disconnect_reason(&sim.events(Side::A)),
        Some(DisconnectReason::UserRequest)
    );
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
    assert_eq!(sim.conn(Side::B).state(), State::Idle);
}

/// Once a disconnect is queued behind pending data, further sends are refused
/// and a second disconnect is not sent.
#[test]
fn sends_after_queued_disconnect_are_refused() {
    let mut sim = connected_pair(SimulatorConfig::default(), Config::default(), receiver(0, 1));
    sim.conn_mut(Side::A).data_request(b"first").unwrap();
    sim.conn_mut(Side::A).data_request(b"second").unwrap();
    sim.conn_mut(Side::A).disconnect_request(None);
    assert!(sim.conn(Side::A).is_disconnect_queued());

    assert_eq!(
        sim.conn_mut(Side::A).data_request(b"third"),
        Err(ConnError::NotConnected)
    );
    assert_eq!(sim.conn(Side::A).xmit_queue_size(61), 0);
    sim.conn_mut(Side::A).disconnect_request(None);
    assert_eq!(sim.conn(Side::A).tx_queue().len(), 2);
    assert!(sim.events(Side::A).is_empty());

    sim.pump();
    sim.conn_mut(Side::B).return_credit(5);
    sim.pump();
    let events = sim.events(Side::B);
    assert_eq!(
        payloads(&events),
        vec![b"first".to_vec(), b"second".to_vec()]
    );
    let reasons: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::DisconnectIndication { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![DisconnectReason::PeerRequest]);

    let events = sim.events(Side::A);
    assert_eq!(disconnect_reason(&events), Some(DisconnectReason::UserRequest));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::DisconnectIndication { .. }))
            .count(),
        1
    );
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
}

/// With enough credit, back-to-back sends and a disconnect all go out in
/// request order.
#[test]
fn sends_then_disconnect_keep_order() {
    let mut sim = connected_pair(SimulatorConfig::default(), Config::default(), Config::default());
    sim.conn_mut(Side::A).data_request(b"A").unwrap();
    sim.conn_mut(Side::A).data_request(b"B").unwrap();
    sim.conn_mut(Side::A).disconnect_request(None);
    sim.pump();

    let events = sim.events(Side::B);
    assert_eq!(payloads(&events), vec![b"A".to_vec(), b"B".to_vec()]);
    assert!(matches!(
        events.last(),
        Some(Event::DisconnectIndication {
            reason: DisconnectReason::PeerRequest,
            ..
        })
    ));
}

// ---------------------------------------------------------------------------
// Link failure
// ---------------------------------------------------------------------------

/// A failed put tears the connection down on both sides.
#[test]
fn link_failure_reaches_both_sides() {
    let sim_cfg = SimulatorConfig {
        put_failure_rate: 0.25,
        seed: 7,
        ..SimulatorConfig::default()
    };
    let mut sim = connected_pair(sim_cfg, Config::default(), Config::default());

    let mut a_events = Vec::new();
    let mut b_events = Vec::new();
    for i in 0..200u32 {
        if !sim.conn(Side::A).is_connected() {
            break;
        }
        sim.conn_mut(Side::A)
            .data_request(&i.to_be_bytes())
            .unwrap();
        sim.pump();
        a_events.extend(sim.events(Side::A));
        let events = sim.events(Side::B);
        let consumed: usize = payloads(&events).iter().map(Vec::len).sum();
        b_events.extend(events);
        sim.conn_mut(Side::B).return_credit(consumed);
        sim.pump();
        a_events.extend(sim.events(Side::A));
        b_events.extend(sim.events(Side::B));
    }

    let reasons = (disconnect_reason(&a_events), disconnect_reason(&b_events));
    assert!(
        matches!(
            reasons,
            (Some(DisconnectReason::LinkFailure), Some(DisconnectReason::PeerRequest))
                | (Some(DisconnectReason::PeerRequest), Some(DisconnectReason::LinkFailure))
        ),
        "unexpected disconnect reasons {reasons:?}"
    );
    assert_eq!(sim.conn(Side::A).state(), State::Idle);
    assert_eq!(sim.conn(Side::B).state(), State::Idle);
    assert!(sim.wire().stats().dropped >= 1);
}

// ---------------------------------------------------------------------------
// Randomized workload
// ---------------------------------------------------------------------------

/// Credit held by `side` that it may still grant, has granted, or is
/// holding for undelivered data.
fn credit_accounted(sim: &LinkSimulator, side: Side) -> u32 {
    let conn = sim.conn(side);
    conn.flow().avail_credit() + conn.flow().remote_credit() + conn.unreturned_packets() as u32
}

/// Random SDU sizes, random consumption pace, random configuration.  After
/// every quiescent point the credit books balance on both sides, at most one
/// read is outstanding, and every SDU arrives intact and in order.
#[test]
fn randomized_transfer_preserves_data_and_credit() {
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);

        let data_size = rng.random_range(6..=80usize);
        let max_seg = data_size - 3;
        let rx_max_sdu: u32 = if rng.random_bool(0.3) {
            0
        } else {
            rng.random_range(1..=300)
        };
        let a_credit = rng.random_range(1..=12u32);
        let b_credit = rng.random_range(1..=12u32);

        let mut sim_cfg = SimulatorConfig {
            seed,
            ..SimulatorConfig::default()
        };
        sim_cfg.a.data_size = data_size;
        sim_cfg.b.data_size = data_size;
        let a = receiver(0, a_credit);
        let b = receiver(rx_max_sdu, b_credit);
        let mut sim = connected_pair(sim_cfg, a, b);

        // Keep every SDU well inside the transmit queue bound.
        let limit = if rx_max_sdu == 0 {
            max_seg
        } else {
            (rx_max_sdu as usize).min(max_seg * 40)
        };
        let mut sent: Vec<Vec<u8>> = Vec::new();
        let mut received: Vec<Vec<u8>> = Vec::new();
        let mut unconsumed = 0usize;

        let step = |sim: &mut LinkSimulator, received: &mut Vec<Vec<u8>>| {
            sim.pump();
            for event in sim.events(Side::A) {
                assert!(
                    !matches!(event, Event::DisconnectIndication { .. }),
                    "seed {seed}: A disconnected"
                );
            }
            let got = payloads(&sim.events(Side::B));
            let bytes: usize = got.iter().map(Vec::len).sum();
            received.extend(got);

            assert_eq!(credit_accounted(sim, Side::B), b_credit, "seed {seed}");
            assert_eq!(credit_accounted(sim, Side::A), a_credit, "seed {seed}");
            assert_eq!(
                sim.conn(Side::A).flow().send_credit(),
                sim.conn(Side::B).flow().remote_credit(),
                "seed {seed}"
            );
            assert!(sim.conn(Side::A).is_read_pending());
            assert!(sim.conn(Side::B).is_read_pending());
            assert_eq!(sim.wire().stats().overlapping_reads, 0);
            bytes
        };

        for _ in 0..300 {
            match rng.random_range(0..3) {
                0 => {
                    let len = rng.random_range(1..=limit);
                    let sdu: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
                    match sim.conn_mut(Side::A).data_request(&sdu) {
                        Ok(n) => {
                            assert_eq!(n, len);
                            sent.push(sdu);
                        }
                        Err(ConnError::QueueFull) => {}
                        Err(e) => panic!("seed {seed}: unexpected {e}"),
                    }
                }
                1 if unconsumed > 0 => {
                    let n = rng.random_range(1..=unconsumed);
                    sim.conn_mut(Side::B).return_credit(n);
                    unconsumed -= n;
                }
                _ => {}
            }
            unconsumed += step(&mut sim, &mut received);
        }

        // Consume everything until the sender's queue is empty.
        for _ in 0..1000 {
            if sim.conn(Side::A).tx_queue().is_empty() && received.len() == sent.len() {
                break;
            }
            sim.conn_mut(Side::B).return_credit(unconsumed);
            unconsumed = step(&mut sim, &mut received);
        }

        assert_eq!(received, sent, "seed {seed}: data mismatch");
    }
}
