mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Pair, small_config};
use srio_channel::port::PortState;
use srio_channel::{Error, ReadResult};

#[test]
fn round_trip_is_byte_identical() {
    let pair = Pair::new(small_config());
    let (wfd, rfd) = pair.open("srio0-chan1");

    let payload: Vec<u8> = (0..0x3ff).map(|i| (i * 7) as u8).collect();
    pair.tx.write(wfd, &payload).unwrap();

    let mut buf = vec![0u8; 0x400];
    let result = pair.rx.read(rfd, &mut buf).unwrap();
    assert_eq!(
        result,
        ReadResult {
            num: 0,
            len: 0x3ff,
            seq: 0,
            part: 0,
            last: true
        }
    );
    assert_eq!(&buf[..result.len], &payload[..]);
    pair.rx.read_feedback(rfd, result.num).unwrap();

    let stats = pair.rx.stats(rfd).unwrap();
    assert_eq!((stats.received, stats.released), (1, 1));
    assert_eq!(stats.bytes_received, 0x3ff);
}

#[test]
fn channels_are_bidirectional() {
    let pair = Pair::new(small_config());
    let (a, b) = pair.open("srio1-chan0");

    pair.tx.write(a, b"ping").unwrap();
    pair.rx.write(b, b"pong").unwrap();

    let mut buf = [0u8; 0x400];
    let got = pair.rx.read(b, &mut buf).unwrap();
    assert_eq!(&buf[..got.len], b"ping");
    let got = pair.tx.read(a, &mut buf).unwrap();
    assert_eq!(&buf[..got.len], b"pong");
}

// Writer sends sub-buffers 0..7 filled with their index; the reader checks
// every byte of each.
#[test]
fn scenario_a_pattern_per_sub_buffer() {
    let pair = Pair::new(small_config());
    let (wfd, rfd) = pair.open("srio0-chan0");

    for i in 0..8u8 {
        pair.tx.write(wfd, &[i; 0x400]).unwrap();
    }

    let mut buf = [0u8; 0x400];
    for i in 0..8u8 {
        let result = pair.rx.read(rfd, &mut buf).unwrap();
        assert_eq!(result.num, i as usize);
        assert_eq!(result.len, 0x400);
        assert!(buf.iter().all(|&b| b == i), "sub-buffer {i} corrupted");
        pair.rx.read_feedback(rfd, result.num).unwrap();
    }
    assert_eq!(pair.rx.read(rfd, &mut buf).unwrap_err(), Error::NotReady);
}

#[test]
fn scenario_b_unknown_channel_has_no_side_effects() {
    let pair = Pair::new(small_config());
    assert_eq!(pair.tx.open("nonexistent-chan").unwrap_err(), Error::NotFound);
    assert_eq!(pair.tx_node.engines_created(), 0);
    assert_eq!(pair.tx_node.transfers(), 0);
}

#[test]
fn sub_buffer_indices_follow_the_ring() {
    let pair = Pair::new(small_config());
    let (wfd, rfd) = pair.open("srio0-chan0");

    let mut buf = [0u8; 0x400];
    let mut seen = Vec::new();
    for round in 0..20u64 {
        pair.tx.write(wfd, &round.to_le_bytes()).unwrap();
        let result = pair.rx.read(rfd, &mut buf).unwrap();
        assert_eq!(result.seq, round);
        assert_eq!(&buf[..8], &round.to_le_bytes());
        seen.push(result.num);
        pair.rx.read_feedback(rfd, result.num).unwrap();
    }
    let expected: Vec<usize> = (0..20).map(|i| i % 8).collect();
    assert_eq!(seen, expected);
}

#[test]
fn open_on_unconnected_port_fails() {
    let pair = Pair::with_setup(small_config(), |tx, _| tx.set_connected(1, false));
    assert_eq!(pair.tx.port_state(1).unwrap(), PortState::NotConnected);
    assert_eq!(pair.tx.open("srio1-chan0").unwrap_err(), Error::LinkNotConnected);
    assert_eq!(pair.tx_node.engines_created(), 0);

    // Port 0 is unaffected
    pair.tx.open("srio0-chan0").unwrap();

    pair.tx_node.set_connected(1, true);
    pair.tx.reprobe_port(1).unwrap();
    let wfd = pair.tx.open("srio1-chan0").unwrap();
    let rfd = pair.rx.open("srio1-chan0").unwrap();
    pair.tx.write(wfd, b"late").unwrap();
    let mut buf = [0u8; 4];
    pair.rx.read(rfd, &mut buf).unwrap();
    assert_eq!(&buf, b"late");
}

#[test]
fn read_without_data_returns_quickly() {
    let pair = Pair::new(small_config());
    let (_wfd, rfd) = pair.open("srio0-chan0");
    let mut buf = [0u8; 0x400];

    assert_eq!(pair.rx.read(rfd, &mut buf).unwrap_err(), Error::NotReady);
    let start = Instant::now();
    for _ in 0..10 {
        assert_eq!(pair.rx.read(rfd, &mut buf).unwrap_err(), Error::NotReady);
    }
    assert!(start.elapsed() < Duration::from_millis(10));
}

#[test]
fn control_blocks_are_idempotent() {
    let pair = Pair::new(small_config());
    let a = pair.tx.get_control_block(1, 1).unwrap();
    let b = pair.tx.get_control_block(1, 1).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!((a.port(), a.bufnum()), (1, 1));

    let fd = pair.tx.open("srio1-chan1").unwrap();
    assert_eq!(pair.tx_node.engines_created(), 1);

    assert_eq!(pair.tx.get_control_block(2, 0).unwrap_err(), Error::OutOfRange);
    assert_eq!(pair.tx.get_control_block(0, 2).unwrap_err(), Error::OutOfRange);
    pair.tx.close(fd).unwrap();
}

#[test]
fn close_releases_the_engine() {
    let pair = Pair::new(small_config());
    let fd = pair.tx.open("srio0-chan0").unwrap();
    let other = pair.tx.open("srio0-chan1").unwrap();
    assert_eq!(pair.tx_node.engines_live(), 2);

    pair.tx.close(fd).unwrap();
    assert_eq!(pair.tx_node.engines_live(), 1);
    pair.tx.close(other).unwrap();
    assert_eq!(pair.tx_node.engines_live(), 0);

    // Churn
    for _ in 0..3 {
        let fd = pair.tx.open("srio0-chan0").unwrap();
        pair.tx.close(fd).unwrap();
    }
    assert_eq!(pair.tx_node.engines_live(), 0);
    assert_eq!(pair.tx_node.engines_created(), 5);
}

#[test]
fn writer_waits_for_credit() {
    let pair = Pair::new(small_config());
    let (wfd, rfd) = pair.open("srio0-chan0");

    for i in 0..8u8 {
        pair.tx.write(wfd, &[i; 64]).unwrap();
    }
    let transfers = pair.tx_node.transfers();
    assert_eq!(pair.tx.write(wfd, &[8; 64]).unwrap_err(), Error::Busy);
    assert_eq!(pair.tx_node.transfers(), transfers);

    // Nothing was overwritten
    let mut buf = [0u8; 64];
    for i in 0..8u8 {
        let result = pair.rx.read(rfd, &mut buf).unwrap();
        assert_eq!(buf, [i; 64]);
        if i < 2 {
            pair.rx.read_feedback(rfd, result.num).unwrap();
        }
    }

    // Two sub-buffers released: a two sub-buffer write fits, a third does
    // not
    pair.tx.write(wfd, &[9; 0x800]).unwrap();
    assert_eq!(pair.tx.write(wfd, &[10; 1]).unwrap_err(), Error::Busy);
}

#[test]
fn context_drop_returns_dma_memory() {
    let (a, _b) = srio_channel::loopback::LoopbackFabric::pair(2);
    // Enough for exactly one transport
    a.set_memory_limit(0x20000);
    for _ in 0..3 {
        let ctx = srio_channel::TransportContext::new(a.clone(), small_config()).unwrap();
        drop(ctx);
    }
}
