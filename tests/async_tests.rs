#![cfg(feature = "async")]

mod common;

use std::time::Duration;

use common::{Pair, small_config};
use srio_channel::channel::{AsyncChannel, AsyncDelay, AsyncTransport};
use srio_channel::loopback::LoopbackNode;

struct TokioDelay;

impl AsyncDelay for TokioDelay {
    async fn delay() {
        tokio::time::sleep(Duration::from_micros(200)).await;
    }
}

type Channel = AsyncChannel<LoopbackNode, TokioDelay>;

#[tokio::test]
async fn send_waits_for_the_receiver() {
    let pair = Pair::new(small_config());
    let mut tx = Channel::open(pair.tx.clone(), "srio0-chan0").unwrap();
    let mut rx = Channel::open(pair.rx.clone(), "srio0-chan0").unwrap();

    // Three times the ring
    let sender = async {
        for i in 0..24u8 {
            tx.send(&[i; 100]).await.unwrap();
        }
    };
    let receiver = async {
        let mut buf = [0u8; 0x400];
        for i in 0..24u8 {
            let result = rx.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..result.len], &[i; 100][..]);
            rx.release(result.num).await.unwrap();
        }
    };
    tokio::join!(sender, receiver);

    assert_eq!(pair.tx.stats(tx.fd()).unwrap().sent, 24);
}

#[tokio::test]
async fn recv_returns_errors_other_than_not_ready() {
    let pair = Pair::new(small_config());
    let mut tx = Channel::open(pair.tx.clone(), "srio1-chan0").unwrap();
    let mut rx = Channel::open(pair.rx.clone(), "srio1-chan0").unwrap();

    tx.send(&[1; 64]).await.unwrap();
    let mut small = [0u8; 8];
    assert_eq!(
        rx.recv(&mut small).await.unwrap_err(),
        srio_channel::Error::BufferTooSmall
    );
    assert_eq!(
        rx.release(0).await.unwrap_err(),
        srio_channel::Error::InvalidOperation
    );
}
