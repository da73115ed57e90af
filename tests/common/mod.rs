//! Paired transport fixture over a loopback fabric

#![allow(dead_code)]

use std::sync::Arc;

use srio_channel::loopback::{LoopbackFabric, LoopbackNode};
use srio_channel::{ChannelFd, TransportConfig, TransportContext};

pub type Ctx = TransportContext<LoopbackNode>;

/// Two transport contexts cabled together, plus handles on their nodes
/// for fault injection.
pub struct Pair {
    pub tx: Arc<Ctx>,
    pub rx: Arc<Ctx>,
    pub tx_node: LoopbackNode,
    pub rx_node: LoopbackNode,
}

impl Pair {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_setup(config, |_, _| {})
    }

    /// Build the pair, running `setup` on the nodes before either
    /// transport initializes.
    pub fn with_setup(
        config: TransportConfig,
        setup: impl FnOnce(&LoopbackNode, &LoopbackNode),
    ) -> Self {
        let (a, b) = LoopbackFabric::pair(config.port_count);
        setup(&a, &b);
        Self {
            tx: Arc::new(TransportContext::new(a.clone(), config.clone()).unwrap()),
            rx: Arc::new(TransportContext::new(b.clone(), config).unwrap()),
            tx_node: a,
            rx_node: b,
        }
    }

    /// Open `name` on both ends.
    pub fn open(&self, name: &str) -> (ChannelFd, ChannelFd) {
        (self.tx.open(name).unwrap(), self.rx.open(name).unwrap())
    }
}

/// Two ports, two DMA channels each, a short ring.
pub fn small_config() -> TransportConfig {
    TransportConfig {
        port_count: 2,
        dma_channels_per_port: 2,
        sub_buf_count: 8,
        buf_size: 0x400,
        channels: TransportConfig::default_channels(2, 2),
        ..Default::default()
    }
}
