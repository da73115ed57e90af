//! Transport configuration.
//!
//! Both peers of a port must be configured with the same ring geometry
//! (`dma_channels_per_port`, `sub_buf_count`, `buf_size`), byte order and
//! system addresses.  Geometry is not negotiated, but an
//! [`Init`](crate::header::PortCommand::Init) port command checks it.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::time::Duration;

use crate::header::{ByteOrder, Geometry, HEADER_SLOT};
use crate::port::{PortLayout, TransferType};
use crate::{Error, Result};

/// Maximum DMA channel numbers per port; `CH_ID` and `SUB_BUF` are bytes.
pub const MAX_DMA_CHANNELS: u8 = 8;

/// Maximum sub-buffers per channel ring.
pub const MAX_SUB_BUFS: usize = 128;

/// One entry of the channel-name table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub port: u8,
    /// DMA channel number on `port`
    pub bufnum: u8,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, port: u8, bufnum: u8) -> Self {
        Self {
            name: name.into(),
            port,
            bufnum,
        }
    }
}

/// Configuration for a [`crate::channel::TransportContext`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of RapidIO ports
    pub port_count: u8,
    /// DMA channel numbers (and so channels) per port
    pub dma_channels_per_port: u8,
    /// Sub-buffers in each channel's ring
    pub sub_buf_count: usize,
    /// Bytes per sub-buffer
    pub buf_size: usize,
    /// DMA engine burst watermark in bytes
    pub burst_watermark: u32,
    /// Longest a single DMA transfer may take
    pub dma_timeout: Duration,
    /// Selects the outbound write attribute
    pub transfer_type: TransferType,
    /// System address of the payload window
    pub data_sys_addr: u64,
    /// System address of the control window
    pub ctl_sys_addr: u64,
    /// This end's device ID, per port
    pub source_ids: Vec<u32>,
    /// The peer's device ID, per port
    pub target_ids: Vec<u32>,
    /// `PK_ID` placed in every header
    pub packet_id: u8,
    /// Consecutive DMA failures after which a port is declared failed
    pub link_failure_threshold: u32,
    /// Byte order of multi-byte header fields
    pub byte_order: ByteOrder,
    /// Longest to wait for the peer to acknowledge a port command
    pub command_timeout: Duration,
    /// Channel-name table
    pub channels: Vec<ChannelSpec>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let port_count = 2;
        let dma_channels_per_port = MAX_DMA_CHANNELS;
        Self {
            port_count,
            dma_channels_per_port,
            sub_buf_count: 8,
            buf_size: 0x1000,
            burst_watermark: 1024,
            dma_timeout: Duration::from_secs(1),
            transfer_type: TransferType::SWrite,
            data_sys_addr: 0x1000_0000,
            ctl_sys_addr: 0x0100_0000,
            source_ids: vec![0x11, 0x14],
            target_ids: vec![0x11, 0x14],
            packet_id: 0,
            link_failure_threshold: 16,
            byte_order: ByteOrder::Little,
            command_timeout: Duration::from_secs(10),
            channels: Self::default_channels(port_count, dma_channels_per_port),
        }
    }
}

impl TransportConfig {
    /// `srio{port}-chan{n}` for every (port, DMA channel number) pair.
    pub fn default_channels(port_count: u8, dma_channels_per_port: u8) -> Vec<ChannelSpec> {
        (0..port_count)
            .flat_map(|port| {
                (0..dma_channels_per_port)
                    .map(move |bufnum| ChannelSpec::new(format!("srio{port}-chan{bufnum}"), port, bufnum))
            })
            .collect()
    }

    /// Bytes of one channel's payload ring.  Saturates on a geometry that
    /// [`Self::validate()`] rejects.
    pub fn chan_size(&self) -> usize {
        self.sub_buf_count.saturating_mul(self.buf_size)
    }

    /// Bytes of one channel's control area: a header slot and a release
    /// slot per sub-buffer.
    pub fn ctl_chan_size(&self) -> usize {
        self.sub_buf_count.saturating_mul(2 * HEADER_SLOT)
    }

    /// Ring geometry, as carried in port commands.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            dma_channels: self.dma_channels_per_port,
            sub_buf_count: self.sub_buf_count as u32,
            buf_size: self.buf_size as u64,
        }
    }

    /// Check the configuration is self-consistent, and that its windows
    /// and pools are addressable.
    pub fn validate(&self) -> Result<()> {
        if self.port_count == 0
            || self.dma_channels_per_port == 0
            || self.dma_channels_per_port > MAX_DMA_CHANNELS
        {
            return Err(Error::InvalidConfig);
        }
        if self.sub_buf_count == 0 || self.sub_buf_count > MAX_SUB_BUFS || self.buf_size == 0 {
            return Err(Error::InvalidConfig);
        }
        if self.buf_size % 8 != 0 {
            return Err(Error::NotAligned);
        }
        if self.source_ids.len() < self.port_count as usize
            || self.target_ids.len() < self.port_count as usize
        {
            return Err(Error::InvalidConfig);
        }
        if self.link_failure_threshold == 0 {
            return Err(Error::InvalidConfig);
        }

        for (i, chan) in self.channels.iter().enumerate() {
            if chan.port >= self.port_count || chan.bufnum >= self.dma_channels_per_port {
                return Err(Error::OutOfRange);
            }
            let clash = self.channels[..i].iter().any(|other| {
                other.name == chan.name || (other.port == chan.port && other.bufnum == chan.bufnum)
            });
            if clash {
                return Err(Error::InvalidConfig);
            }
        }

        PortLayout::new(self)?;
        Ok(())
    }
}
