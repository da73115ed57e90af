//! Port pools and window setup.
//!
//! Each RapidIO port owns four regions carved from two shared pools:
//!
//! - from the payload pool: `write_result` (inbound payload landing area,
//!   mapped by inbound window [`DATA_WINDOW`]) and `write_data` (outbound
//!   payload staging)
//! - from the control pool: `write_ctl_result` (inbound header landing
//!   area, mapped by inbound window [`CTL_WINDOW`]) and `write_ctl_data`
//!   (outbound header staging)
//!
//! Section `s` of port `p` sits at `(p * 2 + s) * section_size` in its
//! pool.  The layout is fixed once created; only the link state and the
//! outbound range change, when a failed port is re-probed.
//!
//! The control window holds every channel's header and release slots,
//! followed by two port slots: one where the peer's port commands land,
//! and one for the peer's acknowledgements of ours.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::TransportConfig;
use crate::header::{HEADER_SLOT, PortCommand};
use crate::io::{LinkLayer, PortInfo};
use crate::pool::{DmaPool, DmaRegion, window_size};
use crate::{Error, Result};

/// Window ID used for payloads, inbound and outbound.
pub const DATA_WINDOW: u8 = 1;

/// Window ID used for control headers, inbound and outbound.
pub const CTL_WINDOW: u8 = 2;

/// Outbound attribute values, indexed by [`TransferType`].
pub const WINDOW_ATTRS: [u32; 5] = [3, 4, 5, 4, 0];

/// RapidIO transaction type used for outbound windows.
#[repr(usize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    #[default]
    SWrite = 0,
    NWrite = 1,
    SWriteR = 2,
    NRead = 3,
}

impl TransferType {
    /// Write attribute for this transfer type.
    pub fn write_attr(self) -> u32 {
        WINDOW_ATTRS[self as usize]
    }

    /// Read attribute, the same for every transfer type.
    pub fn read_attr() -> u32 {
        WINDOW_ATTRS[TransferType::NRead as usize]
    }
}

/// Link state of a port.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    #[default]
    NotConnected = 0,
    Connected = 1,
    /// Too many consecutive DMA failures; needs a re-probe
    Failed = 2,
}

impl From<u8> for PortState {
    fn from(value: u8) -> Self {
        match value {
            1 => PortState::Connected,
            2 => PortState::Failed,
            _ => PortState::NotConnected,
        }
    }
}

/// Where a port is in the command exchange with its peer.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// No command exchanged yet
    #[default]
    Idle = 0,
    /// Geometry checked and rings restarted by an `Init`
    Ready = 1,
    Started = 2,
    Stopped = 3,
}

impl From<u8> for PortMode {
    fn from(value: u8) -> Self {
        match value {
            1 => PortMode::Ready,
            2 => PortMode::Started,
            3 => PortMode::Stopped,
            _ => PortMode::Idle,
        }
    }
}

impl From<PortCommand> for PortMode {
    /// The mode a port is in once `command` has been acknowledged.
    fn from(command: PortCommand) -> Self {
        match command {
            PortCommand::Init => PortMode::Ready,
            PortCommand::Start => PortMode::Started,
            PortCommand::Stop => PortMode::Stopped,
        }
    }
}

/// Window sizes shared by every port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    /// Payload window (and payload section) size
    pub data_window: u64,
    /// Control window (and control section) size
    pub ctl_window: u64,
    /// Offset of the port command slot in the control regions; the
    /// acknowledgement slot follows it
    pub command_slot: usize,
    port_count: u8,
}

impl PortLayout {
    /// Size the windows for `config`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if a window, the pair of windows a port
    /// maps, or a pool does not fit the address space.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let channels = config.dma_channels_per_port as u64;
        let ring = (config.sub_buf_count as u64).checked_mul(config.buf_size as u64);
        let data_window = ring
            .and_then(|ring| ring.checked_mul(channels))
            .and_then(window_size);
        let command_slot = config.ctl_chan_size().checked_mul(channels as usize);
        let ctl_window = command_slot
            .and_then(|slot| slot.checked_add(2 * HEADER_SLOT))
            .and_then(|bytes| window_size(bytes as u64));
        let (Some(data_window), Some(ctl_window), Some(command_slot)) =
            (data_window, ctl_window, command_slot)
        else {
            error!(
                "Ring geometry {} x {:#x} needs a window beyond 64 bits",
                config.sub_buf_count, config.buf_size
            );
            return Err(Error::InvalidConfig);
        };

        let layout = Self {
            data_window,
            ctl_window,
            command_slot,
            port_count: config.port_count,
        };
        let sections = 2 * config.port_count as u64;
        let fits = data_window.checked_add(ctl_window).is_some()
            && data_window
                .checked_mul(sections)
                .is_some_and(|size| usize::try_from(size).is_ok())
            && ctl_window
                .checked_mul(sections)
                .is_some_and(|size| usize::try_from(size).is_ok());
        if !fits {
            error!("Windows {data_window:#x} / {ctl_window:#x} do not fit the address space");
            return Err(Error::InvalidConfig);
        }
        Ok(layout)
    }

    /// Offset of the slot the peer's acknowledgements land in.
    pub fn ack_slot(&self) -> usize {
        self.command_slot + HEADER_SLOT
    }

    /// Payload pool size for every port.
    pub fn data_pool_size(&self) -> usize {
        2 * self.port_count as usize * self.data_window as usize
    }

    /// Control pool size for every port.
    pub fn ctl_pool_size(&self) -> usize {
        2 * self.port_count as usize * self.ctl_window as usize
    }
}

/// Regions and link state of one port.
#[derive(Debug)]
pub struct PortPool {
    port: u8,
    layout: PortLayout,
    state: AtomicU8,
    mode: AtomicU8,
    range_start: AtomicU64,
    error_count: AtomicU64,
    consecutive_failures: AtomicU32,
    /// Inbound payload landing area
    pub write_result: DmaRegion,
    /// Outbound payload staging
    pub write_data: DmaRegion,
    /// Inbound header landing area
    pub write_ctl_result: DmaRegion,
    /// Outbound header staging
    pub write_ctl_data: DmaRegion,
}

impl PortPool {
    /// Carve port `port`'s regions out of the shared pools.
    pub fn new(port: u8, layout: PortLayout, data: &DmaPool, ctl: &DmaPool) -> Result<Self> {
        let data_section = layout.data_window as usize;
        let ctl_section = layout.ctl_window as usize;
        let base = port as usize * 2;

        let pool = Self {
            port,
            layout,
            state: AtomicU8::new(PortState::NotConnected as u8),
            mode: AtomicU8::new(PortMode::Idle as u8),
            range_start: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            write_result: data.section(base, data_section)?,
            write_data: data.section(base + 1, data_section)?,
            write_ctl_result: ctl.section(base, ctl_section)?,
            write_ctl_data: ctl.section(base + 1, ctl_section)?,
        };
        debug!(
            "Port {port}: write_result {:#x} write_data {:#x} write_ctl_result {:#x} write_ctl_data {:#x}",
            pool.write_result.phys(),
            pool.write_data.phys(),
            pool.write_ctl_result.phys(),
            pool.write_ctl_data.phys()
        );
        Ok(pool)
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn layout(&self) -> PortLayout {
        self.layout
    }

    pub fn state(&self) -> PortState {
        PortState::from(self.state.load(Ordering::Acquire))
    }

    pub fn mode(&self) -> PortMode {
        PortMode::from(self.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_mode(&self, mode: PortMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Outbound range start, if the port is usable.
    pub fn range_start(&self) -> Result<u64> {
        match self.state() {
            PortState::Connected => Ok(self.range_start.load(Ordering::Acquire)),
            _ => Err(Error::LinkNotConnected),
        }
    }

    /// Outbound address of the peer's control window.
    pub fn ctl_range_start(&self) -> Result<u64> {
        Ok(self.range_start()? + self.layout.data_window)
    }

    /// DMA failures seen on this port so far.
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Connect the port and program its windows and IDs.
    ///
    /// A port that does not report connected is left in
    /// [`PortState::NotConnected`]; channels on it fail to open.
    pub fn bring_up<L: LinkLayer + ?Sized>(&self, link: &L, config: &TransportConfig) -> Result<()> {
        let port = self.port;
        if !link.connect(port) {
            warn!("Port {port} not connected, skipping window setup");
            self.state
                .store(PortState::NotConnected as u8, Ordering::Release);
            return Err(Error::LinkNotConnected);
        }

        let PortInfo {
            range_start,
            range_size,
        } = link.port_info(port)?;
        let PortLayout {
            data_window,
            ctl_window,
            ..
        } = self.layout;
        if range_size < data_window + ctl_window {
            error!(
                "Port {port}: outbound range {range_size:#x} too small for windows {data_window:#x} + {ctl_window:#x}"
            );
            return Err(Error::Resource);
        }

        link.set_inbound_window(
            port,
            DATA_WINDOW,
            self.write_result.phys(),
            config.data_sys_addr,
            data_window,
        )?;
        link.set_inbound_window(
            port,
            CTL_WINDOW,
            self.write_ctl_result.phys(),
            config.ctl_sys_addr,
            ctl_window,
        )?;

        let read = TransferType::read_attr();
        let write = config.transfer_type.write_attr();
        link.set_outbound_window(port, DATA_WINDOW, range_start, config.data_sys_addr, data_window)?;
        link.set_outbound_window_attr(port, DATA_WINDOW, read, write)?;
        link.set_outbound_window(
            port,
            CTL_WINDOW,
            range_start + data_window,
            config.ctl_sys_addr,
            ctl_window,
        )?;
        link.set_outbound_window_attr(port, CTL_WINDOW, read, write)?;

        let idx = port as usize;
        let source_id = *config.source_ids.get(idx).ok_or(Error::InvalidConfig)?;
        let target_id = *config.target_ids.get(idx).ok_or(Error::InvalidConfig)?;
        link.set_device_id(port, source_id)?;
        link.set_target_id(port, DATA_WINDOW, target_id)?;
        link.set_target_id(port, CTL_WINDOW, target_id)?;

        self.range_start.store(range_start, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.state.store(PortState::Connected as u8, Ordering::Release);
        info!(
            "Port {port} up: range_start {range_start:#x} data window {data_window:#x} ctl window {ctl_window:#x} attr r{read}/w{write}"
        );
        Ok(())
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Count a DMA failure; past `threshold` consecutive failures the port
    /// is declared failed.  Returns the port's error count.
    pub(crate) fn record_failure(&self, threshold: u32) -> u64 {
        let errors = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= threshold
            && self
                .state
                .compare_exchange(
                    PortState::Connected as u8,
                    PortState::Failed as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            error!(
                "Port {}: {consecutive} consecutive DMA failures, marking link failed",
                self.port
            );
        }
        errors
    }
}

/// Carve every port's regions and bring up the connected ones.
pub fn port_pool_init<L: LinkLayer + ?Sized>(
    link: &L,
    config: &TransportConfig,
    layout: PortLayout,
    data: &DmaPool,
    ctl: &DmaPool,
) -> Result<Vec<PortPool>> {
    let mut ports = Vec::with_capacity(config.port_count as usize);
    for port in 0..config.port_count {
        let pool = PortPool::new(port, layout, data, ctl)?;
        match pool.bring_up(link, config) {
            Ok(()) | Err(Error::LinkNotConnected) => {}
            Err(e) => return Err(e),
        }
        ports.push(pool);
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{InboundWindow, LoopbackFabric};
    use crate::pool::POOL_ALIGN;

    fn small_config() -> TransportConfig {
        TransportConfig {
            port_count: 2,
            dma_channels_per_port: 2,
            sub_buf_count: 4,
            buf_size: 0x400,
            channels: TransportConfig::default_channels(2, 2),
            ..Default::default()
        }
    }

    #[test]
    fn attribute_rows() {
        assert_eq!(TransferType::SWrite.write_attr(), 3);
        assert_eq!(TransferType::NWrite.write_attr(), 4);
        assert_eq!(TransferType::SWriteR.write_attr(), 5);
        assert_eq!(TransferType::read_attr(), 4);
    }

    #[test]
    fn layout_rounds_windows() {
        let layout = PortLayout::new(&small_config()).unwrap();
        // 2 channels * 4 * 0x400
        assert_eq!(layout.data_window, 0x2000);
        // 2 channels * 2 * 4 * 256 = 0x1000, then the two port slots
        assert_eq!(layout.command_slot, 0x1000);
        assert_eq!(layout.ack_slot(), 0x1100);
        assert_eq!(layout.ctl_window, 0x2000);
        assert_eq!(layout.data_pool_size(), 0x8000);
        assert_eq!(layout.ctl_pool_size(), 0x8000);
    }

    #[test]
    fn connected_port_programs_windows() {
        let config = small_config();
        let (node, _) = LoopbackFabric::pair(2);
        node.set_connected(1, false);

        let layout = PortLayout::new(&config).unwrap();
        let data = DmaPool::init(&node, layout.data_pool_size(), POOL_ALIGN).unwrap();
        let ctl = DmaPool::init(&node, layout.ctl_pool_size(), POOL_ALIGN).unwrap();
        let ports = port_pool_init(&node, &config, layout, &data, &ctl).unwrap();

        assert_eq!(ports[0].state(), PortState::Connected);
        assert_eq!(ports[1].state(), PortState::NotConnected);
        assert_eq!(ports[1].range_start().unwrap_err(), Error::LinkNotConnected);

        let range = ports[0].range_start().unwrap();
        assert_eq!(ports[0].ctl_range_start().unwrap(), range + 0x2000);
        assert_eq!(ports[0].write_data.phys(), data.physical_base() + 0x2000);
        assert_eq!(ports[1].write_ctl_result.phys(), ctl.physical_base() + 0x4000);

        let windows = node.inbound_windows(0);
        assert!(windows.contains(&InboundWindow {
            window: DATA_WINDOW,
            local_phys: ports[0].write_result.phys(),
            sys_addr: 0x1000_0000,
            size: 0x2000,
        }));
        assert!(windows.contains(&InboundWindow {
            window: CTL_WINDOW,
            local_phys: ports[0].write_ctl_result.phys(),
            sys_addr: 0x0100_0000,
            size: 0x2000,
        }));
        assert!(node.inbound_windows(1).is_empty());

        let outbound = node.outbound_windows(0);
        let ctl = outbound.iter().find(|w| w.window == CTL_WINDOW).unwrap();
        assert_eq!(ctl.range_addr, range + 0x2000);
        assert_eq!((ctl.read_attr, ctl.write_attr), (4, 3));
        assert_eq!(ctl.target_id, Some(0x11));
        assert_eq!(node.device_id(0), Some(0x11));
    }

    #[test]
    fn consecutive_failures_fail_the_port() {
        let config = small_config();
        let (node, _) = LoopbackFabric::pair(2);
        let layout = PortLayout::new(&config).unwrap();
        let data = DmaPool::init(&node, layout.data_pool_size(), POOL_ALIGN).unwrap();
        let ctl = DmaPool::init(&node, layout.ctl_pool_size(), POOL_ALIGN).unwrap();
        let ports = port_pool_init(&node, &config, layout, &data, &ctl).unwrap();
        let port = &ports[0];

        assert_eq!(port.record_failure(3), 1);
        port.record_success();
        assert_eq!(port.record_failure(3), 2);
        assert_eq!(port.record_failure(3), 3);
        assert_eq!(port.state(), PortState::Connected);
        assert_eq!(port.record_failure(3), 4);
        assert_eq!(port.state(), PortState::Failed);
        assert_eq!(port.range_start().unwrap_err(), Error::LinkNotConnected);

        port.bring_up(&node, &config).unwrap();
        assert_eq!(port.state(), PortState::Connected);
        assert_eq!(port.error_count(), 4);
    }
}
