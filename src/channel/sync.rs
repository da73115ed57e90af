//! Synchronous transport - the blocking write and polling read API.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{ChannelFd, ChannelStats, ReadResult, RingLayout};
use crate::config::{ChannelSpec, TransportConfig};
use crate::control::{ControlBlock, ControlBlockPool};
use crate::header::{
    ControlFlags, ControlInfo, FLAGS_OFFSET, HEADER_LEN, PORT_MESSAGE_LEN, PortCommand,
    PortMessage,
};
use crate::io::{DmaChannel, Platform};
use crate::pool::{DmaPool, POOL_ALIGN};
use crate::port::{PortLayout, PortMode, PortPool, PortState, port_pool_init};
use crate::{Error, Result};

/// Ring positions and engine of one channel.
///
/// Positions survive `close`, so a channel reopened on one side stays in
/// step with the peer.
#[derive(Debug)]
struct ChannelState<C: DmaChannel> {
    /// Present while the channel is open
    block: Option<Arc<ControlBlock<C>>>,
    /// Sequence number of the next write
    send_num: u64,
    /// Per sub-buffer: sequence written and not yet released by the peer
    pending: Vec<Option<u64>>,
    /// Sequence number of the next read
    read_num: u64,
    /// Per sub-buffer: sequence read and not yet released by us
    outstanding: Vec<Option<u64>>,
    stats: ChannelStats,
}

impl<C: DmaChannel> ChannelState<C> {
    /// Back to sequence 0 with nothing held in either direction.
    fn restart(&mut self) {
        self.send_num = 0;
        self.read_num = 0;
        self.pending.fill(None);
        self.outstanding.fill(None);
    }
}

/// How often [`TransportContext::port_command()`] checks for the
/// acknowledgement.
const COMMAND_POLL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct ChannelSlot<C: DmaChannel> {
    spec: ChannelSpec,
    ring: RingLayout,
    state: Mutex<ChannelState<C>>,
}

/// Owns the DMA pools, port pools, control blocks and channel table of one
/// end of a RapidIO link.
///
/// All methods take `&self`; a context is normally shared between worker
/// threads in an [`Arc`].  Each channel is locked independently, so
/// different channels never wait on each other.
pub struct TransportContext<P: Platform> {
    platform: P,
    config: TransportConfig,
    data_pool: Option<DmaPool>,
    ctl_pool: Option<DmaPool>,
    ports: Vec<PortPool>,
    blocks: ControlBlockPool<P::Channel>,
    channels: Vec<ChannelSlot<P::Channel>>,
}

impl<P: Platform> TransportContext<P> {
    /// Allocate the DMA pools, carve the port pools and bring up every
    /// connected port.
    ///
    /// Ports that are not connected are left down; channels on them fail
    /// to open with [`Error::LinkNotConnected`] until
    /// [`Self::reprobe_port()`] succeeds.
    pub fn new(platform: P, config: TransportConfig) -> Result<Self> {
        config.validate()?;

        let layout = PortLayout::new(&config)?;
        let data_pool = DmaPool::init(&platform, layout.data_pool_size(), POOL_ALIGN)?;
        let ctl_pool = match DmaPool::init(&platform, layout.ctl_pool_size(), POOL_ALIGN) {
            Ok(pool) => pool,
            Err(e) => {
                // Nothing has been carved from the pool yet
                unsafe { data_pool.free(&platform) };
                return Err(e);
            }
        };
        let ports = match port_pool_init(&platform, &config, layout, &data_pool, &ctl_pool) {
            Ok(ports) => ports,
            Err(e) => {
                // The port pools carved so far were dropped by the failure
                unsafe {
                    data_pool.free(&platform);
                    ctl_pool.free(&platform);
                }
                return Err(e);
            }
        };

        let channels = config
            .channels
            .iter()
            .map(|spec| ChannelSlot {
                spec: spec.clone(),
                ring: RingLayout::new(&config, spec.bufnum),
                state: Mutex::new(ChannelState {
                    block: None,
                    send_num: 0,
                    pending: vec![None; config.sub_buf_count],
                    read_num: 0,
                    outstanding: vec![None; config.sub_buf_count],
                    stats: ChannelStats::default(),
                }),
            })
            .collect();
        let blocks = ControlBlockPool::new(
            config.port_count,
            config.dma_channels_per_port,
            config.burst_watermark,
        );

        info!(
            "Transport up: {} ports, {} channels, {} x {:#x} byte sub-buffers",
            config.port_count,
            config.channels.len(),
            config.sub_buf_count,
            config.buf_size
        );
        Ok(Self {
            platform,
            config,
            data_pool: Some(data_pool),
            ctl_pool: Some(ctl_pool),
            ports,
            blocks,
            channels,
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open the channel called `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no channel has that name
    /// - [`Error::Busy`] if it is already open
    /// - [`Error::LinkNotConnected`] if its port is down
    /// - [`Error::Resource`] if its DMA engine cannot be initialized
    pub fn open(&self, name: &str) -> Result<ChannelFd> {
        let index = self
            .channels
            .iter()
            .position(|c| c.spec.name == name)
            .ok_or(Error::NotFound)?;
        let slot = &self.channels[index];
        let mut state = lock(&slot.state)?;
        if state.block.is_some() {
            return Err(Error::Busy);
        }

        let ChannelSpec { port, bufnum, .. } = slot.spec;
        self.port(port)?.range_start()?;
        let block = self.blocks.get(&self.platform, port, bufnum)?;
        state.block = Some(block);

        debug!("Opened {name} (port {port} channel {bufnum}) as fd {index}");
        Ok(ChannelFd(index))
    }

    /// Close a channel, releasing its DMA engine if nothing else uses it.
    pub fn close(&self, fd: ChannelFd) -> Result<()> {
        let slot = self.slot(fd)?;
        let mut state = lock(&slot.state)?;
        state.block.take().ok_or(Error::InvalidOperation)?;
        debug!("Closed {}", slot.spec.name);
        Ok(())
    }

    /// Write `buf`, spanning as many sub-buffers as it needs.
    ///
    /// Blocks until every DMA transfer has finished, but never waits for
    /// the peer.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] if the peer has not released the sub-buffers
    ///   needed; nothing was sent
    /// - [`Error::PayloadTooLarge`] if `buf` is larger than the whole ring
    /// - [`Error::DmaTransferFailed`] / [`Error::Timeout`] if a transfer
    ///   failed; the error is counted and the write may be retried
    /// - [`Error::LinkNotConnected`] if the port is down or failed
    pub fn write(&self, fd: ChannelFd, buf: &[u8]) -> Result<()> {
        let slot = self.slot(fd)?;
        let step = slot.ring.step_for(buf.len())?;
        self.write_step(fd, buf, step)
    }

    /// Write `buf` across exactly `step` consecutive sub-buffers.
    ///
    /// Each sub-buffer gets its own header, numbered from 0 in `PART`;
    /// headers of a multi-sub-buffer write carry `BIS`, and the last one
    /// also `CEN`.  Sub-buffers past the end of `buf` are sent empty.
    ///
    /// If a transfer fails part way, the sub-buffers before the failing
    /// one have been delivered and the reader sees them without an end;
    /// a retry starts again from `PART` 0.
    pub fn write_step(&self, fd: ChannelFd, buf: &[u8], step: usize) -> Result<()> {
        let slot = self.slot(fd)?;
        let ring = slot.ring;
        if step == 0 {
            return Err(Error::InvalidOperation);
        }
        if step > ring.sub_buf_count() || buf.len() > step * ring.buf_size() {
            return Err(Error::PayloadTooLarge);
        }

        let mut guard = lock(&slot.state)?;
        let state = &mut *guard;
        let block = state.block.clone().ok_or(Error::InvalidOperation)?;
        let ChannelSpec { port, bufnum, .. } = slot.spec;
        let port = self.port(port)?;
        let range_start = port.range_start()?;
        let ctl_range_start = port.ctl_range_start()?;

        for i in 0..step as u64 {
            let sub = ring.slot(state.send_num + i);
            if !self.reclaim(port, bufnum, &ring, state, sub)? {
                trace!("{}: sub-buffer {sub} not released", slot.spec.name);
                return Err(Error::Busy);
            }
        }

        let chunks = (0..step).map(|i| {
            let start = (i * ring.buf_size()).min(buf.len());
            let end = ((i + 1) * ring.buf_size()).min(buf.len());
            &buf[start..end]
        });
        for (i, chunk) in chunks.enumerate() {
            let seq = state.send_num;
            let sub = ring.slot(seq);

            let data_off = ring.payload(sub);
            let data_dst = range_start + data_off as u64;
            if !chunk.is_empty() {
                port.write_data.write(data_off, chunk)?;
                self.transfer(
                    port,
                    &block,
                    &mut state.stats.errors,
                    port.write_data.phys_at(data_off)?,
                    data_dst,
                    chunk.len(),
                )?;
            }

            let ctl_off = ring.header(sub);
            let ctl_dst = ctl_range_start + ctl_off as u64;
            let mut header = ControlInfo::filled(self.config.packet_id, bufnum, sub as u8, seq);
            header.part = i as u8;
            if step > 1 {
                header.flags |= ControlFlags::BIS;
                if i == step - 1 {
                    header.flags |= ControlFlags::CEN;
                }
            }
            header.buf_addr = data_dst;
            header.buf_size = chunk.len() as u64;
            header.info_addr = ctl_dst;
            port.write_ctl_data
                .write(ctl_off, &header.encode(self.config.byte_order))?;
            self.transfer(
                port,
                &block,
                &mut state.stats.errors,
                port.write_ctl_data.phys_at(ctl_off)?,
                ctl_dst,
                HEADER_LEN,
            )?;

            state.pending[sub] = Some(seq);
            state.send_num += 1;
            state.stats.sent += 1;
            state.stats.bytes_sent += chunk.len() as u64;
        }
        Ok(())
    }

    /// Whether the next write of a single sub-buffer would find it
    /// released.
    pub fn can_write(&self, fd: ChannelFd) -> Result<bool> {
        let slot = self.slot(fd)?;
        let state = lock(&slot.state)?;
        let sub = slot.ring.slot(state.send_num);
        if state.pending[sub].is_none() {
            return Ok(true);
        }
        let port = self.port(slot.spec.port)?;
        let flags = port
            .write_ctl_result
            .load_acquire(slot.ring.release(sub) + FLAGS_OFFSET)?;
        Ok(ControlFlags::from_bits_truncate(flags).contains(ControlFlags::SET))
    }

    /// Poll for the next sub-buffer and copy its payload into `buf`.
    ///
    /// Never blocks.  The sub-buffer stays held until
    /// [`Self::read_feedback()`] is called with the returned `num`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if nothing has arrived
    /// - [`Error::BufferTooSmall`] if `buf` cannot hold the payload; the
    ///   sub-buffer is left unread
    /// - [`Error::SequenceMismatch`] if the header does not belong to the
    ///   sub-buffer expected next; it is left in place, and the channel
    ///   stays stuck on it until a port `Init` or `Stop` restarts the rings
    pub fn read(&self, fd: ChannelFd, buf: &mut [u8]) -> Result<ReadResult> {
        let max = buf.len();
        self.consume(fd, Some(max), |payload| {
            buf[..payload.len()].copy_from_slice(payload)
        })
        .map(|(result, ())| result)
    }

    /// Poll for the next sub-buffer and hand its payload to `f` in place.
    pub fn read_with<R>(&self, fd: ChannelFd, f: impl FnOnce(&[u8]) -> R) -> Result<(ReadResult, R)> {
        self.consume(fd, None, f)
    }

    /// Length of the payload waiting in the next sub-buffer, if any.
    pub fn data_available(&self, fd: ChannelFd) -> Result<Option<usize>> {
        let slot = self.slot(fd)?;
        let state = lock(&slot.state)?;
        let port = self.port(slot.spec.port)?;
        let sub = slot.ring.slot(state.read_num);
        let header = slot.ring.header(sub);
        let flags = port.write_ctl_result.load_acquire(header + FLAGS_OFFSET)?;
        if !ControlFlags::from_bits_truncate(flags).contains(ControlFlags::FLA) {
            return Ok(None);
        }
        let mut raw = [0u8; HEADER_LEN];
        port.write_ctl_result.read(header, &mut raw)?;
        Ok(Some(
            ControlInfo::decode(&raw, self.config.byte_order)?.buf_size as usize,
        ))
    }

    /// Release sub-buffer `num` back to the peer.
    ///
    /// Must be called once for every successful read.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidOperation`] if `num` holds no unreleased read
    /// - [`Error::DmaTransferFailed`] / [`Error::Timeout`]: counted; the
    ///   sub-buffer stays held and feedback may be retried
    pub fn read_feedback(&self, fd: ChannelFd, num: usize) -> Result<()> {
        let slot = self.slot(fd)?;
        let ring = slot.ring;
        if num >= ring.sub_buf_count() {
            return Err(Error::OutOfRange);
        }

        let mut guard = lock(&slot.state)?;
        let state = &mut *guard;
        let block = state.block.clone().ok_or(Error::InvalidOperation)?;
        let seq = state.outstanding[num].ok_or(Error::InvalidOperation)?;
        let ChannelSpec { port, bufnum, .. } = slot.spec;
        let port = self.port(port)?;

        let off = ring.release(num);
        let dst = port.ctl_range_start()? + off as u64;
        let mut header = ControlInfo::released(self.config.packet_id, bufnum, num as u8, seq);
        header.info_addr = dst;
        port.write_ctl_data
            .write(off, &header.encode(self.config.byte_order))?;
        self.transfer(
            port,
            &block,
            &mut state.stats.errors,
            port.write_ctl_data.phys_at(off)?,
            dst,
            HEADER_LEN,
        )?;

        state.outstanding[num] = None;
        state.stats.released += 1;
        Ok(())
    }

    pub fn stats(&self, fd: ChannelFd) -> Result<ChannelStats> {
        let slot = self.slot(fd)?;
        Ok(lock(&slot.state)?.stats)
    }

    /// DMA failures counted on `port`.
    pub fn port_error_count(&self, port: u8) -> Result<u64> {
        Ok(self.port(port)?.error_count())
    }

    pub fn port_state(&self, port: u8) -> Result<PortState> {
        Ok(self.port(port)?.state())
    }

    /// Bring a down or failed port back up, reprogramming its windows.
    pub fn reprobe_port(&self, port: u8) -> Result<()> {
        info!("Re-probing port {port}");
        self.port(port)?.bring_up(&self.platform, &self.config)
    }

    /// The control block for `(port, bufnum)`, shared with any open
    /// channel using the pair.
    pub fn get_control_block(&self, port: u8, bufnum: u8) -> Result<Arc<ControlBlock<P::Channel>>> {
        self.blocks.get(&self.platform, port, bufnum)
    }

    /// Where `port` is in the command exchange with its peer.
    pub fn port_mode(&self, port: u8) -> Result<PortMode> {
        Ok(self.port(port)?.mode())
    }

    /// Send `command` to the peer on `port` and wait for its
    /// acknowledgement.
    ///
    /// Both ends carry their ring geometry, and each refuses a command or
    /// acknowledgement whose geometry differs from its own.  The peer
    /// answers from [`Self::serve_port_command()`].  Once `Init` or `Stop`
    /// is acknowledged, every channel ring on the port starts again from
    /// sequence 0 at both ends; no channel on the port may be used until
    /// the call returns.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidOperation`] for `Start` on a started port or
    ///   `Stop` on a stopped one; nothing is sent
    /// - [`Error::Timeout`] if no acknowledgement arrives within
    ///   `command_timeout`
    /// - [`Error::InvalidConfig`] if the peer refused the command or its
    ///   geometry differs
    pub fn port_command(&self, port: u8, command: PortCommand) -> Result<()> {
        let pool = self.port(port)?;
        let mode = pool.mode();
        if (command == PortCommand::Start && mode == PortMode::Started)
            || (command == PortCommand::Stop && mode == PortMode::Stopped)
        {
            warn!("Port {port}: {command:?} while {mode:?}");
            return Err(Error::InvalidOperation);
        }

        let layout = pool.layout();
        let ack_slot = layout.ack_slot();
        let ours = self.config.geometry();
        pool.write_ctl_result.store_release(ack_slot, 0)?;
        {
            let block = self.port_block(port)?;
            let message = PortMessage::command(command, ours);
            self.send_port_message(pool, &block, layout.command_slot, &message)?;
        }
        debug!("Port {port}: sent {command:?}");

        let deadline = Instant::now() + self.config.command_timeout;
        let ack = loop {
            if pool.write_ctl_result.load_acquire(ack_slot)? != 0 {
                let mut raw = [0u8; PORT_MESSAGE_LEN];
                pool.write_ctl_result.read(ack_slot, &mut raw)?;
                pool.write_ctl_result.store_release(ack_slot, 0)?;
                match PortMessage::decode(&raw, self.config.byte_order) {
                    Ok(message) if message.ack && message.command == command => break message,
                    other => warn!("Port {port}: ignoring {other:?} while waiting for {command:?}"),
                }
            }
            if Instant::now() >= deadline {
                error!(
                    "Port {port}: {command:?} not acknowledged within {:?}",
                    self.config.command_timeout
                );
                return Err(Error::Timeout);
            }
            thread::sleep(COMMAND_POLL);
        };

        if !ack.accepted || ack.geometry != ours {
            error!(
                "Port {port}: {command:?} refused, peer geometry {:?}, ours {ours:?}",
                ack.geometry
            );
            return Err(Error::InvalidConfig);
        }
        if matches!(command, PortCommand::Init | PortCommand::Stop) {
            for slot in self.channels.iter().filter(|c| c.spec.port == port) {
                lock(&slot.state)?.restart();
            }
        }
        pool.set_mode(PortMode::from(command));
        info!("Port {port}: {command:?} acknowledged");
        Ok(())
    }

    /// Answer a port command the peer sent on `port`, if one has landed.
    ///
    /// Never blocks; the end that does not call [`Self::port_command()`]
    /// polls this instead.  On an accepted `Init` or `Stop`, every channel
    /// on the port drops its ring positions and held sub-buffers, and the
    /// header and release slots are cleared at both ends before the
    /// acknowledgement goes out.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the peer's geometry differs from
    ///   ours; the command is acknowledged as refused
    /// - [`Error::InvalidOperation`] if the slot holds something other
    ///   than a command; it is discarded
    pub fn serve_port_command(&self, port: u8) -> Result<Option<PortCommand>> {
        let pool = self.port(port)?;
        let layout = pool.layout();
        let slot = layout.command_slot;
        if pool.write_ctl_result.load_acquire(slot)? == 0 {
            return Ok(None);
        }
        let mut raw = [0u8; PORT_MESSAGE_LEN];
        pool.write_ctl_result.read(slot, &mut raw)?;
        pool.write_ctl_result.store_release(slot, 0)?;
        let message = PortMessage::decode(&raw, self.config.byte_order)
            .inspect_err(|e| warn!("Port {port}: bad command message: {e}"))?;
        if message.ack {
            warn!("Port {port}: acknowledgement in the command slot");
            return Err(Error::InvalidOperation);
        }

        let command = message.command;
        let ours = self.config.geometry();
        let accepted = message.geometry == ours;
        let block = self.port_block(port)?;
        if accepted {
            if matches!(command, PortCommand::Init | PortCommand::Stop) {
                self.restart_rings(pool, &block)?;
            }
            pool.set_mode(PortMode::from(command));
            info!("Port {port}: peer sent {command:?}");
        } else {
            error!(
                "Port {port}: refusing {command:?}, peer geometry {:?}, ours {ours:?}",
                message.geometry
            );
        }

        let ack = PortMessage::ack(command, accepted, ours);
        self.send_port_message(pool, &block, layout.ack_slot(), &ack)?;
        if accepted {
            Ok(Some(command))
        } else {
            Err(Error::InvalidConfig)
        }
    }

    fn slot(&self, fd: ChannelFd) -> Result<&ChannelSlot<P::Channel>> {
        self.channels.get(fd.0).ok_or(Error::InvalidOperation)
    }

    fn port(&self, port: u8) -> Result<&PortPool> {
        self.ports.get(port as usize).ok_or(Error::OutOfRange)
    }

    /// Port commands travel on the port's last DMA channel.
    fn port_block(&self, port: u8) -> Result<Arc<ControlBlock<P::Channel>>> {
        self.blocks
            .get(&self.platform, port, self.config.dma_channels_per_port - 1)
    }

    /// Stage `message` at `offset` and copy it to the same offset at the
    /// peer.
    fn send_port_message(
        &self,
        pool: &PortPool,
        block: &ControlBlock<P::Channel>,
        offset: usize,
        message: &PortMessage,
    ) -> Result<()> {
        let dst = pool.ctl_range_start()? + offset as u64;
        pool.write_ctl_data
            .write(offset, &message.encode(self.config.byte_order))?;
        let mut errors = 0;
        self.transfer(
            pool,
            block,
            &mut errors,
            pool.write_ctl_data.phys_at(offset)?,
            dst,
            PORT_MESSAGE_LEN,
        )
    }

    /// Restart every channel ring on `pool`'s port, clearing its header
    /// and release slots here and at the peer.
    fn restart_rings(&self, pool: &PortPool, block: &ControlBlock<P::Channel>) -> Result<()> {
        let ctl_range_start = pool.ctl_range_start()?;
        for slot in self.channels.iter().filter(|c| c.spec.port == pool.port()) {
            let mut guard = lock(&slot.state)?;
            let state = &mut *guard;
            let (off, len) = slot.ring.ctl_area();
            let zeros = vec![0u8; len];
            pool.write_ctl_result.write(off, &zeros)?;
            pool.write_ctl_data.write(off, &zeros)?;
            self.transfer(
                pool,
                block,
                &mut state.stats.errors,
                pool.write_ctl_data.phys_at(off)?,
                ctl_range_start + off as u64,
                len,
            )?;
            state.restart();
            debug!("{}: rings restarted", slot.spec.name);
        }
        Ok(())
    }

    /// Whether sub-buffer `sub` is free to write, consuming the peer's
    /// feedback for it if that has arrived.
    ///
    /// Feedback that does not match what was written is consumed too and
    /// frees the sub-buffer, but fails the write with
    /// [`Error::SequenceMismatch`].
    fn reclaim(
        &self,
        port: &PortPool,
        bufnum: u8,
        ring: &RingLayout,
        state: &mut ChannelState<P::Channel>,
        sub: usize,
    ) -> Result<bool> {
        let Some(seq) = state.pending[sub] else {
            return Ok(true);
        };

        let off = ring.release(sub);
        let flags = port.write_ctl_result.load_acquire(off + FLAGS_OFFSET)?;
        if !ControlFlags::from_bits_truncate(flags).contains(ControlFlags::SET) {
            return Ok(false);
        }

        let mut raw = [0u8; HEADER_LEN];
        port.write_ctl_result.read(off, &mut raw)?;
        let ack = ControlInfo::decode(&raw, self.config.byte_order)?;
        let matches = ack.sub_buf as usize == sub && ack.channel_id == bufnum && ack.seq == seq;

        // The slot is released either way: a mismatched release still
        // means the peer is done with the sub-buffer.
        port.write_ctl_result.store_release(off + FLAGS_OFFSET, 0)?;
        state.pending[sub] = None;
        if !matches {
            state.stats.errors += 1;
            warn!(
                "Port {} channel {bufnum}: feedback for sub-buffer {} seq {} (fcnt {}), expected {sub} seq {seq}",
                port.port(),
                ack.sub_buf,
                ack.seq,
                ack.fill_count
            );
            return Err(Error::SequenceMismatch);
        }
        Ok(true)
    }

    /// Take the next sub-buffer if its header has landed, passing the
    /// payload to `f` before releasing the header slot.
    fn consume<R>(
        &self,
        fd: ChannelFd,
        max_len: Option<usize>,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<(ReadResult, R)> {
        let slot = self.slot(fd)?;
        let ring = slot.ring;
        let mut guard = lock(&slot.state)?;
        let state = &mut *guard;
        if state.block.is_none() {
            return Err(Error::InvalidOperation);
        }
        let ChannelSpec { port, bufnum, .. } = slot.spec;
        let port = self.port(port)?;

        let seq = state.read_num;
        let sub = ring.slot(seq);
        let off = ring.header(sub);
        let flags = port.write_ctl_result.load_acquire(off + FLAGS_OFFSET)?;
        if !ControlFlags::from_bits_truncate(flags).contains(ControlFlags::FLA) {
            return Err(Error::NotReady);
        }

        let mut raw = [0u8; HEADER_LEN];
        port.write_ctl_result.read(off, &mut raw)?;
        let header = ControlInfo::decode(&raw, self.config.byte_order)?;
        if header.sub_buf as usize != sub || header.channel_id != bufnum || header.seq != seq {
            warn!(
                "{}: header for sub-buffer {} channel {} seq {}, expected {sub} / {bufnum} / {seq}",
                slot.spec.name, header.sub_buf, header.channel_id, header.seq
            );
            return Err(Error::SequenceMismatch);
        }

        let len = header.buf_size as usize;
        if len > ring.buf_size() {
            return Err(Error::PayloadTooLarge);
        }
        if max_len.is_some_and(|max| len > max) {
            return Err(Error::BufferTooSmall);
        }

        // The peer cannot write this sub-buffer again until we send
        // feedback for it.
        let payload = unsafe { port.write_result.slice(ring.payload(sub), len)? };
        let out = f(payload);
        port.write_ctl_result.store_release(off + FLAGS_OFFSET, 0)?;

        state.outstanding[sub] = Some(seq);
        state.read_num += 1;
        state.stats.received += 1;
        state.stats.bytes_received += len as u64;
        trace!("{}: read sub-buffer {sub} seq {seq} len {len}", slot.spec.name);

        let result = ReadResult {
            num: sub,
            len,
            seq,
            part: header.part as usize,
            last: header.ends_write(),
        };
        Ok((result, out))
    }

    /// One DMA transfer, with failure accounting.
    fn transfer(
        &self,
        port: &PortPool,
        block: &ControlBlock<P::Channel>,
        errors: &mut u64,
        src: u64,
        dst: u64,
        len: usize,
    ) -> Result<()> {
        match block.send(src, dst, len, self.config.dma_timeout) {
            Ok(()) => {
                port.record_success();
                Ok(())
            }
            Err(e) if e.is_transfer_error() => {
                *errors += 1;
                let errors = port.record_failure(self.config.link_failure_threshold);
                warn!(
                    "Port {} channel {}: {e} ({dst:#x} len {len:#x}), error count {errors}",
                    block.port(),
                    block.bufnum()
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

impl<P: Platform> Drop for TransportContext<P> {
    fn drop(&mut self) {
        // The port pools go with `self`; control blocks that outlive it
        // hold no regions.
        if let Some(pool) = self.data_pool.take() {
            unsafe { pool.free(&self.platform) };
        }
        if let Some(pool) = self.ctl_pool.take() {
            unsafe { pool.free(&self.platform) };
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::Resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ByteOrder;
    use crate::loopback::{LoopbackFabric, LoopbackNode};

    fn config() -> TransportConfig {
        TransportConfig {
            port_count: 1,
            dma_channels_per_port: 2,
            sub_buf_count: 4,
            buf_size: 0x100,
            source_ids: vec![0x11],
            target_ids: vec![0x14],
            channels: TransportConfig::default_channels(1, 2),
            ..Default::default()
        }
    }

    fn pair() -> (TransportContext<LoopbackNode>, TransportContext<LoopbackNode>) {
        let (a, b) = LoopbackFabric::pair(1);
        (
            TransportContext::new(a, config()).unwrap(),
            TransportContext::new(b, config()).unwrap(),
        )
    }

    /// Poll `ctx` until it has answered a port command.
    fn serve(ctx: &TransportContext<LoopbackNode>, port: u8) -> Result<PortCommand> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(command) = ctx.serve_port_command(port)? {
                return Ok(command);
            }
            assert!(Instant::now() < deadline, "no port command arrived");
            thread::yield_now();
        }
    }

    #[test]
    fn write_is_busy_until_released() {
        let (tx, rx) = pair();
        let wfd = tx.open("srio0-chan1").unwrap();
        let rfd = rx.open("srio0-chan1").unwrap();

        for i in 0..4u8 {
            tx.write(wfd, &[i; 16]).unwrap();
        }
        assert!(!tx.can_write(wfd).unwrap());
        assert_eq!(tx.write(wfd, &[4; 16]).unwrap_err(), Error::Busy);

        let mut buf = [0u8; 0x100];
        let result = rx.read(rfd, &mut buf).unwrap();
        assert_eq!(
            result,
            ReadResult {
                num: 0,
                len: 16,
                seq: 0,
                part: 0,
                last: true
            }
        );
        assert_eq!(tx.write(wfd, &[4; 16]).unwrap_err(), Error::Busy);

        rx.read_feedback(rfd, 0).unwrap();
        assert!(tx.can_write(wfd).unwrap());
        tx.write(wfd, &[4; 16]).unwrap();
        assert_eq!(tx.stats(wfd).unwrap().sent, 5);
    }

    #[test]
    fn multi_sub_buffer_write_flags() {
        let (tx, rx) = pair();
        let wfd = tx.open("srio0-chan0").unwrap();
        let rfd = rx.open("srio0-chan0").unwrap();

        let payload: Vec<u8> = (0..0x250).map(|i| i as u8).collect();
        tx.write(wfd, &payload).unwrap();
        assert_eq!(tx.stats(wfd).unwrap().sent, 3);

        let ctl = &rx.ports[0].write_ctl_result;
        let mut raw = [0u8; HEADER_LEN];
        ctl.read(RingLayout::new(rx.config(), 0).header(2), &mut raw).unwrap();
        let last = ControlInfo::decode(&raw, ByteOrder::Little).unwrap();
        assert!(last.flags.contains(ControlFlags::FLA | ControlFlags::BIS | ControlFlags::CEN));
        assert_eq!(last.buf_size, 0x50);
        assert_eq!(last.part, 2);

        let mut out = Vec::new();
        let mut buf = [0u8; 0x100];
        for part in 0..3 {
            let result = rx.read(rfd, &mut buf).unwrap();
            assert_eq!(result.part, part);
            assert_eq!(result.last, part == 2);
            out.extend_from_slice(&buf[..result.len]);
            rx.read_feedback(rfd, result.num).unwrap();
        }
        assert_eq!(out, payload);
        assert_eq!(rx.read(rfd, &mut buf).unwrap_err(), Error::NotReady);
    }

    #[test]
    fn small_buffer_leaves_data_unread() {
        let (tx, rx) = pair();
        let wfd = tx.open("srio0-chan0").unwrap();
        let rfd = rx.open("srio0-chan0").unwrap();
        tx.write(wfd, &[7; 32]).unwrap();

        assert_eq!(rx.data_available(rfd).unwrap(), Some(32));
        let mut small = [0u8; 8];
        assert_eq!(rx.read(rfd, &mut small).unwrap_err(), Error::BufferTooSmall);

        let (result, sum) = rx
            .read_with(rfd, |payload| payload.iter().map(|&b| b as u32).sum::<u32>())
            .unwrap();
        assert_eq!(result.len, 32);
        assert_eq!(sum, 7 * 32);
        assert_eq!(rx.data_available(rfd).unwrap(), None);
    }

    #[test]
    fn feedback_needs_a_read() {
        let (_tx, rx) = pair();
        let rfd = rx.open("srio0-chan0").unwrap();
        assert_eq!(rx.read_feedback(rfd, 0).unwrap_err(), Error::InvalidOperation);
        assert_eq!(rx.read_feedback(rfd, 4).unwrap_err(), Error::OutOfRange);
    }

    #[test]
    fn open_and_close() {
        let (tx, _rx) = pair();
        let fd = tx.open("srio0-chan0").unwrap();
        assert_eq!(tx.open("srio0-chan0").unwrap_err(), Error::Busy);
        assert_eq!(tx.open("srio3-chan0").unwrap_err(), Error::NotFound);

        tx.close(fd).unwrap();
        assert_eq!(tx.close(fd).unwrap_err(), Error::InvalidOperation);
        assert_eq!(tx.write(fd, b"closed").unwrap_err(), Error::InvalidOperation);
        assert_eq!(tx.open("srio0-chan0").unwrap(), fd);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let (tx, _rx) = pair();
        let fd = tx.open("srio0-chan0").unwrap();
        assert_eq!(tx.write(fd, &[0; 0x401]).unwrap_err(), Error::PayloadTooLarge);
        assert_eq!(tx.write_step(fd, &[0; 0x101], 1).unwrap_err(), Error::PayloadTooLarge);
        assert_eq!(tx.write_step(fd, &[], 0).unwrap_err(), Error::InvalidOperation);
        assert_eq!(tx.stats(fd).unwrap(), ChannelStats::default());
    }

    #[test]
    fn padded_write_sends_empty_sub_buffers() {
        let (tx, rx) = pair();
        let wfd = tx.open("srio0-chan0").unwrap();
        let rfd = rx.open("srio0-chan0").unwrap();
        let transfers = tx.platform().transfers();

        tx.write_step(wfd, &[5; 0x150], 4).unwrap();
        // Two payload copies, four headers
        assert_eq!(tx.platform().transfers() - transfers, 6);
        let stats = tx.stats(wfd).unwrap();
        assert_eq!((stats.sent, stats.bytes_sent), (4, 0x150));

        let mut buf = [0u8; 0x100];
        let mut reads = Vec::new();
        for _ in 0..4 {
            let result = rx.read(rfd, &mut buf).unwrap();
            assert!(buf[..result.len].iter().all(|&b| b == 5));
            reads.push((result.len, result.part, result.last));
            rx.read_feedback(rfd, result.num).unwrap();
        }
        assert_eq!(
            reads,
            [(0x100, 0, false), (0x50, 1, false), (0, 2, false), (0, 3, true)]
        );
        assert!(tx.can_write(wfd).unwrap());
    }

    #[test]
    fn stale_feedback_frees_the_sub_buffer() {
        let (tx, _rx) = pair();
        let wfd = tx.open("srio0-chan1").unwrap();
        for i in 0..4u8 {
            tx.write(wfd, &[i; 16]).unwrap();
        }

        // A release for sub-buffer 0 carrying the wrong sequence number
        let ring = RingLayout::new(tx.config(), 1);
        let ctl = &tx.ports[0].write_ctl_result;
        let stale = ControlInfo::released(0, 1, 0, 99);
        ctl.write(ring.release(0), &stale.encode(ByteOrder::Little)).unwrap();

        assert_eq!(tx.write(wfd, &[4; 16]).unwrap_err(), Error::SequenceMismatch);
        assert_eq!(ctl.load_acquire(ring.release(0) + FLAGS_OFFSET).unwrap(), 0);
        let stats = tx.stats(wfd).unwrap();
        assert_eq!((stats.sent, stats.errors), (4, 1));

        tx.write(wfd, &[4; 16]).unwrap();
        assert_eq!(tx.stats(wfd).unwrap().sent, 5);
        assert_eq!(tx.write(wfd, &[5; 16]).unwrap_err(), Error::Busy);
    }

    #[test]
    fn stray_header_holds_the_channel_until_restart() {
        let (tx, rx) = pair();
        let wfd = tx.open("srio0-chan0").unwrap();
        let rfd = rx.open("srio0-chan0").unwrap();

        let ring = RingLayout::new(rx.config(), 0);
        let stray = ControlInfo::filled(0, 0, 0, 7);
        rx.ports[0]
            .write_ctl_result
            .write(ring.header(0), &stray.encode(ByteOrder::Little))
            .unwrap();

        let mut buf = [0u8; 0x100];
        for _ in 0..2 {
            assert_eq!(rx.read(rfd, &mut buf).unwrap_err(), Error::SequenceMismatch);
        }

        thread::scope(|s| {
            let peer = s.spawn(|| serve(&tx, 0));
            rx.port_command(0, PortCommand::Stop).unwrap();
            assert_eq!(peer.join().unwrap().unwrap(), PortCommand::Stop);
        });
        assert_eq!(rx.read(rfd, &mut buf).unwrap_err(), Error::NotReady);
        assert_eq!(rx.port_mode(0).unwrap(), PortMode::Stopped);
        assert_eq!(tx.port_mode(0).unwrap(), PortMode::Stopped);

        tx.write(wfd, b"after").unwrap();
        let result = rx.read(rfd, &mut buf).unwrap();
        assert_eq!((result.seq, &buf[..result.len]), (0, &b"after"[..]));
    }

    #[test]
    fn port_command_checks_geometry() {
        let (a, b) = LoopbackFabric::pair(1);
        let tx = TransportContext::new(a, config()).unwrap();
        let other = TransportConfig {
            sub_buf_count: 8,
            ..config()
        };
        let rx = TransportContext::new(b, other).unwrap();

        thread::scope(|s| {
            let peer = s.spawn(|| serve(&rx, 0));
            assert_eq!(
                tx.port_command(0, PortCommand::Init).unwrap_err(),
                Error::InvalidConfig
            );
            assert_eq!(peer.join().unwrap().unwrap_err(), Error::InvalidConfig);
        });
        assert_eq!(tx.port_mode(0).unwrap(), PortMode::Idle);
        assert_eq!(rx.port_mode(0).unwrap(), PortMode::Idle);
    }

    #[test]
    fn start_and_stop_follow_the_mode() {
        let (tx, rx) = pair();
        for command in [PortCommand::Init, PortCommand::Start] {
            thread::scope(|s| {
                let peer = s.spawn(|| serve(&rx, 0));
                tx.port_command(0, command).unwrap();
                assert_eq!(peer.join().unwrap().unwrap(), command);
            });
        }
        assert_eq!(tx.port_mode(0).unwrap(), PortMode::Started);
        assert_eq!(rx.port_mode(0).unwrap(), PortMode::Started);

        let sent = tx.platform().transfers();
        assert_eq!(
            tx.port_command(0, PortCommand::Start).unwrap_err(),
            Error::InvalidOperation
        );
        assert_eq!(tx.platform().transfers(), sent);
        assert_eq!(rx.serve_port_command(0).unwrap(), None);
    }
}
