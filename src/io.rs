//! Hardware collaborator traits.
//!
//! The transport never programs hardware directly.  It consumes three
//! collaborators:
//!
//! - [`DmaMemory`] - hands out DMA-capable memory with both a physical
//!   (device-visible) and virtual (CPU-visible) address
//! - [`LinkLayer`] - RapidIO port bring-up and window mapping
//! - [`DmaController`] / [`DmaChannel`] - the DMA engines that copy from
//!   local physical memory to fabric addresses
//!
//! [`Platform`] bundles all three, and is what
//! [`crate::channel::TransportContext`] is generic over.
//!
//! # Possible implementations
//!
//! - On a RapidIO SoC: user-space DMA memory maps, the SRIO UIO driver and
//!   the DMA engine driver
//! - For testing: [`crate::loopback`], a software fabric connecting two
//!   nodes
//!
//! # Address Space
//!
//! Physical addresses are 64-bit.  Outbound window addresses
//! (`range_start` and above) are local addresses that the port translates
//! into peer system addresses; inbound windows translate system addresses
//! back into the receiving node's physical memory.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::time::Duration;

use crate::Result;
use crate::pool::DmaRegion;

/// DMA memory mapping.
pub trait DmaMemory {
    /// Allocate `size` bytes of DMA-capable memory aligned to `align`.
    ///
    /// The returned region is zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfMemory`] if the underlying mapping
    /// cannot satisfy the request.  This is not retried.
    fn alloc(&self, size: usize, align: usize) -> Result<DmaRegion>;

    /// Return a region obtained from [`Self::alloc()`].
    ///
    /// # Safety
    ///
    /// Neither `region` nor any region carved from it may be used after
    /// this call.
    unsafe fn free(&self, region: &DmaRegion);
}

/// What the link layer reports for a connected port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    /// Start of the outbound range; DMA destinations at and above this
    /// address are routed through the port's outbound windows.
    pub range_start: u64,
    /// Size of the outbound range
    pub range_size: u64,
}

/// RapidIO link bring-up and window programming.
///
/// Window IDs are per port.  Sizes are powers of two.
pub trait LinkLayer {
    /// Attempt to bring the port up.  Returns whether it is connected.
    fn connect(&self, port: u8) -> bool;

    /// Outbound range information for a connected port.
    fn port_info(&self, port: u8) -> Result<PortInfo>;

    /// Make `size` bytes at `local_phys` reachable by the peer at system
    /// address `sys_addr`.
    fn set_inbound_window(
        &self,
        port: u8,
        window: u8,
        local_phys: u64,
        sys_addr: u64,
        size: u64,
    ) -> Result<()>;

    /// Route local addresses `range_addr..range_addr + size` to the peer's
    /// system address `sys_addr`.
    fn set_outbound_window(
        &self,
        port: u8,
        window: u8,
        range_addr: u64,
        sys_addr: u64,
        size: u64,
    ) -> Result<()>;

    /// Set the read/write transaction attributes of an outbound window.
    fn set_outbound_window_attr(&self, port: u8, window: u8, read: u32, write: u32)
    -> Result<()>;

    /// Set this end's device ID on `port`.
    fn set_device_id(&self, port: u8, device_id: u32) -> Result<()>;

    /// Tag transactions through `window` with `target_id`.
    fn set_target_id(&self, port: u8, window: u8, target_id: u32) -> Result<()>;
}

/// One DMA engine instance, able to run one copy at a time.
///
/// Dropping the channel releases the engine.
pub trait DmaChannel: Send {
    /// Set the burst/chunking byte watermark.
    fn set_burst_watermark(&mut self, bytes: u32);

    /// Start a copy of `len` bytes from `src_phys` to `dst_phys`.
    fn start(&mut self, src_phys: u64, dst_phys: u64, len: usize) -> Result<()>;

    /// Wait for the started copy to finish.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::DmaTransferFailed`] if the engine reported an error
    /// - [`crate::Error::Timeout`] if the copy did not complete in `timeout`;
    ///   the copy is still in flight until [`Self::abort()`] is called
    fn wait(&mut self, timeout: Duration) -> Result<()>;

    /// Abandon the copy in flight, if any, leaving the engine ready for
    /// the next [`Self::start()`].
    ///
    /// Called after a [`crate::Error::Timeout`].  Bytes the copy already
    /// moved stay where they landed.
    fn abort(&mut self);
}

/// Factory for DMA engines.
pub trait DmaController {
    /// DMA engine type
    type Channel: DmaChannel;

    /// Initialize engine `channel` on `port` in basic direct mode.
    fn channel_init(&self, port: u8, channel: u8) -> Result<Self::Channel>;
}

/// Everything the transport needs from the hardware.
pub trait Platform: DmaMemory + LinkLayer + DmaController + Send + Sync + 'static {}

impl<T> Platform for T where T: DmaMemory + LinkLayer + DmaController + Send + Sync + 'static {}
