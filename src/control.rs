//! Control block pool.
//!
//! A [`ControlBlock`] owns the DMA engine for one (port, DMA channel
//! number) pair.  Blocks are created lazily and shared: asking again for a
//! pair that is still in use returns the same block, and the engine is
//! released when the last holder drops it.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::time::Duration;
use std::sync::{Arc, Mutex, Weak};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::{DmaChannel, DmaController};
use crate::{Error, Result};

/// One DMA engine, bound to a (port, DMA channel number) pair.
#[derive(Debug)]
pub struct ControlBlock<C: DmaChannel> {
    port: u8,
    bufnum: u8,
    engine: Mutex<C>,
}

impl<C: DmaChannel> ControlBlock<C> {
    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn bufnum(&self) -> u8 {
        self.bufnum
    }

    /// Copy `len` bytes from local `src_phys` to `dst_phys` and block until
    /// the engine finishes, or `timeout` passes.
    ///
    /// One transfer runs at a time per block; concurrent callers queue on
    /// the engine.  A transfer that times out is aborted, so the block is
    /// usable again straight away; whatever part of it landed stays.
    pub fn send(&self, src_phys: u64, dst_phys: u64, len: usize, timeout: Duration) -> Result<()> {
        let mut engine = self.engine.lock().map_err(|_| Error::Resource)?;
        trace!(
            "DMA {}/{}: {src_phys:#x} -> {dst_phys:#x} len {len:#x}",
            self.port, self.bufnum
        );
        engine.start(src_phys, dst_phys, len)?;
        match engine.wait(timeout) {
            Err(Error::Timeout) => {
                warn!(
                    "DMA {}/{}: no completion in {timeout:?}, aborting",
                    self.port, self.bufnum
                );
                engine.abort();
                Err(Error::Timeout)
            }
            result => result,
        }
    }
}

/// Lazily populated table of control blocks, one slot per (port, DMA
/// channel number) pair.
#[derive(Debug)]
pub struct ControlBlockPool<C: DmaChannel> {
    port_count: u8,
    dma_channels: u8,
    burst_watermark: u32,
    blocks: Mutex<Vec<Weak<ControlBlock<C>>>>,
}

impl<C: DmaChannel> ControlBlockPool<C> {
    pub fn new(port_count: u8, dma_channels: u8, burst_watermark: u32) -> Self {
        let slots = port_count as usize * dma_channels as usize;
        Self {
            port_count,
            dma_channels,
            burst_watermark,
            blocks: Mutex::new(vec![Weak::new(); slots]),
        }
    }

    /// Get the block for `(port, bufnum)`, initializing its engine if no
    /// block for the pair is alive.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfRange`] for a port or DMA channel number outside
    ///   the configured geometry
    /// - [`Error::Resource`] if the engine cannot be initialized
    pub fn get<D>(&self, controller: &D, port: u8, bufnum: u8) -> Result<Arc<ControlBlock<C>>>
    where
        D: DmaController<Channel = C> + ?Sized,
    {
        if port >= self.port_count || bufnum >= self.dma_channels {
            return Err(Error::OutOfRange);
        }

        let index = self.index(port, bufnum);
        let mut blocks = self.blocks.lock().map_err(|_| Error::Resource)?;
        if let Some(block) = blocks[index].upgrade() {
            return Ok(block);
        }

        let mut engine = controller.channel_init(port, bufnum).map_err(|e| {
            error!("DMA engine init for port {port} channel {bufnum} failed: {e}");
            Error::Resource
        })?;
        engine.set_burst_watermark(self.burst_watermark);

        let block = Arc::new(ControlBlock {
            port,
            bufnum,
            engine: Mutex::new(engine),
        });
        blocks[index] = Arc::downgrade(&block);
        debug!(
            "Control block {port}/{bufnum} created, watermark {}",
            self.burst_watermark
        );
        Ok(block)
    }

    /// Number of blocks currently alive.
    pub fn live(&self) -> usize {
        self.blocks
            .lock()
            .map(|blocks| blocks.iter().filter(|b| b.strong_count() > 0).count())
            .unwrap_or(0)
    }

    fn index(&self, port: u8, bufnum: u8) -> usize {
        port as usize * self.dma_channels as usize + bufnum as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::DmaMemory;
    use crate::loopback::LoopbackFabric;

    #[test]
    fn blocks_are_shared_until_dropped() {
        let (node, _) = LoopbackFabric::pair(2);
        let pool = ControlBlockPool::new(2, 4, 1024);

        let a = pool.get(&node, 1, 3).unwrap();
        let b = pool.get(&node, 1, 3).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!((a.port(), a.bufnum()), (1, 3));
        assert_eq!(node.engines_created(), 1);
        assert_eq!(pool.live(), 1);

        drop(a);
        drop(b);
        assert_eq!(pool.live(), 0);
        assert_eq!(node.engines_live(), 0);

        let _c = pool.get(&node, 1, 3).unwrap();
        assert_eq!(node.engines_created(), 2);
    }

    #[test]
    fn geometry_is_enforced() {
        let (node, _) = LoopbackFabric::pair(2);
        let pool = ControlBlockPool::new(2, 4, 1024);
        assert_eq!(pool.get(&node, 2, 0).unwrap_err(), Error::OutOfRange);
        assert_eq!(pool.get(&node, 0, 4).unwrap_err(), Error::OutOfRange);
        assert_eq!(node.engines_created(), 0);
    }

    #[test]
    fn timed_out_transfer_is_aborted() {
        let (node, _) = LoopbackFabric::pair(1);
        let region = node.alloc(0x1000, 0x1000).unwrap();
        let pool = ControlBlockPool::new(1, 1, 1024);
        let block = pool.get(&node, 0, 0).unwrap();
        let timeout = Duration::from_millis(1);

        node.stall(true);
        assert_eq!(
            block.send(region.phys(), region.phys() + 0x800, 8, timeout).unwrap_err(),
            Error::Timeout
        );
        assert_eq!(node.aborts(), 1);

        node.stall(false);
        block.send(region.phys(), region.phys() + 0x800, 8, timeout).unwrap();
        assert_eq!(node.aborts(), 1);
    }

    #[test]
    fn watermark_is_applied() {
        let (node, _) = LoopbackFabric::pair(1);
        let pool = ControlBlockPool::new(1, 1, 512);
        let _block = pool.get(&node, 0, 0).unwrap();
        assert_eq!(node.burst_watermark(0, 0), Some(512));
    }
}
