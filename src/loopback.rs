//! Software RapidIO fabric.
//!
//! [`LoopbackFabric::pair()`] builds two nodes whose ports are cabled
//! together: port `p` of node 0 talks to port `p` of node 1.  Each node
//! implements every collaborator trait in [`crate::io`]:
//!
//! - DMA memory is heap memory, zeroed, at made-up physical addresses that
//!   are unique across the fabric
//! - inbound and outbound windows are recorded and used to route DMA
//!   destinations to the peer's memory
//! - DMA engines copy synchronously when started
//!
//! The copy writes bytes from last to first and commits byte 0 with a
//! release store, so a poller that acquire-loads a header's flag byte sees
//! the whole header (and the payload DMA'd before it).
//!
//! Memory still allocated when the last node is dropped is leaked rather
//! than freed, so regions handed out stay valid.
//!
//! Nodes also expose fault injection, for exercising failure paths:
//! [`LoopbackNode::fail_every()`], [`LoopbackNode::stall()`] and
//! [`LoopbackNode::set_connected()`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};
use core::time::Duration;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::{DmaChannel, DmaController, DmaMemory, LinkLayer, PortInfo};
use crate::pool::{DmaRegion, align_up};
use crate::{Error, Result};

/// Physical base of each node's made-up DMA memory.
const PHYS_BASES: [u64; 2] = [0x1_0000_0000, 0x2_0000_0000];

/// Outbound range of port 0; further ports follow at [`RANGE_STRIDE`].
const RANGE_BASE: u64 = 0xC000_0000;
const RANGE_STRIDE: u64 = 0x1000_0000;

#[derive(Debug)]
struct Allocation {
    phys: u64,
    virt: usize,
    layout: Layout,
}

/// An inbound window, as programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundWindow {
    pub window: u8,
    pub local_phys: u64,
    pub sys_addr: u64,
    pub size: u64,
}

/// An outbound window, as programmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboundWindow {
    pub window: u8,
    pub range_addr: u64,
    pub sys_addr: u64,
    pub size: u64,
    pub read_attr: u32,
    pub write_attr: u32,
    pub target_id: Option<u32>,
}

#[derive(Debug, Default)]
struct PortModel {
    connected: bool,
    device_id: Option<u32>,
    inbound: Vec<InboundWindow>,
    outbound: Vec<OutboundWindow>,
}

#[derive(Debug)]
struct NodeState {
    next_phys: u64,
    allocations: Vec<Allocation>,
    allocated: usize,
    memory_limit: Option<usize>,
    ports: Vec<PortModel>,
    watermarks: HashMap<(u8, u8), u32>,
    engines_live: usize,
    engines_created: usize,
    transfers: u64,
    fail_every: Option<u64>,
    failures_injected: u64,
    aborts: u64,
    stalled: bool,
}

impl NodeState {
    fn new(id: usize, port_count: u8) -> Self {
        Self {
            next_phys: PHYS_BASES[id],
            allocations: Vec::new(),
            allocated: 0,
            memory_limit: None,
            ports: (0..port_count)
                .map(|_| PortModel {
                    connected: true,
                    ..Default::default()
                })
                .collect(),
            watermarks: HashMap::new(),
            engines_live: 0,
            engines_created: 0,
            transfers: 0,
            fail_every: None,
            failures_injected: 0,
            aborts: 0,
            stalled: false,
        }
    }

    fn port(&self, port: u8) -> Result<&PortModel> {
        self.ports.get(port as usize).ok_or(Error::OutOfRange)
    }

    fn port_mut(&mut self, port: u8) -> Result<&mut PortModel> {
        self.ports.get_mut(port as usize).ok_or(Error::OutOfRange)
    }

    /// Virtual address of `len` bytes at `phys`, if they are all inside one
    /// allocation.
    fn resolve(&self, phys: u64, len: usize) -> Option<usize> {
        self.allocations.iter().find_map(|a| {
            let size = a.layout.size() as u64;
            let end = phys.checked_add(len as u64)?;
            if phys >= a.phys && end <= a.phys + size {
                Some(a.virt + (phys - a.phys) as usize)
            } else {
                None
            }
        })
    }
}

#[derive(Debug)]
struct FabricState {
    nodes: [NodeState; 2],
}

/// Builder for a pair of cabled nodes.
pub struct LoopbackFabric;

impl LoopbackFabric {
    /// Two nodes with `port_count` ports each, all connected.
    pub fn pair(port_count: u8) -> (LoopbackNode, LoopbackNode) {
        let state = Arc::new(Mutex::new(FabricState {
            nodes: [NodeState::new(0, port_count), NodeState::new(1, port_count)],
        }));
        (
            LoopbackNode {
                id: 0,
                state: state.clone(),
            },
            LoopbackNode { id: 1, state },
        )
    }
}

/// One end of a [`LoopbackFabric`].
#[derive(Debug, Clone)]
pub struct LoopbackNode {
    id: usize,
    state: Arc<Mutex<FabricState>>,
}

impl LoopbackNode {
    fn lock(&self) -> MutexGuard<'_, FabricState> {
        // Poisoning is ignored: fabric state stays consistent between calls
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_node<T>(&self, f: impl FnOnce(&mut NodeState) -> T) -> T {
        let mut state = self.lock();
        f(&mut state.nodes[self.id])
    }

    /// Cap the DMA memory this node hands out.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.with_node(|n| n.memory_limit = Some(bytes));
    }

    /// Set whether `port` reports connected.  A disconnected port fails
    /// every DMA routed through it.
    pub fn set_connected(&self, port: u8, connected: bool) {
        self.with_node(|n| {
            if let Some(p) = n.ports.get_mut(port as usize) {
                p.connected = connected;
            }
        });
    }

    /// Fail every `n`th DMA transfer started on this node; `0` stops
    /// injecting failures.
    pub fn fail_every(&self, n: u64) {
        self.with_node(|node| node.fail_every = (n > 0).then_some(n));
    }

    /// Stall this node's engines: transfers started while stalled never
    /// complete, and stay in flight until aborted.
    pub fn stall(&self, stalled: bool) {
        self.with_node(|n| n.stalled = stalled);
    }

    /// DMA engines currently initialized and not dropped.
    pub fn engines_live(&self) -> usize {
        self.with_node(|n| n.engines_live)
    }

    /// DMA engines initialized so far.
    pub fn engines_created(&self) -> usize {
        self.with_node(|n| n.engines_created)
    }

    /// Transfers started so far.
    pub fn transfers(&self) -> u64 {
        self.with_node(|n| n.transfers)
    }

    /// Failures injected by [`Self::fail_every()`] so far.
    pub fn failures_injected(&self) -> u64 {
        self.with_node(|n| n.failures_injected)
    }

    /// Transfers abandoned with [`DmaChannel::abort()`] so far.
    pub fn aborts(&self) -> u64 {
        self.with_node(|n| n.aborts)
    }

    /// Last burst watermark set on engine `(port, channel)`.
    pub fn burst_watermark(&self, port: u8, channel: u8) -> Option<u32> {
        self.with_node(|n| n.watermarks.get(&(port, channel)).copied())
    }

    pub fn inbound_windows(&self, port: u8) -> Vec<InboundWindow> {
        self.with_node(|n| {
            n.port(port)
                .map(|p| p.inbound.clone())
                .unwrap_or_default()
        })
    }

    pub fn outbound_windows(&self, port: u8) -> Vec<OutboundWindow> {
        self.with_node(|n| {
            n.port(port)
                .map(|p| p.outbound.clone())
                .unwrap_or_default()
        })
    }

    pub fn device_id(&self, port: u8) -> Option<u32> {
        self.with_node(|n| n.port(port).ok().and_then(|p| p.device_id))
    }

    /// Run one transfer from this node.  Called with the fabric locked.
    fn transfer(
        state: &mut FabricState,
        id: usize,
        port: u8,
        src: u64,
        dst: u64,
        len: usize,
    ) -> Result<()> {
        let node = &mut state.nodes[id];
        node.transfers += 1;
        if let Some(n) = node.fail_every
            && node.transfers % n == 0
        {
            node.failures_injected += 1;
            debug!("Loopback node {id}: injecting failure on transfer {}", node.transfers);
            return Err(Error::DmaTransferFailed);
        }

        let node = &state.nodes[id];
        let src_virt = node.resolve(src, len).ok_or(Error::DmaTransferFailed)?;
        let dst_virt = Self::route(state, id, port, dst, len)?;
        if len == 0 {
            return Ok(());
        }

        for i in (0..len).rev() {
            let byte = unsafe { *(src_virt as *const u8).add(i) };
            let target = unsafe { AtomicU8::from_ptr((dst_virt as *mut u8).add(i)) };
            if i == 0 {
                target.store(byte, Ordering::Release);
            } else {
                target.store(byte, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Resolve a DMA destination to a virtual address: through an outbound
    /// window and the peer's inbound window, or else as local memory.
    fn route(state: &FabricState, id: usize, port: u8, dst: u64, len: usize) -> Result<usize> {
        let local = &state.nodes[id];
        let end = dst.checked_add(len as u64).ok_or(Error::DmaTransferFailed)?;
        let local_port = local.port(port).map_err(|_| Error::DmaTransferFailed)?;

        let outbound = local_port
            .outbound
            .iter()
            .find(|w| dst >= w.range_addr && dst < w.range_addr + w.size);
        let Some(ob) = outbound else {
            return local.resolve(dst, len).ok_or(Error::DmaTransferFailed);
        };
        if end > ob.range_addr + ob.size {
            return Err(Error::DmaTransferFailed);
        }

        let peer = &state.nodes[1 - id];
        let peer_port = peer.port(port).map_err(|_| Error::DmaTransferFailed)?;
        if !local_port.connected || !peer_port.connected {
            return Err(Error::DmaTransferFailed);
        }

        let sys = ob.sys_addr + (dst - ob.range_addr);
        let sys_end = sys + len as u64;
        let ib = peer_port
            .inbound
            .iter()
            .find(|w| sys >= w.sys_addr && sys_end <= w.sys_addr + w.size)
            .ok_or(Error::DmaTransferFailed)?;
        peer.resolve(ib.local_phys + (sys - ib.sys_addr), len)
            .ok_or(Error::DmaTransferFailed)
    }
}

impl DmaMemory for LoopbackNode {
    fn alloc(&self, size: usize, align: usize) -> Result<DmaRegion> {
        if size == 0 {
            return Err(Error::OutOfRange);
        }
        let layout = Layout::from_size_align(size, align).map_err(|_| Error::NotAligned)?;
        self.with_node(|n| {
            if let Some(limit) = n.memory_limit
                && n.allocated + size > limit
            {
                return Err(Error::OutOfMemory);
            }

            let virt = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(Error::OutOfMemory)?;
            let phys = align_up(n.next_phys as usize, align) as u64;
            n.next_phys = phys + size as u64;
            n.allocated += size;
            n.allocations.push(Allocation {
                phys,
                virt: virt.as_ptr() as usize,
                layout,
            });
            Ok(unsafe { DmaRegion::new(phys, virt, size) })
        })
    }

    unsafe fn free(&self, region: &DmaRegion) {
        self.with_node(|n| {
            if let Some(pos) = n.allocations.iter().position(|a| a.phys == region.phys()) {
                let a = n.allocations.swap_remove(pos);
                n.allocated -= a.layout.size();
                unsafe { dealloc(a.virt as *mut u8, a.layout) };
            }
        });
    }
}

impl LinkLayer for LoopbackNode {
    fn connect(&self, port: u8) -> bool {
        self.with_node(|n| n.port(port).map(|p| p.connected).unwrap_or(false))
    }

    fn port_info(&self, port: u8) -> Result<PortInfo> {
        self.with_node(|n| {
            if !n.port(port)?.connected {
                return Err(Error::LinkNotConnected);
            }
            Ok(PortInfo {
                range_start: RANGE_BASE + port as u64 * RANGE_STRIDE,
                range_size: RANGE_STRIDE,
            })
        })
    }

    fn set_inbound_window(
        &self,
        port: u8,
        window: u8,
        local_phys: u64,
        sys_addr: u64,
        size: u64,
    ) -> Result<()> {
        if !size.is_power_of_two() {
            return Err(Error::NotAligned);
        }
        self.with_node(|n| {
            let p = n.port_mut(port)?;
            p.inbound.retain(|w| w.window != window);
            p.inbound.push(InboundWindow {
                window,
                local_phys,
                sys_addr,
                size,
            });
            Ok(())
        })
    }

    fn set_outbound_window(
        &self,
        port: u8,
        window: u8,
        range_addr: u64,
        sys_addr: u64,
        size: u64,
    ) -> Result<()> {
        if !size.is_power_of_two() {
            return Err(Error::NotAligned);
        }
        self.with_node(|n| {
            let p = n.port_mut(port)?;
            let previous = p.outbound.iter().position(|w| w.window == window);
            let mut ob = previous
                .map(|i| p.outbound.swap_remove(i))
                .unwrap_or_default();
            ob.window = window;
            ob.range_addr = range_addr;
            ob.sys_addr = sys_addr;
            ob.size = size;
            p.outbound.push(ob);
            Ok(())
        })
    }

    fn set_outbound_window_attr(&self, port: u8, window: u8, read: u32, write: u32) -> Result<()> {
        self.with_node(|n| {
            let ob = n
                .port_mut(port)?
                .outbound
                .iter_mut()
                .find(|w| w.window == window)
                .ok_or(Error::InvalidOperation)?;
            ob.read_attr = read;
            ob.write_attr = write;
            Ok(())
        })
    }

    fn set_device_id(&self, port: u8, device_id: u32) -> Result<()> {
        self.with_node(|n| {
            n.port_mut(port)?.device_id = Some(device_id);
            Ok(())
        })
    }

    fn set_target_id(&self, port: u8, window: u8, target_id: u32) -> Result<()> {
        self.with_node(|n| {
            let ob = n
                .port_mut(port)?
                .outbound
                .iter_mut()
                .find(|w| w.window == window)
                .ok_or(Error::InvalidOperation)?;
            ob.target_id = Some(target_id);
            Ok(())
        })
    }
}

impl DmaController for LoopbackNode {
    type Channel = LoopbackEngine;

    fn channel_init(&self, port: u8, channel: u8) -> Result<LoopbackEngine> {
        self.with_node(|n| {
            n.port(port)?;
            n.engines_live += 1;
            n.engines_created += 1;
            Ok(())
        })?;
        Ok(LoopbackEngine {
            node: self.clone(),
            port,
            channel,
            pending: None,
        })
    }
}

/// A loopback DMA engine.
#[derive(Debug)]
pub struct LoopbackEngine {
    node: LoopbackNode,
    port: u8,
    channel: u8,
    pending: Option<Result<()>>,
}

impl DmaChannel for LoopbackEngine {
    fn set_burst_watermark(&mut self, bytes: u32) {
        let key = (self.port, self.channel);
        self.node.with_node(|n| {
            n.watermarks.insert(key, bytes);
        });
    }

    fn start(&mut self, src_phys: u64, dst_phys: u64, len: usize) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        let mut state = self.node.lock();
        let id = self.node.id;
        let result = if state.nodes[id].stalled {
            Err(Error::Timeout)
        } else {
            LoopbackNode::transfer(&mut state, id, self.port, src_phys, dst_phys, len)
        };
        self.pending = Some(result);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<()> {
        match self.pending {
            Some(Err(Error::Timeout)) => {
                std::thread::sleep(timeout);
                Err(Error::Timeout)
            }
            Some(result) => {
                self.pending = None;
                result
            }
            None => Err(Error::InvalidOperation),
        }
    }

    fn abort(&mut self) {
        if self.pending.take().is_some() {
            self.node.with_node(|n| n.aborts += 1);
        }
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.node.with_node(|n| n.engines_live -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_unique_and_freed() {
        let (a, b) = LoopbackFabric::pair(1);
        let ra = a.alloc(0x1000, 0x1000).unwrap();
        let rb = b.alloc(0x1000, 0x1000).unwrap();
        assert_ne!(ra.phys(), rb.phys());

        a.set_memory_limit(0x1800);
        assert_eq!(a.alloc(0x1000, 0x1000).unwrap_err(), Error::OutOfMemory);
        unsafe { a.free(&ra) };
        a.alloc(0x1000, 0x1000).unwrap();
    }

    #[test]
    fn dma_routes_through_windows() {
        let (a, b) = LoopbackFabric::pair(1);
        let src = a.alloc(0x1000, 0x1000).unwrap();
        let dst = b.alloc(0x1000, 0x1000).unwrap();
        src.write(0, b"fabric").unwrap();

        let range = a.port_info(0).unwrap().range_start;
        b.set_inbound_window(0, 1, dst.phys(), 0x1000_0000, 0x1000).unwrap();
        a.set_outbound_window(0, 1, range, 0x1000_0000, 0x1000).unwrap();

        let mut engine = a.channel_init(0, 0).unwrap();
        engine.start(src.phys(), range + 0x10, 6).unwrap();
        engine.wait(Duration::from_millis(10)).unwrap();

        let mut out = [0u8; 6];
        dst.read(0x10, &mut out).unwrap();
        assert_eq!(&out, b"fabric");

        // Past the end of the window
        engine.start(src.phys(), range + 0xffc, 6).unwrap();
        assert_eq!(
            engine.wait(Duration::from_millis(10)).unwrap_err(),
            Error::DmaTransferFailed
        );

        b.set_connected(0, false);
        engine.start(src.phys(), range, 6).unwrap();
        assert_eq!(
            engine.wait(Duration::from_millis(10)).unwrap_err(),
            Error::DmaTransferFailed
        );
    }

    #[test]
    fn faults_are_injected() {
        let (a, _b) = LoopbackFabric::pair(1);
        let src = a.alloc(0x1000, 0x1000).unwrap();
        let mut engine = a.channel_init(0, 0).unwrap();

        a.fail_every(2);
        engine.start(src.phys(), src.phys() + 0x800, 8).unwrap();
        engine.wait(Duration::ZERO).unwrap();
        engine.start(src.phys(), src.phys() + 0x800, 8).unwrap();
        assert_eq!(engine.wait(Duration::ZERO).unwrap_err(), Error::DmaTransferFailed);
        assert_eq!(a.failures_injected(), 1);

        a.fail_every(0);
        a.stall(true);
        engine.start(src.phys(), src.phys() + 0x800, 8).unwrap();
        assert_eq!(
            engine.wait(Duration::from_millis(1)).unwrap_err(),
            Error::Timeout
        );

        // Still in flight until aborted
        a.stall(false);
        assert_eq!(engine.start(src.phys(), src.phys() + 0x800, 8).unwrap_err(), Error::Busy);
        engine.abort();
        assert_eq!(a.aborts(), 1);
        engine.start(src.phys(), src.phys() + 0x800, 8).unwrap();
        engine.wait(Duration::ZERO).unwrap();

        assert_eq!(a.engines_live(), 1);
        drop(engine);
        assert_eq!(a.engines_live(), 0);
    }
}
