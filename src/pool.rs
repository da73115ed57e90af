//! DMA pool allocator.
//!
//! A [`DmaPool`] is one contiguous, DMA-capable allocation.  It records
//! both its physical base (what DMA engines and windows are programmed
//! with) and its virtual base (what the CPU reads and writes).  Every
//! offset is valid against both.
//!
//! Pools are carved into [`DmaRegion`]s with a static offset scheme and
//! are never resized.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::DmaMemory;
use crate::{Error, Result};

/// Alignment of every pool allocation.
pub const POOL_ALIGN: usize = 4096;

/// Smallest window a port can map.
pub const MIN_WINDOW_SIZE: u64 = 0x1000;

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Size of the window needed to map `bytes`: the next power of two, and
/// at least [`MIN_WINDOW_SIZE`].  `None` if that does not fit a `u64`.
pub fn window_size(bytes: u64) -> Option<u64> {
    bytes.max(MIN_WINDOW_SIZE).checked_next_power_of_two()
}

/// A span of DMA memory, addressable physically and virtually.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    phys: u64,
    virt: NonNull<u8>,
    size: usize,
}

// The region is a view onto memory owned by the DMA mapping, not by this
// value.  Concurrent access is coordinated by the channel protocol, and
// the mapping is only released through the unsafe `DmaMemory::free`.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Describe `size` bytes at `phys` / `virt`.
    ///
    /// # Safety
    ///
    /// `virt` must point to `size` bytes that stay mapped, and that the DMA
    /// engine reaches at `phys`, for as long as this region or any region
    /// carved from it is used.
    pub unsafe fn new(phys: u64, virt: NonNull<u8>, size: usize) -> Self {
        Self { phys, virt, size }
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Physical address of `offset`.
    pub fn phys_at(&self, offset: usize) -> Result<u64> {
        self.check(offset, 0)?;
        Ok(self.phys + offset as u64)
    }

    /// Carve `len` bytes starting at `offset`.
    pub fn sub(&self, offset: usize, len: usize) -> Result<DmaRegion> {
        self.check(offset, len)?;
        Ok(DmaRegion {
            phys: self.phys + offset as u64,
            // Checked above: offset is within the allocation
            virt: unsafe { self.virt.add(offset) },
            size: len,
        })
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.virt.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy from the region at `offset` into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.virt.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// Nothing, DMA engines included, may write the bytes while the slice
    /// is alive.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(unsafe { core::slice::from_raw_parts(self.virt.as_ptr().add(offset), len) })
    }

    /// Acquire-load the byte at `offset`.  Pairs with the release store a
    /// DMA engine performs when it commits a transfer's first byte.
    pub fn load_acquire(&self, offset: usize) -> Result<u8> {
        Ok(self.atomic_u8(offset)?.load(Ordering::Acquire))
    }

    /// Release-store `value` at `offset`.
    pub fn store_release(&self, offset: usize, value: u8) -> Result<()> {
        self.atomic_u8(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    fn atomic_u8(&self, offset: usize) -> Result<&AtomicU8> {
        self.check(offset, 1)?;
        Ok(unsafe { AtomicU8::from_ptr(self.virt.as_ptr().add(offset)) })
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size && offset <= self.size => Ok(()),
            _ => Err(Error::OutOfRange),
        }
    }
}

/// One contiguous DMA allocation.
#[derive(Debug)]
pub struct DmaPool {
    region: DmaRegion,
}

impl DmaPool {
    /// Allocate `size` bytes aligned to `align` from `memory`.
    ///
    /// The caller must already have a DMA memory mapping large enough for
    /// the request; failure is reported, not retried.
    pub fn init<M: DmaMemory + ?Sized>(memory: &M, size: usize, align: usize) -> Result<Self> {
        if !align.is_power_of_two() {
            return Err(Error::NotAligned);
        }
        if size == 0 {
            return Err(Error::OutOfRange);
        }

        let region = memory.alloc(size, align).inspect_err(|e| {
            error!("DMA pool allocation of {size:#x} bytes failed: {e}");
        })?;
        if region.size() < size {
            // Nothing but this function has seen the region
            unsafe { memory.free(&region) };
            return Err(Error::OutOfMemory);
        }
        if region.phys() % align as u64 != 0 {
            unsafe { memory.free(&region) };
            return Err(Error::NotAligned);
        }

        debug!(
            "DMA pool phys {:#x} size {size:#x} align {align:#x}",
            region.phys()
        );
        Ok(Self { region })
    }

    pub fn physical_base(&self) -> u64 {
        self.region.phys()
    }

    pub fn virtual_base(&self) -> NonNull<u8> {
        self.region.virt()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn region(&self) -> &DmaRegion {
        &self.region
    }

    /// Carve section `index` of a pool split into `section_size` pieces.
    pub fn section(&self, index: usize, section_size: usize) -> Result<DmaRegion> {
        let offset = index.checked_mul(section_size).ok_or(Error::OutOfRange)?;
        self.region.sub(offset, section_size)
    }

    /// Return the memory to `memory`.
    ///
    /// Regions are plain views the compiler cannot track, so freeing is
    /// `unsafe`:
    ///
    /// ```compile_fail
    /// use srio_channel::loopback::LoopbackFabric;
    /// use srio_channel::pool::{DmaPool, POOL_ALIGN};
    ///
    /// let (node, _) = LoopbackFabric::pair(1);
    /// let pool = DmaPool::init(&node, 0x1000, POOL_ALIGN).unwrap();
    /// let region = pool.section(0, 0x1000).unwrap();
    /// pool.free(&node);
    /// region.write(0, b"gone").unwrap();
    /// ```
    ///
    /// # Safety
    ///
    /// No [`DmaRegion`] obtained from this pool, through [`Self::region()`]
    /// or [`Self::section()`], may be used afterwards, and no DMA engine may
    /// still target the memory.
    pub unsafe fn free<M: DmaMemory + ?Sized>(self, memory: &M) {
        unsafe { memory.free(&self.region) };
    }
}
