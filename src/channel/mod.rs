//! Channel transport.
//!
//! A channel is a named (port, DMA channel number) pair with a ring of
//! `sub_buf_count` sub-buffers in each direction.  [`TransportContext`]
//! owns every channel, and its `open`, `write`, `read`, `read_feedback` and
//! `close` are the application API.  See [`crate`] for the memory layout.
//!
//! Flow control is credit based.  A writer only reuses a sub-buffer once
//! the peer's feedback header for it has landed in the sub-buffer's release
//! slot; until then writes to it fail with [`crate::Error::Busy`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;
pub mod sync;

#[cfg(feature = "async")]
pub use futures::{AsyncChannel, AsyncDelay, AsyncTransport};
pub use sync::TransportContext;

use crate::config::TransportConfig;
use crate::header::HEADER_SLOT;
use crate::{Error, Result};

/// Handle to an open channel: its index in the channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelFd(pub(crate) usize);

impl ChannelFd {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// What a successful read returned.
///
/// A write that spans several sub-buffers is read back one sub-buffer at
/// a time: `part` counts up from 0 and `last` marks the final one.  If a
/// multi-sub-buffer write failed part way, its leading sub-buffers still
/// arrive, without a `last`, and the next `part == 0` starts afresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    /// Sub-buffer the payload arrived in; pass to `read_feedback`
    pub num: usize,
    /// Payload length in bytes
    pub len: usize,
    /// Transfer sequence number
    pub seq: u64,
    /// Position of this sub-buffer within its write
    pub part: usize,
    /// Whether this sub-buffer completes its write
    pub last: bool,
}

/// Per-channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Sub-buffers written
    pub sent: u64,
    pub bytes_sent: u64,
    /// Sub-buffers read
    pub received: u64,
    pub bytes_received: u64,
    /// Feedback headers sent
    pub released: u64,
    /// DMA failures and timeouts
    pub errors: u64,
}

/// Offsets of one channel's slices of its port's regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingLayout {
    sub_buf_count: usize,
    buf_size: usize,
    chan_base: usize,
    ctl_base: usize,
}

impl RingLayout {
    pub(crate) fn new(config: &TransportConfig, bufnum: u8) -> Self {
        Self {
            sub_buf_count: config.sub_buf_count,
            buf_size: config.buf_size,
            chan_base: bufnum as usize * config.chan_size(),
            ctl_base: bufnum as usize * config.ctl_chan_size(),
        }
    }

    pub(crate) fn sub_buf_count(&self) -> usize {
        self.sub_buf_count
    }

    pub(crate) fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Sub-buffer used by transfer `seq`.
    pub(crate) fn slot(&self, seq: u64) -> usize {
        (seq % self.sub_buf_count as u64) as usize
    }

    /// Payload offset of sub-buffer `sub` in the payload regions.
    pub(crate) fn payload(&self, sub: usize) -> usize {
        self.chan_base + sub * self.buf_size
    }

    /// Header offset of sub-buffer `sub` in the control regions.
    pub(crate) fn header(&self, sub: usize) -> usize {
        self.ctl_base + sub * HEADER_SLOT
    }

    /// Release (feedback) slot offset of sub-buffer `sub` in the control
    /// regions.
    pub(crate) fn release(&self, sub: usize) -> usize {
        self.ctl_base + (self.sub_buf_count + sub) * HEADER_SLOT
    }

    /// Offset and length of this channel's header and release slots.
    pub(crate) fn ctl_area(&self) -> (usize, usize) {
        (self.ctl_base, 2 * self.sub_buf_count * HEADER_SLOT)
    }

    /// Sub-buffers needed for a `len` byte write.
    pub(crate) fn step_for(&self, len: usize) -> Result<usize> {
        let step = len.div_ceil(self.buf_size).max(1);
        if step > self.sub_buf_count {
            Err(Error::PayloadTooLarge)
        } else {
            Ok(step)
        }
    }
}
