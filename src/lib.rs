//! Flow-controlled channel transport over RapidIO (SRIO) DMA windows.
//!
//! This crate turns a raw RapidIO fabric connection - ports that each expose
//! a set of DMA engines plus memory-mapped inbound and outbound windows -
//! into named, addressable channels that applications open, write to and
//! read from.  Applications never touch DMA descriptors, physical addresses
//! or window attributes directly.
//!
//! RapidIO streaming writes have no end-to-end acknowledgement, so the
//! protocol builds completion signalling on top of one-way writes: every
//! payload is followed by a small control header ([`header::ControlInfo`])
//! carrying a valid flag, the sub-buffer index and a fill counter.  The
//! reader polls for that header, copies the payload out and sends a
//! feedback header back, releasing the sub-buffer to the writer.
//!
//! ## Architecture
//!
//! Leaf first:
//!
//! - [`pool`] - DMA pool allocator: one contiguous DMA-visible region with
//!   both its physical and virtual base.
//! - [`port`] - per-port region layout, window programming and link state.
//! - [`control`] - one control block per (port, DMA channel number) pair,
//!   owning a DMA engine and exposing a blocking, time-bounded `send`.
//! - [`channel`] - the transport itself: open/close, buffered write,
//!   non-blocking read, feedback, and the per-channel sub-buffer ring.
//! - [`worker`] - CPU-pinned writer and reader loops driving channels
//!   continuously, with a deterministic test pattern and throughput logs.
//!
//! The hardware collaborators (DMA memory mapping, link bring-up, DMA
//! engine driver) are abstracted by the traits in [`io`].  [`loopback`]
//! provides a software fabric implementing all of them, which is what the
//! tests run against.
//!
//! ## Memory layout
//!
//! Each channel occupies one DMA channel number (`bufnum`) on its port and
//! owns a private slice of four regions:
//!
//! - payload landing area (`write_result`), where the peer's payloads land
//! - payload staging area (`write_data`), DMA'd out to the peer
//! - control landing area (`write_ctl_result`), polled for headers and
//!   for the peer's feedback
//! - control staging area (`write_ctl_data`), DMA'd out to the peer
//!
//! The payload for sub-buffer `s` of channel `bufnum` travels to
//! `range_start + bufnum * chan_size + s * buf_size`; its header to
//! `range_start + data_window + bufnum * ctl_chan_size + s * HEADER_SLOT`.
//! After every channel's control area sit two port slots, one for a port
//! command and one for its acknowledgement.
//!
//! Multi-byte header fields use the byte order set in
//! [`config::TransportConfig::byte_order`], little-endian unless both
//! peers agree otherwise.
//!
//! ## Getting Started
//!
//! 1. Build a [`config::TransportConfig`] with the same geometry on both
//!    peers.
//! 2. Create a [`channel::TransportContext`] over your [`io::Platform`]
//!    implementation.  Ports that report connected get their windows
//!    programmed.
//! 3. [`channel::TransportContext::open()`] a channel by name, e.g.
//!    `"srio0-chan0"`.
//! 4. Writer: [`channel::TransportContext::write()`], retrying on
//!    [`Error::Busy`] while the peer still holds every sub-buffer.
//! 5. Reader: poll [`channel::TransportContext::read()`] until it stops
//!    returning [`Error::NotReady`], then call
//!    [`channel::TransportContext::read_feedback()`] for every sub-buffer
//!    read.
//!
//! Optionally, one end sends [`header::PortCommand::Init`] with
//! [`channel::TransportContext::port_command()`] while the other polls
//! [`channel::TransportContext::serve_port_command()`].  This checks both
//! ends share the ring geometry and restarts every ring on the port, which
//! is how a restarted peer gets back in step.
//!
//! ## Features
//!
//! Default features:
//! - `async` - awaitable read/write wrappers in [`channel::futures`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod channel;
pub mod config;
pub mod control;
pub mod header;
pub mod io;
pub mod loopback;
pub mod pool;
pub mod port;
pub mod worker;

pub use channel::{ChannelFd, ChannelStats, ReadResult, TransportContext};
pub use config::{ChannelSpec, TransportConfig};
pub use header::{ByteOrder, PortCommand};
pub use port::PortMode;

/// Transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No header has arrived for the next sub-buffer yet
    #[error("no data ready")]
    NotReady,
    /// No free sub-buffer, or the channel is already open
    #[error("channel busy")]
    Busy,
    /// Bounded DMA wait expired
    #[error("timed out waiting for DMA completion")]
    Timeout,
    /// Operation not valid in the current channel state
    #[error("invalid operation")]
    InvalidOperation,
    /// Payload too large for the channel's ring
    #[error("payload too large")]
    PayloadTooLarge,
    /// Received header does not match the expected sub-buffer
    #[error("sequence mismatch")]
    SequenceMismatch,
    /// Buffer too small for operation
    #[error("buffer too small")]
    BufferTooSmall,
    /// Address, size or alignment not aligned as required
    #[error("not aligned")]
    NotAligned,
    /// Unknown channel name
    #[error("channel not found")]
    NotFound,
    /// Port, DMA channel number or offset out of range
    #[error("out of range")]
    OutOfRange,
    /// Inconsistent transport configuration
    #[error("invalid configuration")]
    InvalidConfig,
    /// DMA memory could not be allocated
    #[error("out of DMA memory")]
    OutOfMemory,
    /// DMA engine or window could not be set up
    #[error("resource error")]
    Resource,
    /// Port never came up, or was declared failed
    #[error("link not connected")]
    LinkNotConnected,
    /// DMA engine reported a transfer error
    #[error("DMA transfer failed")]
    DmaTransferFailed,
}

impl Error {
    /// Whether this error is a DMA failure that is counted and may be
    /// retried on the same sub-buffer.
    pub fn is_transfer_error(&self) -> bool {
        matches!(self, Error::DmaTransferFailed | Error::Timeout)
    }
}

/// Type to represent the result of a transport operation
pub type Result<T> = core::result::Result<T, Error>;
