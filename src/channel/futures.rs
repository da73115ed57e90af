//! Awaitable channel API.
//!
//! The transport itself never blocks waiting for the peer: reads return
//! [`Error::NotReady`] and writes [`Error::Busy`].  [`AsyncChannel`] turns
//! those into awaits by yielding through an application-supplied
//! [`AsyncDelay`] between polls, which keeps this crate free of any
//! specific async runtime.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{ChannelFd, ReadResult, TransportContext};
use crate::io::Platform;
use crate::{Error, Result};

/// Yield delay for async polling loops.
///
/// Example, with tokio:
///
/// ```rust
/// use srio_channel::channel::AsyncDelay;
/// struct Delay;
/// impl AsyncDelay for Delay {
///     async fn delay() {
///         tokio::time::sleep(std::time::Duration::from_micros(50)).await;
///     }
/// }
/// ```
pub trait AsyncDelay {
    fn delay() -> impl Future<Output = ()>;
}

/// Await-based access to one open channel.
#[async_trait(?Send)]
pub trait AsyncTransport {
    /// Wait for the next sub-buffer and copy it into `buf`.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<ReadResult>;

    /// Wait for enough released sub-buffers, then write `buf`.
    async fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Release sub-buffer `num` back to the peer.
    async fn release(&mut self, num: usize) -> Result<()>;
}

/// An open channel of a shared [`TransportContext`], polled with delay `D`.
pub struct AsyncChannel<P: Platform, D: AsyncDelay> {
    ctx: Arc<TransportContext<P>>,
    fd: ChannelFd,
    _delay: PhantomData<D>,
}

impl<P: Platform, D: AsyncDelay> AsyncChannel<P, D> {
    pub fn new(ctx: Arc<TransportContext<P>>, fd: ChannelFd) -> Self {
        Self {
            ctx,
            fd,
            _delay: PhantomData,
        }
    }

    /// Open channel `name` on `ctx`.
    pub fn open(ctx: Arc<TransportContext<P>>, name: &str) -> Result<Self> {
        let fd = ctx.open(name)?;
        Ok(Self::new(ctx, fd))
    }

    pub fn fd(&self) -> ChannelFd {
        self.fd
    }

    pub fn context(&self) -> &Arc<TransportContext<P>> {
        &self.ctx
    }
}

#[async_trait(?Send)]
impl<P: Platform, D: AsyncDelay> AsyncTransport for AsyncChannel<P, D> {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<ReadResult> {
        loop {
            match self.ctx.read(self.fd, buf) {
                Err(Error::NotReady) => D::delay().await,
                result => return result,
            }
        }
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        loop {
            match self.ctx.write(self.fd, buf) {
                Err(Error::Busy) => D::delay().await,
                result => return result,
            }
        }
    }

    async fn release(&mut self, num: usize) -> Result<()> {
        self.ctx.read_feedback(self.fd, num)
    }
}
