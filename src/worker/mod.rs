//! Writer and reader worker loops.
//!
//! A worker is an OS thread driving one direction of one channel as fast
//! as it will go, optionally pinned to a CPU so that its spin-polling
//! cannot delay workers on other channels:
//!
//! - the writer fills every write with a single byte value that increments
//!   per write (wrapping), and retries until the peer has room
//! - the reader checks every payload against that pattern, releases the
//!   sub-buffer, and logs throughput every [`WorkerConfig::report_interval`]
//!
//! See [`spawn_writer()`] and [`spawn_reader()`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod threads;

pub use threads::{spawn_reader, spawn_writer};

use core::time::Duration;
use std::time::Instant;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// CPU to pin the thread to
    pub cpu: Option<usize>,
    /// How often to log throughput
    pub report_interval: Duration,
    /// Stop after this many transfers; `None` runs until stopped
    pub iterations: Option<u64>,
    /// Sleep between unsuccessful polls; `None` spins
    pub poll_delay: Option<Duration>,
    /// Bytes per write
    pub payload_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cpu: None,
            report_interval: Duration::from_secs(5),
            iterations: None,
            poll_delay: None,
            payload_len: 0x1000,
        }
    }
}

/// What a worker did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Writes completed, or whole writes read; a write spanning several
    /// sub-buffers counts once
    pub transfers: u64,
    pub bytes: u64,
    /// DMA failures seen (and retried)
    pub errors: u64,
    /// Payload bytes that did not match the pattern
    pub pattern_errors: u64,
}

/// Count the bytes of `buf` that differ from `start`, `start + step`,
/// `start + 2 * step`, ...
pub fn check_pattern(start: u8, buf: &[u8], step: u8) -> u32 {
    let mut expected = start;
    let mut errors = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if byte != expected {
            if errors == 0 {
                debug!("Pattern mismatch at {i}: {byte:#04x}, expected {expected:#04x}");
            }
            errors += 1;
        }
        expected = expected.wrapping_add(step);
    }
    errors
}

/// Periodic throughput logging.
pub(crate) struct Throughput {
    label: String,
    interval: Duration,
    start: Instant,
    count: u64,
    bytes: u64,
}

impl Throughput {
    pub(crate) fn new(label: String, interval: Duration) -> Self {
        Self {
            label,
            interval,
            start: Instant::now(),
            count: 0,
            bytes: 0,
        }
    }

    pub(crate) fn record(&mut self, bytes: usize) {
        self.count += 1;
        self.bytes += bytes as u64;

        let elapsed = self.start.elapsed();
        if elapsed >= self.interval {
            let secs = elapsed.as_secs_f64();
            info!(
                "{}: {} transfers in {secs:.3}s, {:.2} MB/s",
                self.label,
                self.count,
                self.bytes as f64 / 1_048_576.0 / secs
            );
            self.start = Instant::now();
            self.count = 0;
            self.bytes = 0;
        }
    }
}
