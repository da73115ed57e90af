//! Worker thread bodies.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::channel::{ChannelFd, TransportContext};
use crate::io::Platform;
use crate::worker::{Throughput, WorkerConfig, WorkerReport, check_pattern};
use crate::{Error, Result};

/// Start a thread writing the test pattern to `fd`.
///
/// The thread returns once `config.iterations` writes have completed or
/// `stop` is set.  It gives up with an error if the link goes down.
pub fn spawn_writer<P: Platform>(
    ctx: Arc<TransportContext<P>>,
    fd: ChannelFd,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<Result<WorkerReport>>> {
    thread::Builder::new()
        .name(format!("srio-send-{}", fd.index()))
        .spawn(move || run_writer(&ctx, fd, &config, &stop))
        .map_err(|e| {
            error!("Failed to spawn writer for fd {}: {e}", fd.index());
            Error::Resource
        })
}

/// Start a thread reading `fd`, checking the test pattern and releasing
/// every sub-buffer it reads.
pub fn spawn_reader<P: Platform>(
    ctx: Arc<TransportContext<P>>,
    fd: ChannelFd,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<Result<WorkerReport>>> {
    thread::Builder::new()
        .name(format!("srio-recv-{}", fd.index()))
        .spawn(move || run_reader(&ctx, fd, &config, &stop))
        .map_err(|e| {
            error!("Failed to spawn reader for fd {}: {e}", fd.index());
            Error::Resource
        })
}

fn run_writer<P: Platform>(
    ctx: &TransportContext<P>,
    fd: ChannelFd,
    config: &WorkerConfig,
    stop: &AtomicBool,
) -> Result<WorkerReport> {
    pin(config.cpu);
    let mut report = WorkerReport::default();
    let mut throughput = Throughput::new(format!("SEND fd {}", fd.index()), config.report_interval);
    let mut buf = vec![0u8; config.payload_len];
    let mut value = 0u8;

    while !done(&report, config, stop) {
        buf.fill(value);
        match ctx.write(fd, &buf) {
            Ok(()) => {
                report.transfers += 1;
                report.bytes += buf.len() as u64;
                value = value.wrapping_add(1);
                throughput.record(buf.len());
            }
            Err(Error::Busy) => idle(config),
            Err(e) if e.is_transfer_error() => report.errors += 1,
            Err(e) => {
                error!("SEND fd {}: giving up: {e}", fd.index());
                return Err(e);
            }
        }
    }

    debug!("SEND fd {} finished: {report:?}", fd.index());
    Ok(report)
}

fn run_reader<P: Platform>(
    ctx: &TransportContext<P>,
    fd: ChannelFd,
    config: &WorkerConfig,
    stop: &AtomicBool,
) -> Result<WorkerReport> {
    pin(config.cpu);
    let mut report = WorkerReport::default();
    let mut throughput = Throughput::new(format!("RECV fd {}", fd.index()), config.report_interval);
    let mut expected = 0u8;

    while !done(&report, config, stop) {
        let (result, mismatches) = match ctx.read_with(fd, |payload| check_pattern(expected, payload, 0)) {
            Ok(read) => read,
            Err(Error::NotReady) => {
                idle(config);
                continue;
            }
            Err(e) => {
                error!("RECV fd {}: giving up: {e}", fd.index());
                return Err(e);
            }
        };

        if mismatches > 0 {
            warn!(
                "RECV fd {}: seq {} has {mismatches} bytes not matching {expected:#04x}",
                fd.index(),
                result.seq
            );
            report.pattern_errors += mismatches as u64;
        }
        report.bytes += result.len as u64;
        if result.last {
            report.transfers += 1;
            expected = expected.wrapping_add(1);
        }
        throughput.record(result.len);

        loop {
            match ctx.read_feedback(fd, result.num) {
                Ok(()) => break,
                Err(e) if e.is_transfer_error() => report.errors += 1,
                Err(e) => {
                    error!("RECV fd {}: feedback failed: {e}", fd.index());
                    return Err(e);
                }
            }
        }
    }

    debug!("RECV fd {} finished: {report:?}", fd.index());
    Ok(report)
}

fn done(report: &WorkerReport, config: &WorkerConfig, stop: &AtomicBool) -> bool {
    stop.load(Ordering::Relaxed) || config.iterations.is_some_and(|n| report.transfers >= n)
}

fn idle(config: &WorkerConfig) {
    match config.poll_delay {
        Some(delay) => thread::sleep(delay),
        None => thread::yield_now(),
    }
}

/// Pin the current thread to `cpu`.  Failure is logged, not fatal.
fn pin(cpu: Option<usize>) {
    let Some(cpu) = cpu else {
        return;
    };
    let core = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|core| core.id == cpu));
    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            debug!("Pinned {:?} to CPU {cpu}", thread::current().name());
        }
        _ => warn!("Failed to pin {:?} to CPU {cpu}, continuing unpinned", thread::current().name()),
    }
}
