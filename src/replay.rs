// Offline replay: push captured packets through a guarded in-memory device.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::cli::ReplayDirection;
use crate::config::GuardConfig;
use crate::diag::{Diagnostics, LogDiagnostics};
use crate::error::GuardError;
use crate::guard::{GuardedTun, StatsSnapshot};
use crate::pcap::PcapWriter;
use crate::recorder::ChannelRecorder;
use crate::tun::TunDevice;
use crate::tun::memory::MemoryTun;

const REPLAY_MTU: usize = 65535;

#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    pub direction: ReplayDirection,
    pub batch: usize,
    pub offset: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            direction: ReplayDirection::Both,
            batch: crate::tun::memory::DEFAULT_BATCH,
            offset: 0,
        }
    }
}

/// What a replay did to the capture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub packets: usize,
    pub stats: StatsSnapshot,
    /// Capture indices (0-based) dropped on the inbound pass.
    pub dropped: Vec<usize>,
    /// Domains reported by the outbound pass, in order.
    pub flagged: Vec<String>,
}

/// Replay `packets` with the oracles and sinks described by `config`.
pub fn replay(
    packets: &[Vec<u8>],
    config: &GuardConfig,
    opts: ReplayOptions,
) -> Result<ReplayReport, GuardError> {
    let diag: Arc<dyn Diagnostics> = Arc::new(LogDiagnostics::new(&config.log_tag));
    replay_with(packets, config, opts, diag)
}

/// Like [`replay`], with a caller-supplied diagnostic sink.
pub fn replay_with(
    packets: &[Vec<u8>],
    config: &GuardConfig,
    opts: ReplayOptions,
    diag: Arc<dyn Diagnostics>,
) -> Result<ReplayReport, GuardError> {
    let flagged = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&flagged);
    let recorder = Arc::new(ChannelRecorder::spawn(config.recorder_queue, move |domain| {
        sink.lock().unwrap_or_else(|e| e.into_inner()).push(domain);
    })?);

    let device = MemoryTun::new("replay0", REPLAY_MTU, opts.batch);
    let mut guard = GuardedTun::new(device)
        .with_admission(config.admission_oracle()?)
        .with_malware(config.malware_oracle()?)
        .with_recorder(recorder.clone())
        .with_diagnostics(diag);
    if let Some(path) = &config.pcap_path {
        guard = guard.with_capture(PcapWriter::create(path)?);
    }

    let mut report = ReplayReport {
        packets: packets.len(),
        ..ReplayReport::default()
    };
    if opts.direction.inbound() {
        report.dropped = run_inbound(&guard, packets, opts)?;
    }
    if opts.direction.outbound() {
        run_outbound(&guard, packets, opts)?;
    }
    guard.close().map_err(GuardError::DeviceIo)?;
    report.stats = guard.stats();

    // Dropping the last handle joins the recorder thread, so every queued
    // domain has reached the sink afterwards.
    drop(guard);
    drop(recorder);
    report.flagged = std::mem::take(&mut *flagged.lock().unwrap_or_else(|e| e.into_inner()));
    Ok(report)
}

fn run_inbound(
    guard: &GuardedTun<MemoryTun>,
    packets: &[Vec<u8>],
    opts: ReplayOptions,
) -> Result<Vec<usize>, GuardError> {
    for pkt in packets {
        guard.device().push_inbound(pkt.clone());
    }

    let slots = guard.batch_size();
    let mut bufs = vec![Vec::new(); slots];
    let mut sizes = vec![0usize; slots];
    let mut dropped = Vec::new();
    let mut base = 0;
    loop {
        sizes.fill(0);
        let n = guard
            .read_batch(&mut bufs, &mut sizes, opts.offset)
            .map_err(GuardError::DeviceIo)?;
        if n == 0 {
            break;
        }
        dropped.extend((0..n).filter(|&i| sizes[i] == 0).map(|i| base + i));
        base += n;
    }
    log::debug!("inbound pass: {base} packets, {} dropped", dropped.len());
    Ok(dropped)
}

fn run_outbound(
    guard: &GuardedTun<MemoryTun>,
    packets: &[Vec<u8>],
    opts: ReplayOptions,
) -> Result<(), GuardError> {
    for chunk in packets.chunks(guard.batch_size()) {
        let bufs: Vec<Vec<u8>> = chunk
            .iter()
            .map(|pkt| {
                let mut buf = vec![0u8; opts.offset];
                buf.extend_from_slice(pkt);
                buf
            })
            .collect();
        guard
            .write_batch(&bufs, opts.offset)
            .map_err(GuardError::DeviceIo)?;
    }
    // Written packets are not needed past this point.
    guard.device().take_written();
    Ok(())
}
