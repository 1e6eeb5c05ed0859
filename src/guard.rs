// Batch I/O adapter: a tunnel device with the filters applied in line.
//
// Reads pull a batch from the inner device, then admission-check every
// filled slot and zero the size of each dropped one. Writes inspect every
// packet for DNS malware and hand the batch to the device untouched.

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::diag::{Diagnostics, LogDiagnostics};
use crate::filter::{self, PacketOutcome};
use crate::oracle::{AdmissionOracle, AllowAll, DnsMalwareOracle, NeverFlag};
use crate::pcap::PcapWriter;
use crate::recorder::{LogRecorder, MalwareBlockRecorder};
use crate::tun::{TunDevice, TunEvent};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Running counters, updated from both directions.
#[derive(Debug, Default)]
pub struct FilterStats {
    packets_read: AtomicU64,
    packets_written: AtomicU64,
    tcp_denied: AtomicU64,
    dns_flagged: AtomicU64,
    empty: AtomicU64,
    malformed: AtomicU64,
    unsupported: AtomicU64,
    oracle_failures: AtomicU64,
}

/// Point-in-time copy of [`FilterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_read: u64,
    pub packets_written: u64,
    pub tcp_denied: u64,
    pub dns_flagged: u64,
    pub empty: u64,
    pub malformed: u64,
    pub unsupported: u64,
    pub oracle_failures: u64,
}

impl FilterStats {
    fn record(&self, outcome: &PacketOutcome) {
        let counter = match outcome {
            PacketOutcome::Empty => &self.empty,
            PacketOutcome::Unsupported => &self.unsupported,
            PacketOutcome::Malformed => &self.malformed,
            PacketOutcome::Denied => &self.tcp_denied,
            PacketOutcome::Flagged(_) => &self.dns_flagged,
            PacketOutcome::OracleFailed => &self.oracle_failures,
            PacketOutcome::Passed | PacketOutcome::Admitted | PacketOutcome::Clean => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            tcp_denied: self.tcp_denied.load(Ordering::Relaxed),
            dns_flagged: self.dns_flagged.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            oracle_failures: self.oracle_failures.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// GuardedTun
// ---------------------------------------------------------------------------

pub struct GuardedTun<D> {
    device: D,
    admission: Arc<dyn AdmissionOracle>,
    malware: Arc<dyn DnsMalwareOracle>,
    recorder: Arc<dyn MalwareBlockRecorder>,
    diag: Arc<dyn Diagnostics>,
    capture: Option<Mutex<PcapWriter>>,
    stats: FilterStats,
}

impl<D: TunDevice> GuardedTun<D> {
    /// Wrap `device` with permissive oracles and log-based sinks. Use the
    /// `with_*` methods to plug in real policy.
    pub fn new(device: D) -> Self {
        Self {
            device,
            admission: Arc::new(AllowAll),
            malware: Arc::new(NeverFlag),
            recorder: Arc::new(LogRecorder),
            diag: Arc::new(LogDiagnostics::default()),
            capture: None,
            stats: FilterStats::default(),
        }
    }

    pub fn with_admission(mut self, oracle: Arc<dyn AdmissionOracle>) -> Self {
        self.admission = oracle;
        self
    }

    pub fn with_malware(mut self, oracle: Arc<dyn DnsMalwareOracle>) -> Self {
        self.malware = oracle;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn MalwareBlockRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_diagnostics(mut self, diag: Arc<dyn Diagnostics>) -> Self {
        self.diag = diag;
        self
    }

    /// Capture every forwarded packet.
    pub fn with_capture(mut self, writer: PcapWriter) -> Self {
        self.capture = Some(Mutex::new(writer));
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn capture_packet(&self, packet: &[u8]) {
        let Some(capture) = &self.capture else { return };
        let mut writer = capture.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_packet(packet) {
            log::warn!("PCAP packet not written: {e}");
        }
    }

    fn flush_capture(&self) {
        let Some(capture) = &self.capture else { return };
        let mut writer = capture.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.flush() {
            log::warn!("PCAP flush failed: {e}");
        }
    }
}

impl<D: TunDevice> TunDevice for GuardedTun<D> {
    fn name(&self) -> io::Result<String> {
        self.device.name()
    }

    fn mtu(&self) -> io::Result<usize> {
        self.device.mtu()
    }

    fn events(&self) -> Receiver<TunEvent> {
        self.device.events()
    }

    fn batch_size(&self) -> usize {
        self.device.batch_size()
    }

    fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> io::Result<usize> {
        let n = self.device.read_batch(bufs, sizes, offset)?;
        if n == 0 {
            return Ok(0);
        }

        let filled = n.min(bufs.len()).min(sizes.len());
        for (buf, size) in bufs[..filled].iter().zip(sizes[..filled].iter_mut()) {
            if *size == 0 {
                continue;
            }
            self.stats.packets_read.fetch_add(1, Ordering::Relaxed);

            // A buffer shorter than `offset` trims to nothing and classifies
            // as empty.
            let end = offset.saturating_add(*size).min(buf.len());
            let packet = &buf[..end];
            let outcome = filter::admit_inbound(packet, offset, &*self.admission, &*self.diag);
            self.stats.record(&outcome);
            if outcome.drops_on_read() {
                *size = 0;
            } else {
                self.capture_packet(&packet[offset..]);
            }
        }
        Ok(n)
    }

    fn write_batch(&self, bufs: &[Vec<u8>], offset: usize) -> io::Result<usize> {
        for buf in bufs {
            let outcome = filter::inspect_outbound(
                buf,
                offset,
                &*self.malware,
                &*self.recorder,
                &*self.diag,
            );
            self.stats.record(&outcome);
        }

        let written = self.device.write_batch(bufs, offset)?;
        self.stats
            .packets_written
            .fetch_add(written as u64, Ordering::Relaxed);
        if self.capture.is_some() {
            for packet in bufs.iter().take(written).filter_map(|b| b.get(offset..)) {
                self.capture_packet(packet);
            }
        }
        Ok(written)
    }

    fn close(&self) -> io::Result<()> {
        self.flush_capture();
        let s = self.stats.snapshot();
        log::info!(
            "guard closing: read={} written={} denied={} flagged={}",
            s.packets_read,
            s.packets_written,
            s.tcp_denied,
            s.dns_flagged
        );
        self.device.close()
    }
}
