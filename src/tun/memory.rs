// In-memory tunnel device.
//
// Serves queued inbound packets to `read_batch` and keeps whatever is
// written. Used by replay and by tests that drive the guard end to end.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};

use super::{TunDevice, TunEvent, closed_error};

pub const DEFAULT_BATCH: usize = 32;

#[derive(Default)]
struct Queues {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    write_error: Option<io::ErrorKind>,
    mtu: usize,
}

pub struct MemoryTun {
    name: String,
    batch: usize,
    queues: Mutex<Queues>,
    closed: AtomicBool,
    events_tx: Sender<TunEvent>,
    events_rx: Receiver<TunEvent>,
}

impl MemoryTun {
    pub fn new(name: impl Into<String>, mtu: usize, batch: usize) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let _ = events_tx.send(TunEvent::Up);
        Self {
            name: name.into(),
            batch: batch.max(1),
            queues: Mutex::new(Queues {
                mtu,
                ..Queues::default()
            }),
            closed: AtomicBool::new(false),
            events_tx,
            events_rx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        // A panicked test thread must not wedge the device for the others.
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a packet to be returned by a later `read_batch`.
    pub fn push_inbound(&self, packet: Vec<u8>) {
        self.lock().inbound.push_back(packet);
    }

    pub fn pending_inbound(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Packets written so far, without the offset headroom.
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().written)
    }

    /// Make every following `write_batch` fail with `kind`. `None` clears it.
    pub fn set_write_error(&self, kind: Option<io::ErrorKind>) {
        self.lock().write_error = kind;
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.lock().mtu = mtu;
        let _ = self.events_tx.send(TunEvent::MtuUpdate(mtu));
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(())
    }
}

impl TunDevice for MemoryTun {
    fn name(&self) -> io::Result<String> {
        self.ensure_open()?;
        Ok(self.name.clone())
    }

    fn mtu(&self) -> io::Result<usize> {
        self.ensure_open()?;
        Ok(self.lock().mtu)
    }

    fn events(&self) -> Receiver<TunEvent> {
        self.events_rx.clone()
    }

    fn batch_size(&self) -> usize {
        self.batch
    }

    fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> io::Result<usize> {
        self.ensure_open()?;
        let mut q = self.lock();
        let slots = bufs.len().min(sizes.len()).min(self.batch);
        let mut n = 0;
        while n < slots {
            let Some(packet) = q.inbound.pop_front() else {
                break;
            };
            let buf = &mut bufs[n];
            let end = offset.saturating_add(packet.len());
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset..end].copy_from_slice(&packet);
            sizes[n] = packet.len();
            n += 1;
        }
        Ok(n)
    }

    fn write_batch(&self, bufs: &[Vec<u8>], offset: usize) -> io::Result<usize> {
        self.ensure_open()?;
        let mut q = self.lock();
        if let Some(kind) = q.write_error {
            return Err(io::Error::new(kind, "injected write failure"));
        }
        for buf in bufs {
            q.written.push(buf.get(offset..).unwrap_or_default().to_vec());
        }
        Ok(bufs.len())
    }

    fn close(&self) -> io::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.events_tx.send(TunEvent::Down);
        }
        Ok(())
    }
}
