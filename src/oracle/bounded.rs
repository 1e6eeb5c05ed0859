// Bounded-wait wrappers around the oracles.
//
// The wrapped oracle runs on a dedicated worker thread. Each call hands the
// input over a bounded channel and waits at most `timeout` for the answer.
// A timeout, a full queue or a dead worker all come back as
// `OracleUnavailable`, which the filters treat as fail-open. A hung oracle
// keeps its worker busy; later calls then fail fast on the full queue.
//
// Dropping a wrapper closes the queue. An idle worker is joined there; a
// busy one is detached and exits once its current call returns, so a call
// that never returns pins that one thread for the life of the process.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use super::{AdmissionOracle, DnsMalwareOracle, DnsMalwareVerdict};
use crate::error::GuardError;

/// Requests allowed to wait behind the one being served.
const QUEUE_DEPTH: usize = 4;

struct Request<Q, R> {
    input: Q,
    reply: Sender<R>,
}

struct Worker<Q, R> {
    name: &'static str,
    timeout: Duration,
    tx: Option<Sender<Request<Q, R>>>,
    handle: Option<thread::JoinHandle<()>>,
    /// Requests accepted by the queue and not yet answered.
    in_flight: Arc<AtomicUsize>,
}

impl<Q: Send + 'static, R: Send + 'static> Worker<Q, R> {
    fn spawn<F>(name: &'static str, timeout: Duration, mut serve: F) -> Result<Self, GuardError>
    where
        F: FnMut(Q) -> R + Send + 'static,
    {
        let (tx, rx): (Sender<Request<Q, R>>, Receiver<Request<Q, R>>) =
            crossbeam_channel::bounded(QUEUE_DEPTH);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let pending = Arc::clone(&in_flight);
        let handle = thread::Builder::new()
            .name(format!("tunguard-{name}"))
            .spawn(move || {
                // Exits once every sender is gone.
                while let Ok(req) = rx.recv() {
                    let out = serve(req.input);
                    pending.fetch_sub(1, Ordering::AcqRel);
                    let _ = req.reply.send(out);
                }
            })
            .map_err(|e| GuardError::Fatal(format!("spawn {name} oracle worker: {e}")))?;

        Ok(Self {
            name,
            timeout,
            tx: Some(tx),
            handle: Some(handle),
            in_flight,
        })
    }

    fn call(&self, input: Q) -> Result<R, GuardError> {
        let Some(tx) = &self.tx else {
            return Err(GuardError::OracleUnavailable(format!(
                "{} oracle worker stopped",
                self.name
            )));
        };
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        tx.try_send(Request {
            input,
            reply: reply_tx,
        })
        .map_err(|e| {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            match e {
                TrySendError::Full(_) => {
                    GuardError::OracleUnavailable(format!("{} oracle queue full", self.name))
                }
                TrySendError::Disconnected(_) => {
                    GuardError::OracleUnavailable(format!("{} oracle worker stopped", self.name))
                }
            }
        })?;

        reply_rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => GuardError::OracleUnavailable(format!(
                "{} oracle timed out after {:?}",
                self.name, self.timeout
            )),
            RecvTimeoutError::Disconnected => {
                GuardError::OracleUnavailable(format!("{} oracle worker stopped", self.name))
            }
        })
    }
}

impl<Q, R> Drop for Worker<Q, R> {
    fn drop(&mut self) {
        // No call can race us here: `call` borrows the worker.
        let idle = self.in_flight.load(Ordering::Acquire) == 0;
        drop(self.tx.take());
        let Some(handle) = self.handle.take() else {
            return;
        };
        if idle {
            let _ = handle.join();
        } else {
            log::debug!("{} oracle worker busy at shutdown, detaching", self.name);
        }
    }
}

/// Admission oracle with a deadline.
pub struct BoundedAdmission {
    worker: Worker<Vec<u8>, Result<bool, GuardError>>,
}

impl BoundedAdmission {
    pub fn spawn<O>(oracle: O, timeout: Duration) -> Result<Self, GuardError>
    where
        O: AdmissionOracle + 'static,
    {
        let worker = Worker::spawn("admission", timeout, move |packet: Vec<u8>| {
            oracle.is_packet_allowed(&packet)
        })?;
        Ok(Self { worker })
    }
}

impl AdmissionOracle for BoundedAdmission {
    fn is_packet_allowed(&self, packet: &[u8]) -> Result<bool, GuardError> {
        self.worker.call(packet.to_vec())?
    }
}

/// DNS malware oracle with a deadline.
pub struct BoundedDnsMalware {
    worker: Worker<Vec<u8>, Result<DnsMalwareVerdict, GuardError>>,
}

impl BoundedDnsMalware {
    pub fn spawn<O>(oracle: O, timeout: Duration) -> Result<Self, GuardError>
    where
        O: DnsMalwareOracle + 'static,
    {
        let worker = Worker::spawn("dns-malware", timeout, move |payload: Vec<u8>| {
            oracle.check_dns_malware(&payload)
        })?;
        Ok(Self { worker })
    }
}

impl DnsMalwareOracle for BoundedDnsMalware {
    fn check_dns_malware(&self, payload: &[u8]) -> Result<DnsMalwareVerdict, GuardError> {
        self.worker.call(payload.to_vec())?
    }
}
