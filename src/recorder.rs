// Malware block recorder.
//
// Recording a flagged domain must never hold up a write batch. The channel
// recorder hands the domain to a background thread over a bounded queue and
// drops it when the queue is full.

use std::thread;

use crossbeam_channel::{Sender, TrySendError};

use crate::error::GuardError;

/// Receives every domain the DNS check flagged.
pub trait MalwareBlockRecorder: Send + Sync {
    /// Must return promptly. Called on the write path.
    fn record_malware_block(&self, domain: &str);
}

impl<T: MalwareBlockRecorder + ?Sized> MalwareBlockRecorder for std::sync::Arc<T> {
    fn record_malware_block(&self, domain: &str) {
        (**self).record_malware_block(domain)
    }
}

/// Logs each block at info level.
#[derive(Debug, Default)]
pub struct LogRecorder;

impl MalwareBlockRecorder for LogRecorder {
    fn record_malware_block(&self, domain: &str) {
        log::info!("malware block recorded: {domain}");
    }
}

/// Forwards domains to a sink running on its own thread.
pub struct ChannelRecorder {
    tx: Option<Sender<String>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ChannelRecorder {
    pub fn spawn<F>(queue: usize, mut sink: F) -> Result<Self, GuardError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded::<String>(queue.max(1));
        let handle = thread::Builder::new()
            .name("tunguard-recorder".into())
            .spawn(move || {
                for domain in rx {
                    sink(domain);
                }
            })
            .map_err(|e| GuardError::Fatal(format!("spawn recorder thread: {e}")))?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }
}

impl MalwareBlockRecorder for ChannelRecorder {
    fn record_malware_block(&self, domain: &str) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(domain.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(d)) => log::debug!("recorder queue full, dropped {d}"),
            Err(TrySendError::Disconnected(d)) => log::debug!("recorder stopped, dropped {d}"),
        }
    }
}

impl Drop for ChannelRecorder {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain what is queued and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
