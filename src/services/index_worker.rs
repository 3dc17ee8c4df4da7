//! Background worker that scans a backing store for line terminators.
//!
//! The worker only reads the store and only sends offsets over a bounded
//! channel; the owning thread appends them to its [`LineIndex`]. A full
//! channel makes the worker wait, so a stalled owner bounds memory use.
//!
//! [`LineIndex`]: crate::model::line_index::LineIndex

use crate::error::{EngineError, Result};
use crate::model::backing_store::BackingStore;
use crate::model::line_index::NewlineScanner;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Messages sent from the worker to the owning thread
#[derive(Debug)]
pub enum IndexEvent {
    /// One chunk was scanned. `offsets` are the terminators found in it,
    /// `scanned` is the number of bytes covered so far.
    Progress { offsets: Vec<u64>, scanned: u64 },
    /// Scanning ended
    Finished { error: Option<String> },
}

/// Outcome of reading from the worker channel
#[derive(Debug)]
pub enum WorkerRecv {
    Event(IndexEvent),
    /// Nothing available (non-blocking read or timeout)
    Empty,
    /// The worker is gone
    Disconnected,
}

pub struct IndexWorker {
    receiver: Option<Receiver<IndexEvent>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IndexWorker {
    pub fn spawn(
        store: Arc<BackingStore>,
        scanner: NewlineScanner,
        chunk_size: usize,
        queue_depth: usize,
    ) -> Result<Self> {
        Self::spawn_with(queue_depth, move |stop, sender| {
            scan_store(&store, scanner, chunk_size, stop, sender)
        })
    }

    /// Run `scan` on the worker thread. A panic inside it is reported as
    /// a `Finished` event carrying the panic message.
    pub fn spawn_with<F>(queue_depth: usize, scan: F) -> Result<Self>
    where
        F: FnOnce(&AtomicBool, &SyncSender<IndexEvent>) + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(queue_depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name("vbuf-line-index".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| scan(&stop_flag, &sender)));
                if let Err(payload) = result {
                    let message = panic_message(payload.as_ref());
                    tracing::error!("line index worker panicked: {}", message);
                    let _ = sender.send(IndexEvent::Finished {
                        error: Some(format!("index worker panicked: {message}")),
                    });
                }
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        Ok(Self {
            receiver: Some(receiver),
            stop,
            handle: Some(handle),
        })
    }

    pub fn try_recv(&self) -> WorkerRecv {
        let Some(receiver) = &self.receiver else {
            return WorkerRecv::Disconnected;
        };
        match receiver.try_recv() {
            Ok(event) => WorkerRecv::Event(event),
            Err(TryRecvError::Empty) => WorkerRecv::Empty,
            Err(TryRecvError::Disconnected) => WorkerRecv::Disconnected,
        }
    }

    /// Blocking read, bounded by `timeout` when given
    pub fn recv(&self, timeout: Option<Duration>) -> WorkerRecv {
        let Some(receiver) = &self.receiver else {
            return WorkerRecv::Disconnected;
        };
        match timeout {
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(event) => WorkerRecv::Event(event),
                Err(RecvTimeoutError::Timeout) => WorkerRecv::Empty,
                Err(RecvTimeoutError::Disconnected) => WorkerRecv::Disconnected,
            },
            None => match receiver.recv() {
                Ok(event) => WorkerRecv::Event(event),
                Err(_) => WorkerRecv::Disconnected,
            },
        }
    }

    /// Signal the worker, drop undelivered events and wait for the thread
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the receiver fails any send the worker is blocked in
        self.receiver = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("line index worker panicked");
            }
        }
    }
}

impl Drop for IndexWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scan_store(
    store: &BackingStore,
    mut scanner: NewlineScanner,
    chunk_size: usize,
    stop: &AtomicBool,
    sender: &SyncSender<IndexEvent>,
) {
    let bytes = store.bytes();
    let total = bytes.len();
    tracing::debug!("scanning {} bytes in chunks of {}", total, chunk_size);

    let mut offset = 0;
    while offset < total {
        if stop.load(Ordering::Relaxed) {
            tracing::debug!("line index stopped at byte {}", offset);
            return;
        }

        let end = (offset + chunk_size).min(total);
        let mut offsets = Vec::new();
        scanner.scan_chunk(&bytes[offset..end], offset as u64, &mut offsets);
        if end == total {
            scanner.finish(&mut offsets);
        }

        let event = IndexEvent::Progress {
            offsets,
            scanned: end as u64,
        };
        if sender.send(event).is_err() {
            // Owner went away
            return;
        }
        offset = end;
    }

    let _ = sender.send(IndexEvent::Finished { error: None });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
