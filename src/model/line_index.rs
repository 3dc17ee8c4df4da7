//! Line boundary index built incrementally in the background.
//!
//! The index is an ascending list of terminator offsets: entry `i` is the
//! offset of the last byte of the terminator that ends line `i`. Line `n`
//! therefore starts at `entries[n - 1] + 1`, and a partially built index
//! simply reports fewer lines.
//!
//! Scanning happens on a worker thread (see [`crate::services::index_worker`]).
//! Results are applied, and observers invoked, only when the owning thread
//! calls [`LineIndex::poll`] or [`LineIndex::wait`].

use crate::config::IndexConfig;
use crate::error::Result;
use crate::model::backing_store::BackingStore;
use crate::model::encoding::Encoding;
use crate::services::index_worker::{IndexEvent, IndexWorker, WorkerRecv};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which byte sequences end a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LineEndingMode {
    /// Only `\n` ends a line. A `\r` before it stays part of the line text.
    #[default]
    Lf,
    /// `\n`, `\r\n` and a lone `\r` all end a line
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeUnit {
    Byte,
    Utf16Le,
    Utf16Be,
}

impl CodeUnit {
    fn width(self) -> u64 {
        match self {
            Self::Byte => 1,
            Self::Utf16Le | Self::Utf16Be => 2,
        }
    }
}

const LF: u16 = 0x0A;
const CR: u16 = 0x0D;

/// Finds line terminators in consecutive chunks of a byte stream.
///
/// In [`LineEndingMode::Any`] a `\r` is held back until the following unit
/// is known, because `\r\n` is a single terminator recorded at the `\n`.
/// The held `\r` survives chunk boundaries.
#[derive(Debug, Clone)]
pub struct NewlineScanner {
    mode: LineEndingMode,
    unit: CodeUnit,
    pending_cr: Option<u64>,
}

impl NewlineScanner {
    pub fn new(mode: LineEndingMode, encoding: Encoding) -> Self {
        let unit = match encoding {
            Encoding::Utf8 | Encoding::Utf8Bom => CodeUnit::Byte,
            Encoding::Utf16Le => CodeUnit::Utf16Le,
            Encoding::Utf16Be => CodeUnit::Utf16Be,
        };
        Self {
            mode,
            unit,
            pending_cr: None,
        }
    }

    pub fn mode(&self) -> LineEndingMode {
        self.mode
    }

    /// Round a requested chunk size to whole code units
    pub fn chunk_size(&self, requested: usize) -> usize {
        let width = self.unit.width() as usize;
        (requested / width * width).max(width)
    }

    /// Append the terminators found in `chunk` (which starts at file offset
    /// `base`) to `out`. Chunks must be fed in order and start on a unit
    /// boundary.
    pub fn scan_chunk(&mut self, chunk: &[u8], base: u64, out: &mut Vec<u64>) {
        match (self.unit, self.mode) {
            (CodeUnit::Byte, LineEndingMode::Lf) => {
                out.extend(memchr::memchr_iter(b'\n', chunk).map(|i| base + i as u64));
            }
            (CodeUnit::Byte, LineEndingMode::Any) => {
                for i in memchr::memchr2_iter(b'\n', b'\r', chunk) {
                    self.on_break_unit(u16::from(chunk[i]), base + i as u64, out);
                }
            }
            (unit, _) => {
                for (k, pair) in chunk.chunks_exact(2).enumerate() {
                    let value = if unit == CodeUnit::Utf16Le {
                        u16::from_le_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_be_bytes([pair[0], pair[1]])
                    };
                    if value == LF || value == CR {
                        self.on_break_unit(value, base + (2 * k + 1) as u64, out);
                    }
                }
            }
        }

        // A held `\r` that is not the chunk's final unit was followed by
        // something other than `\n`
        let width = self.unit.width();
        let chunk_end = base + chunk.len() as u64 / width * width;
        if let Some(cr) = self.pending_cr {
            if cr + 1 < chunk_end {
                out.push(cr);
                self.pending_cr = None;
            }
        }
    }

    /// Flush state at end of input
    pub fn finish(&mut self, out: &mut Vec<u64>) {
        if let Some(cr) = self.pending_cr.take() {
            out.push(cr);
        }
    }

    /// `last_byte` is the offset of the final byte of the unit
    fn on_break_unit(&mut self, value: u16, last_byte: u64, out: &mut Vec<u64>) {
        match (self.mode, value) {
            (LineEndingMode::Lf, LF) => out.push(last_byte),
            (LineEndingMode::Lf, _) => {}
            (LineEndingMode::Any, CR) => {
                if let Some(previous) = self.pending_cr.replace(last_byte) {
                    out.push(previous);
                }
            }
            (LineEndingMode::Any, _) => {
                match self.pending_cr.take() {
                    Some(cr) if cr + self.unit.width() == last_byte => {}
                    Some(cr) => out.push(cr),
                    None => {}
                }
                out.push(last_byte);
            }
        }
    }
}

/// Scan every byte of `bytes` in chunks, returning all terminator offsets
pub fn scan_all(bytes: &[u8], scanner: &mut NewlineScanner, chunk_size: usize) -> Vec<u64> {
    let chunk_size = scanner.chunk_size(chunk_size);
    let mut out = Vec::new();
    for (i, chunk) in bytes.chunks(chunk_size).enumerate() {
        scanner.scan_chunk(chunk, (i * chunk_size) as u64, &mut out);
    }
    scanner.finish(&mut out);
    out
}

/// Progress report handed to observers after every scanned chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexProgress {
    pub scanned_bytes: u64,
    pub total_bytes: u64,
    pub line_count: usize,
}

/// Final report handed to observers once scanning stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFinished {
    pub line_count: usize,
    /// Set when the worker stopped abnormally. Lines indexed before the
    /// failure remain usable.
    pub error: Option<String>,
}

pub type ProgressObserver = Box<dyn FnMut(&IndexProgress) + Send>;
pub type FinishedObserver = Box<dyn FnMut(&IndexFinished) + Send>;

/// Random-access table from line numbers to byte offsets
pub struct LineIndex {
    entries: Vec<u64>,
    mode: LineEndingMode,
    scanned: u64,
    total: u64,
    finished: bool,
    error: Option<String>,
    worker: Option<IndexWorker>,
    progress_observers: Vec<ProgressObserver>,
    finished_observers: Vec<FinishedObserver>,
}

impl LineIndex {
    /// Start scanning `store` on a background worker
    pub fn spawn(store: Arc<BackingStore>, encoding: Encoding, config: &IndexConfig) -> Result<Self> {
        let total = store.len();
        let scanner = NewlineScanner::new(config.line_endings, encoding);
        let chunk_size = scanner.chunk_size(config.chunk_size);
        let worker = IndexWorker::spawn(store, scanner, chunk_size, config.event_queue)?;
        Ok(Self::from_worker(worker, total, config.line_endings))
    }

    /// Index fed by an already running worker over `total` bytes
    pub(crate) fn from_worker(worker: IndexWorker, total: u64, mode: LineEndingMode) -> Self {
        Self {
            entries: Vec::new(),
            mode,
            scanned: 0,
            total,
            finished: false,
            error: None,
            worker: Some(worker),
            progress_observers: Vec::new(),
            finished_observers: Vec::new(),
        }
    }

    /// Scan `store` on the calling thread. The result is already finished.
    pub fn build(store: &BackingStore, encoding: Encoding, config: &IndexConfig) -> Self {
        let mut scanner = NewlineScanner::new(config.line_endings, encoding);
        let entries = scan_all(store.bytes(), &mut scanner, config.chunk_size);
        Self {
            entries,
            mode: config.line_endings,
            scanned: store.len(),
            total: store.len(),
            finished: true,
            error: None,
            worker: None,
            progress_observers: Vec::new(),
            finished_observers: Vec::new(),
        }
    }

    /// Number of lines known so far. Grows until the index is finished.
    pub fn line_count(&self) -> usize {
        self.entries.len() + 1
    }

    /// Byte offset where line `n` starts, or `None` if the scan has not
    /// reached it yet
    pub fn line_start_offset(&self, n: usize) -> Option<u64> {
        if n == 0 {
            return Some(0);
        }
        self.entries.get(n - 1).map(|&offset| offset + 1)
    }

    /// Offset of the last terminator byte of line `n`, if it has one
    pub fn terminator_offset(&self, n: usize) -> Option<u64> {
        self.entries.get(n).copied()
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    pub fn line_ending_mode(&self) -> LineEndingMode {
        self.mode
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn progress(&self) -> IndexProgress {
        IndexProgress {
            scanned_bytes: self.scanned,
            total_bytes: self.total,
            line_count: self.line_count(),
        }
    }

    /// Register a callback run after each chunk is applied
    pub fn on_progress(&mut self, observer: impl FnMut(&IndexProgress) + Send + 'static) {
        self.progress_observers.push(Box::new(observer));
    }

    /// Register a callback run once scanning stops. Runs immediately when
    /// the index is already finished.
    pub fn on_finished(&mut self, observer: impl FnMut(&IndexFinished) + Send + 'static) {
        let mut observer: FinishedObserver = Box::new(observer);
        if self.finished {
            observer(&self.finished_report());
        } else {
            self.finished_observers.push(observer);
        }
    }

    /// Apply all events the worker has produced so far without blocking.
    /// Returns the number of events applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Some(received) = self.worker.as_ref().map(IndexWorker::try_recv) {
            match received {
                WorkerRecv::Event(event) => {
                    self.apply(event);
                    applied += 1;
                }
                WorkerRecv::Empty => break,
                WorkerRecv::Disconnected => {
                    self.worker_vanished();
                    break;
                }
            }
        }
        applied
    }

    /// Block until the index is finished or `timeout` elapses.
    /// Returns whether the index is finished.
    pub fn wait(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        while !self.finished {
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) => Some(remaining),
                    None => return false,
                },
                None => None,
            };
            let received = match self.worker.as_ref() {
                Some(worker) => worker.recv(remaining),
                None => WorkerRecv::Disconnected,
            };
            match received {
                WorkerRecv::Event(event) => self.apply(event),
                WorkerRecv::Empty => return false,
                WorkerRecv::Disconnected => self.worker_vanished(),
            }
        }
        true
    }

    /// Stop the worker. Events it has not delivered yet are dropped and no
    /// observer runs again.
    pub fn cancel(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            tracing::debug!(
                "line index cancelled after {} of {} bytes",
                self.scanned,
                self.total
            );
        }
        self.progress_observers.clear();
        self.finished_observers.clear();
    }

    fn apply(&mut self, event: IndexEvent) {
        match event {
            IndexEvent::Progress { offsets, scanned } => {
                debug_assert!(offsets.windows(2).all(|w| w[0] < w[1]));
                self.entries.extend(offsets);
                self.scanned = scanned;
                let progress = self.progress();
                for observer in &mut self.progress_observers {
                    observer(&progress);
                }
            }
            IndexEvent::Finished { error } => self.finish(error),
        }
    }

    fn worker_vanished(&mut self) {
        if !self.finished {
            tracing::warn!("line index worker exited before finishing");
            self.finish(Some("index worker exited unexpectedly".to_string()));
        }
    }

    fn finish(&mut self, error: Option<String>) {
        self.finished = true;
        self.error = error;
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        let report = self.finished_report();
        match &report.error {
            Some(error) => tracing::warn!("line index failed: {}", error),
            None => tracing::debug!("line index finished with {} lines", report.line_count),
        }
        for mut observer in self.finished_observers.drain(..) {
            observer(&report);
        }
    }

    fn finished_report(&self) -> IndexFinished {
        IndexFinished {
            line_count: self.line_count(),
            error: self.error.clone(),
        }
    }
}

impl Drop for LineIndex {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for LineIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineIndex")
            .field("lines", &self.line_count())
            .field("scanned", &self.scanned)
            .field("total", &self.total)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn scan(bytes: &[u8], mode: LineEndingMode, chunk_size: usize) -> Vec<u64> {
        let mut scanner = NewlineScanner::new(mode, Encoding::Utf8);
        scan_all(bytes, &mut scanner, chunk_size)
    }

    fn small_chunks(mode: LineEndingMode) -> IndexConfig {
        IndexConfig {
            chunk_size: 3,
            line_endings: mode,
            event_queue: 2,
        }
    }

    #[test]
    fn test_lf_offsets() {
        assert_eq!(scan(b"foo\nbar\n", LineEndingMode::Lf, 4096), vec![3, 7]);
        assert_eq!(scan(b"no newline", LineEndingMode::Lf, 4096), Vec::<u64>::new());
        assert_eq!(scan(b"a\r\nb", LineEndingMode::Lf, 4096), vec![2]);
    }

    #[test]
    fn test_any_mode_terminators() {
        // "a\r\nb\rc\nd": CRLF at 2, lone CR at 4, LF at 6
        assert_eq!(scan(b"a\r\nb\rc\nd", LineEndingMode::Any, 4096), vec![2, 4, 6]);
        assert_eq!(scan(b"\r\r", LineEndingMode::Any, 4096), vec![0, 1]);
        assert_eq!(scan(b"x\r", LineEndingMode::Any, 4096), vec![1]);
    }

    #[test]
    fn test_any_mode_crlf_across_chunks() {
        let bytes = b"ab\r\ncd\r\n";
        for chunk_size in 1..bytes.len() + 1 {
            assert_eq!(scan(bytes, LineEndingMode::Any, chunk_size), vec![3, 7], "chunk {chunk_size}");
        }
        assert_eq!(scan(b"ab\rcd", LineEndingMode::Any, 3), vec![2]);
    }

    #[test]
    fn test_utf16_scan_is_aligned() {
        // U+0A0A encodes as 0A 0A in either byte order but is not a newline
        let text = "\u{0A0A}x\ny";
        let le: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let mut scanner = NewlineScanner::new(LineEndingMode::Lf, Encoding::Utf16Le);
        assert_eq!(scan_all(&le, &mut scanner, 3), vec![5]);

        let be: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        let mut scanner = NewlineScanner::new(LineEndingMode::Any, Encoding::Utf16Be);
        assert_eq!(scan_all(&be, &mut scanner, 4), vec![5]);
    }

    #[test]
    fn test_line_start_offset() {
        let store = BackingStore::from_bytes(b"foo\nbar\nbaz".to_vec());
        let index = LineIndex::build(&store, Encoding::Utf8, &IndexConfig::default());
        assert_eq!(index.line_count(), 3);
        assert_eq!(index.line_start_offset(0), Some(0));
        assert_eq!(index.line_start_offset(1), Some(4));
        assert_eq!(index.line_start_offset(2), Some(8));
        assert_eq!(index.line_start_offset(3), None);
        assert_eq!(index.terminator_offset(2), None);
    }

    #[test]
    fn test_background_scan_matches_sync_scan() {
        let mut bytes = Vec::new();
        for i in 0..200 {
            bytes.extend_from_slice(format!("line {i}\n").as_bytes());
        }
        let store = Arc::new(BackingStore::from_bytes(bytes));
        let config = small_chunks(LineEndingMode::Lf);

        let mut index = LineIndex::spawn(store.clone(), Encoding::Utf8, &config).unwrap();
        assert!(index.wait(Some(Duration::from_secs(10))));
        assert!(index.error().is_none());

        let expected = LineIndex::build(&store, Encoding::Utf8, &config);
        assert_eq!(index.entries(), expected.entries());
        assert_eq!(index.line_count(), 201);
    }

    #[test]
    fn test_observers_run_on_owner_thread() {
        let store = Arc::new(BackingStore::from_bytes(b"a\nb\nc\nd\n".to_vec()));
        let mut index =
            LineIndex::spawn(store, Encoding::Utf8, &small_chunks(LineEndingMode::Lf)).unwrap();

        let counts = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(Mutex::new(None));
        let owner = std::thread::current().id();

        let seen = counts.clone();
        index.on_progress(move |progress| {
            assert_eq!(std::thread::current().id(), owner);
            seen.lock().unwrap().push(progress.line_count);
        });
        let done = finished.clone();
        index.on_finished(move |report| {
            *done.lock().unwrap() = Some(report.clone());
        });

        assert!(index.wait(None));
        let counts = counts.lock().unwrap();
        assert!(!counts.is_empty());
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*counts.last().unwrap(), 5);
        assert_eq!(
            finished.lock().unwrap().clone(),
            Some(IndexFinished {
                line_count: 5,
                error: None
            })
        );
    }

    #[test]
    fn test_late_finished_observer_runs_immediately() {
        let store = BackingStore::from_bytes(b"x\n".to_vec());
        let mut index = LineIndex::build(&store, Encoding::Utf8, &IndexConfig::default());
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        index.on_finished(move |report| {
            assert_eq!(report.line_count, 2);
            *flag.lock().unwrap() = true;
        });
        assert!(*called.lock().unwrap());
    }

    #[test]
    fn test_cancel_stops_worker() {
        let store = Arc::new(BackingStore::from_bytes(vec![b'\n'; 100_000]));
        let config = IndexConfig {
            chunk_size: 2,
            line_endings: LineEndingMode::Lf,
            event_queue: 1,
        };
        let mut index = LineIndex::spawn(store, Encoding::Utf8, &config).unwrap();
        index.cancel();
        assert!(!index.is_finished());
        assert_eq!(index.line_count(), 1);
        // Nothing left to deliver after cancellation
        assert_eq!(index.poll(), 0);
    }

    #[test]
    fn test_empty_store() {
        let store = Arc::new(BackingStore::from_bytes(Vec::new()));
        let mut index = LineIndex::spawn(store, Encoding::Utf8, &IndexConfig::default()).unwrap();
        assert!(index.wait(Some(Duration::from_secs(10))));
        assert_eq!(index.line_count(), 1);
    }

    #[test]
    fn test_worker_panic_finishes_with_error() {
        // "a\nb\nc\nd\n": the worker reports two terminators, then dies
        let worker = IndexWorker::spawn_with(4, |_, sender| {
            let _ = sender.send(IndexEvent::Progress {
                offsets: vec![1, 3],
                scanned: 4,
            });
            panic!("read failed");
        })
        .unwrap();
        let mut index = LineIndex::from_worker(worker, 8, LineEndingMode::Lf);
        let reported = Arc::new(Mutex::new(None));
        let slot = reported.clone();
        index.on_finished(move |report| *slot.lock().unwrap() = Some(report.clone()));

        assert!(index.wait(Some(Duration::from_secs(10))));
        assert!(index.is_finished());
        assert!(index.error().is_some_and(|e| e.contains("read failed")));
        assert_eq!(index.line_count(), 3);
        assert_eq!(index.progress().scanned_bytes, 4);

        let report = reported.lock().unwrap().clone().unwrap();
        assert_eq!(report.line_count, 3);
        assert!(report.error.is_some());
    }

    #[test]
    fn test_worker_exiting_early_finishes_with_error() {
        let worker = IndexWorker::spawn_with(4, |_, sender| {
            let _ = sender.send(IndexEvent::Progress {
                offsets: vec![1],
                scanned: 2,
            });
        })
        .unwrap();
        let mut index = LineIndex::from_worker(worker, 8, LineEndingMode::Lf);
        assert!(index.wait(Some(Duration::from_secs(10))));
        assert_eq!(index.error(), Some("index worker exited unexpectedly"));
        assert_eq!(index.line_count(), 2);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_lf_count_matches_newlines(
                bytes in prop::collection::vec(prop::sample::select(vec![b'a', b'\n', b'\r', 0xC3, 0xA9]), 0..200),
                chunk_size in 1usize..64,
            ) {
                let store = BackingStore::from_bytes(bytes.clone());
                let config = IndexConfig { chunk_size, ..IndexConfig::default() };
                let index = LineIndex::build(&store, Encoding::Utf8, &config);
                let newlines = bytes.iter().filter(|&&b| b == b'\n').count();
                prop_assert_eq!(index.line_count(), newlines + 1);
            }

            #[test]
            fn prop_any_mode_independent_of_chunking(
                bytes in prop::collection::vec(prop::sample::select(vec![b'a', b'\n', b'\r']), 0..120),
                chunk_size in 1usize..16,
            ) {
                let whole = scan(&bytes, LineEndingMode::Any, bytes.len().max(1));
                let chunked = scan(&bytes, LineEndingMode::Any, chunk_size);
                prop_assert_eq!(&whole, &chunked);
                prop_assert!(whole.windows(2).all(|w| w[0] < w[1]));

                let expected = String::from_utf8(bytes.clone()).unwrap()
                    .replace("\r\n", "\n")
                    .chars()
                    .filter(|&c| c == '\n' || c == '\r')
                    .count();
                prop_assert_eq!(whole.len(), expected);
            }
        }
    }
}
