use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::cancel::CancelToken;
use crate::error::{DecodeError, LoadError, LoadFailure, ScanError};
use crate::files::FolderScanResult;
use crate::paths::CanonicalPath;

/// Files at or above this size are refused.
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

const READ_CHUNK: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Decoded image data (CPU side, before upload)
// ---------------------------------------------------------------------------

/// RGBA8 pixels, `stride` bytes per row.
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

impl DecodedImage {
    pub fn mem_size(&self) -> u64 {
        self.pixels.len() as u64
    }
}

/// Black-box codec: bytes in, pixels out.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, DecodeError>;
}

pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
        let img = image::load_from_memory(bytes).map_err(|e| DecodeError::Format(e.to_string()))?;
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            return Err(DecodeError::Empty);
        }
        Ok(DecodedImage {
            pixels: rgba.into_raw(),
            width,
            height,
            stride: width as usize * 4,
        })
    }
}

// ---------------------------------------------------------------------------
// Cache entries
// ---------------------------------------------------------------------------

/// One file's load/decode attempt and its result.
pub struct CacheEntry {
    pub path: CanonicalPath,
    pub raw_bytes: Vec<u8>,
    /// `None` until the pipeline has run.
    pub decode_result: Option<Result<Arc<DecodedImage>, LoadFailure>>,
    pub folder_index: Option<usize>,
    pub view_count: u32,
    pub is_prefetch: bool,
    pub is_clipboard_pseudo_entry: bool,
}

impl CacheEntry {
    pub fn new(path: CanonicalPath, is_prefetch: bool) -> Self {
        Self {
            path,
            raw_bytes: Vec::new(),
            decode_result: None,
            folder_index: None,
            view_count: 0,
            is_prefetch,
            is_clipboard_pseudo_entry: false,
        }
    }

    /// An entry for in-memory bytes that did not come from a file.
    pub fn clipboard(serial: u64, bytes: Vec<u8>) -> Self {
        Self {
            path: CanonicalPath::from_resolved(format!("<clipboard {serial}>").into()),
            raw_bytes: bytes,
            decode_result: None,
            folder_index: None,
            view_count: 0,
            is_prefetch: false,
            is_clipboard_pseudo_entry: true,
        }
    }

    pub fn key(&self) -> &str {
        self.path.key()
    }

    pub fn image(&self) -> Option<&Arc<DecodedImage>> {
        match &self.decode_result {
            Some(Ok(img)) => Some(img),
            _ => None,
        }
    }

    /// Bytes this entry accounts for in the cache.
    pub fn mem_size(&self) -> u64 {
        self.raw_bytes.len() as u64 + self.image().map_or(0, |img| img.mem_size())
    }
}

// ---------------------------------------------------------------------------
// Worker -> control thread messages
// ---------------------------------------------------------------------------

pub enum PipelineEvent {
    Loaded(Box<CacheEntry>),
    Scanned {
        generation: u64,
        dir: CanonicalPath,
        result: Result<FolderScanResult, ScanError>,
    },
}

/// Nudges the control thread after a message has been queued.
pub trait Wake: Send + Sync {
    fn wake(&self);
}

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

/// Read a whole file. With a token, the read stops between chunks once the
/// token is cancelled. Never returns a partial buffer.
pub fn load_file(path: &Path, cancel: Option<&CancelToken>) -> Result<Vec<u8>, LoadError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size >= MAX_FILE_SIZE {
        return Err(LoadError::TooLarge { size });
    }

    let mut buf = Vec::new();
    buf.try_reserve_exact(size as usize)
        .map_err(|_| LoadError::OutOfMemory { size })?;
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(LoadError::Aborted);
        }
        let n = match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() as u64 >= MAX_FILE_SIZE {
            return Err(LoadError::TooLarge {
                size: buf.len() as u64,
            });
        }
    }
    Ok(buf)
}

fn run_job(mut entry: Box<CacheEntry>, decoder: &dyn ImageDecoder, cancel: &CancelToken) -> Box<CacheEntry> {
    if !entry.is_clipboard_pseudo_entry {
        match load_file(entry.path.as_path(), Some(cancel)) {
            Ok(bytes) => entry.raw_bytes = bytes,
            Err(e) => {
                entry.decode_result = Some(Err(e.into()));
                return entry;
            }
        }
    }
    if cancel.is_cancelled() {
        entry.raw_bytes = Vec::new();
        entry.decode_result = Some(Err(LoadError::Aborted.into()));
        return entry;
    }

    let decoded = panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(&entry.raw_bytes)))
        .unwrap_or_else(|_| Err(DecodeError::Format("decoder panicked".into())));
    match decoded {
        Ok(img) => entry.decode_result = Some(Ok(Arc::new(img))),
        Err(e) => {
            entry.raw_bytes = Vec::new();
            entry.decode_result = Some(Err(e.into()));
        }
    }
    entry
}

// ---------------------------------------------------------------------------
// Background load workers
// ---------------------------------------------------------------------------

/// Runs one thread per submitted entry. Every submission produces exactly one
/// `PipelineEvent::Loaded`, whatever the outcome.
pub struct LoadPipeline {
    decoder: Arc<dyn ImageDecoder>,
    events: Sender<PipelineEvent>,
    waker: Arc<dyn Wake>,
    shutdown: CancelToken,
    in_flight: HashMap<String, CancelToken>,
    workers: Vec<JoinHandle<()>>,
}

impl LoadPipeline {
    pub fn new(
        decoder: Arc<dyn ImageDecoder>,
        events: Sender<PipelineEvent>,
        waker: Arc<dyn Wake>,
        shutdown: CancelToken,
    ) -> Self {
        Self {
            decoder,
            events,
            waker,
            shutdown,
            in_flight: HashMap::new(),
            workers: Vec::new(),
        }
    }

    pub fn submit(&mut self, entry: Box<CacheEntry>) {
        self.workers.retain(|h| !h.is_finished());

        let cancel = self.shutdown.child();
        self.in_flight.insert(entry.key().to_owned(), cancel.clone());
        log::debug!(
            "[load] submit {} (prefetch={}, workers={})",
            entry.path,
            entry.is_prefetch,
            self.workers.len() + 1
        );

        let decoder = Arc::clone(&self.decoder);
        let events = self.events.clone();
        let waker = Arc::clone(&self.waker);
        let handle = thread::spawn(move || {
            let done = run_job(entry, decoder.as_ref(), &cancel);
            // The receiver is gone only during teardown.
            if events.send(PipelineEvent::Loaded(done)).is_ok() {
                waker.wake();
            }
        });
        self.workers.push(handle);
    }

    /// Abort matching in-flight loads. Their completions still arrive.
    pub fn cancel_where(&self, mut pred: impl FnMut(&str) -> bool) {
        for (key, token) in &self.in_flight {
            if pred(key) {
                token.cancel();
            }
        }
    }

    /// Whether the in-flight load for `key` has been told to stop.
    pub fn is_cancelled(&self, key: &str) -> bool {
        self.in_flight.get(key).is_some_and(|t| t.is_cancelled())
    }

    /// Called by the coordinator once the completion for `key` is handled.
    pub fn finished(&mut self, key: &str) {
        self.in_flight.remove(key);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancel everything and wait for every worker to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("[load] worker panicked");
            }
        }
        self.in_flight.clear();
    }
}

impl Drop for LoadPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use std::io::Cursor;
    use std::time::Duration;

    pub struct NoWake;

    impl Wake for NoWake {
        fn wake(&self) {}
    }

    /// Treats every byte as one pixel of a 1-row image; `b"bad"` fails.
    pub struct FakeDecoder;

    impl ImageDecoder for FakeDecoder {
        fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
            if bytes == b"bad" {
                return Err(DecodeError::Format("fake corrupt".into()));
            }
            if bytes.is_empty() {
                return Err(DecodeError::Empty);
            }
            Ok(DecodedImage {
                pixels: vec![0; bytes.len() * 4],
                width: bytes.len() as u32,
                height: 1,
                stride: bytes.len() * 4,
            })
        }
    }

    /// Named pipe: reads block until the test writes to it.
    #[cfg(unix)]
    pub fn make_fifo(path: &Path) {
        let status = std::process::Command::new("mkfifo").arg(path).status().unwrap();
        assert!(status.success(), "mkfifo {}", path.display());
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::new(w, h))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn image_crate_decoder_produces_rgba() {
        let img = ImageCrateDecoder.decode(&png_bytes(3, 2)).unwrap();
        assert_eq!((img.width, img.height, img.stride), (3, 2, 12));
        assert_eq!(img.pixels.len(), 24);
        assert!(matches!(
            ImageCrateDecoder.decode(b"not an image"),
            Err(DecodeError::Format(_))
        ));
    }

    #[test]
    fn load_file_reads_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..READ_CHUNK * 2 + 17).map(|i| i as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let token = CancelToken::new();
        assert_eq!(load_file(&path, Some(&token)).unwrap(), data);
        assert_eq!(load_file(&path, None).unwrap(), data);
    }

    #[test]
    fn cancelled_load_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, vec![1u8; READ_CHUNK * 3]).unwrap();

        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(load_file(&path, Some(&token)), Err(LoadError::Aborted)));
    }

    #[cfg(unix)]
    #[test]
    fn cancel_during_blocked_read_aborts() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.png");
        make_fifo(&path);

        let token = CancelToken::new();
        let (done_tx, done_rx) = unbounded::<()>();
        let writer = {
            let path = path.clone();
            let token = token.clone();
            thread::spawn(move || {
                let mut w = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
                w.write_all(b"first").unwrap();
                thread::sleep(Duration::from_millis(50));
                token.cancel();
                // Wake the pending read. The pipe stays open, so no EOF is seen.
                let _ = w.write_all(b"second");
                let _ = done_rx.recv();
            })
        };

        let r = load_file(&path, Some(&token));
        done_tx.send(()).unwrap();
        writer.join().unwrap();
        assert!(matches!(r, Err(LoadError::Aborted)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = load_file(&dir.path().join("nope"), None);
        assert!(matches!(r, Err(LoadError::Io(_))));
    }

    #[test]
    fn pipeline_reports_every_outcome_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.png"), b"abcd").unwrap();
        std::fs::write(dir.path().join("bad.png"), b"bad").unwrap();
        let resolve = |n: &str| CanonicalPath::resolve(&dir.path().join(n)).unwrap();

        let (tx, rx) = unbounded();
        let mut pipeline =
            LoadPipeline::new(Arc::new(FakeDecoder), tx, Arc::new(NoWake), CancelToken::new());
        pipeline.submit(Box::new(CacheEntry::new(resolve("good.png"), false)));
        pipeline.submit(Box::new(CacheEntry::new(resolve("bad.png"), true)));
        assert_eq!(pipeline.in_flight(), 2);

        let mut outcomes = HashMap::new();
        for _ in 0..2 {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                PipelineEvent::Loaded(entry) => {
                    outcomes.insert(entry.path.basename().to_owned(), entry);
                }
                PipelineEvent::Scanned { .. } => panic!("unexpected scan event"),
            }
        }
        pipeline.shutdown();
        assert!(rx.try_recv().is_err());

        let good = &outcomes["good.png"];
        assert_eq!(good.image().unwrap().width, 4);
        assert_eq!(good.mem_size(), 4 + 16);

        let bad = &outcomes["bad.png"];
        assert!(matches!(bad.decode_result, Some(Err(LoadFailure::Decode(_)))));
        assert!(bad.raw_bytes.is_empty());
    }

    #[test]
    fn shutdown_aborts_clipboard_decode() {
        let (tx, rx) = unbounded();
        let shutdown = CancelToken::new();
        shutdown.cancel();
        let mut pipeline = LoadPipeline::new(Arc::new(FakeDecoder), tx, Arc::new(NoWake), shutdown);
        pipeline.submit(Box::new(CacheEntry::clipboard(1, b"xyz".to_vec())));

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipelineEvent::Loaded(entry) => {
                assert!(entry.is_clipboard_pseudo_entry);
                assert!(entry.decode_result.as_ref().unwrap().as_ref().err().unwrap().is_aborted());
            }
            PipelineEvent::Scanned { .. } => panic!("unexpected scan event"),
        }
    }
}
