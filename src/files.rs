use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use rayon::slice::ParallelSliceMut;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::error::ScanError;
use crate::loader::{PipelineEvent, Wake};
use crate::paths::CanonicalPath;

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tga", "tiff", "tif", "webp", "ico", "pnm", "pbm",
    "pgm", "ppm", "pam", "dds", "hdr", "exr", "ff", "qoi",
];

/// How often (in directory entries) a running scan checks its cancel token.
const CANCEL_POLL_INTERVAL: usize = 64;

pub fn has_extension(name: &str, extensions: &[String]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Scan results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub modified_time: i64,
}

#[derive(Debug)]
pub struct FolderScanResult {
    pub path: CanonicalPath,
    pub files: Vec<FileEntry>,
    pub sort_field: SortField,
    pub sort_order: SortOrder,
    by_name: HashMap<String, usize>,
}

impl FolderScanResult {
    pub fn new(
        path: CanonicalPath,
        files: Vec<FileEntry>,
        sort_field: SortField,
        sort_order: SortOrder,
    ) -> Self {
        let by_name = files
            .iter()
            .enumerate()
            .map(|(i, f)| (name_key(&f.name), i))
            .collect();
        Self {
            path,
            files,
            sort_field,
            sort_order,
            by_name,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(&name_key(name)).copied()
    }

    /// Full path of the file at `index`.
    pub fn path_at(&self, index: usize) -> Option<CanonicalPath> {
        self.files.get(index).map(|f| self.path.join(&f.name))
    }

    pub fn contains_folder_of(&self, file: &CanonicalPath) -> bool {
        file.dirname().is_some_and(|d| d == self.path)
    }
}

fn name_key(name: &str) -> String {
    CanonicalPath::from_resolved(name.into()).key().to_owned()
}

// ---------------------------------------------------------------------------
// Natural ordering
// ---------------------------------------------------------------------------

/// Compare file names so that embedded numbers sort by value
/// (`img2` < `img10`). Letters compare case-insensitively first; exact
/// case is the final tiebreak so the order is total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_cmp_folded(a, b).then_with(|| a.cmp(b))
}

fn natural_cmp_folded(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        let (ca, cb) = match (ai.peek(), bi.peek()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&ca), Some(&cb)) => (ca, cb),
        };

        if ca.is_ascii_digit() && cb.is_ascii_digit() {
            let na = take_digits(&mut ai);
            let nb = take_digits(&mut bi);
            let ord = compare_digit_runs(&na, &nb);
            if ord != Ordering::Equal {
                return ord;
            }
            continue;
        }

        let ord = ca.to_lowercase().cmp(cb.to_lowercase());
        if ord != Ordering::Equal {
            return ord;
        }
        ai.next();
        bi.next();
    }
}

fn take_digits(it: &mut Peekable<Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(&c) = it.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        it.next();
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let ta = a.trim_start_matches('0');
    let tb = b.trim_start_matches('0');
    ta.len()
        .cmp(&tb.len())
        .then_with(|| ta.cmp(tb))
        // "01" after "1"
        .then_with(|| a.len().cmp(&b.len()))
}

pub fn sort_entries(files: &mut [FileEntry], field: SortField, order: SortOrder) {
    files.par_sort_by(|a, b| {
        let ord = match field {
            SortField::Name => natural_cmp(&a.name, &b.name),
            SortField::Modified => a
                .modified_time
                .cmp(&b.modified_time)
                .then_with(|| natural_cmp(&a.name, &b.name)),
        };
        match order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    });
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Enumerate the image files directly inside `dir` and sort them.
pub fn scan(
    dir: &CanonicalPath,
    extensions: &[String],
    field: SortField,
    order: SortOrder,
    cancel: &CancelToken,
) -> Result<FolderScanResult, ScanError> {
    let meta = match fs::metadata(dir.as_path()) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ScanError::NotFound(dir.as_path().to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory(dir.as_path().to_path_buf()));
    }

    let mut files = Vec::new();
    for (i, entry) in fs::read_dir(dir.as_path())?.enumerate() {
        if i % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(ScanError::Aborted);
        }
        let Ok(entry) = entry else { continue };
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !has_extension(&name, extensions) {
            continue;
        }
        // Follows links; directories, devices and dangling links drop out here.
        let Ok(meta) = fs::metadata(entry.path()) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified_time = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        files.push(FileEntry {
            name,
            modified_time,
        });
    }

    if cancel.is_cancelled() {
        return Err(ScanError::Aborted);
    }
    sort_entries(&mut files, field, order);
    Ok(FolderScanResult::new(dir.clone(), files, field, order))
}

// ---------------------------------------------------------------------------
// Background scanner
// ---------------------------------------------------------------------------

struct ScanRequest {
    generation: u64,
    dir: CanonicalPath,
    field: SortField,
    order: SortOrder,
    cancel: CancelToken,
}

/// Long-lived worker that runs one folder scan at a time. Each request gets a
/// generation number; asking for a new scan cancels the previous one.
pub struct FolderScanner {
    requests: Option<Sender<ScanRequest>>,
    shutdown_tx: Option<Sender<()>>,
    shutdown: CancelToken,
    active: Option<CancelToken>,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl FolderScanner {
    pub fn spawn(
        extensions: Vec<String>,
        events: Sender<PipelineEvent>,
        waker: Arc<dyn Wake>,
        shutdown: CancelToken,
    ) -> io::Result<Self> {
        let (req_tx, req_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("folder-scan".into())
            .spawn(move || scan_worker(req_rx, shutdown_rx, extensions, events, waker))?;
        Ok(Self {
            requests: Some(req_tx),
            shutdown_tx: Some(shutdown_tx),
            shutdown,
            active: None,
            generation: 0,
            handle: Some(handle),
        })
    }

    /// Queue a scan of `dir`. Returns the generation its result will carry.
    pub fn request(&mut self, dir: CanonicalPath, field: SortField, order: SortOrder) -> u64 {
        if let Some(prev) = self.active.take() {
            prev.cancel();
        }
        self.generation += 1;
        let cancel = self.shutdown.child();
        self.active = Some(cancel.clone());

        log::debug!("[scan] request #{} {}", self.generation, dir);
        let req = ScanRequest {
            generation: self.generation,
            dir,
            field,
            order,
            cancel,
        };
        match &self.requests {
            Some(tx) if tx.send(req).is_ok() => {}
            _ => log::warn!("[scan] scanner is not running; request dropped"),
        }
        self.generation
    }

    pub fn latest_generation(&self) -> u64 {
        self.generation
    }

    pub fn shutdown(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel();
        }
        self.shutdown_tx = None;
        self.requests = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[scan] scanner thread panicked");
            }
        }
    }
}

impl Drop for FolderScanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scan_worker(
    requests: Receiver<ScanRequest>,
    shutdown: Receiver<()>,
    extensions: Vec<String>,
    events: Sender<PipelineEvent>,
    waker: Arc<dyn Wake>,
) {
    loop {
        let mut req = select! {
            recv(requests) -> r => match r {
                Ok(r) => r,
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        };
        // Only the newest queued request matters.
        while let Ok(newer) = requests.try_recv() {
            req = newer;
        }

        let start = Instant::now();
        let result = scan(&req.dir, &extensions, req.field, req.order, &req.cancel);
        match &result {
            Ok(r) => log::info!(
                "Scanned {} in {:.2}s. Found {} images.",
                req.dir,
                start.elapsed().as_secs_f64(),
                r.len()
            ),
            Err(ScanError::Aborted) => log::debug!("[scan] #{} aborted", req.generation),
            Err(e) => log::warn!("[scan] {} failed: {}", req.dir, e),
        }

        let event = PipelineEvent::Scanned {
            generation: req.generation,
            dir: req.dir,
            result,
        };
        if events.send(event).is_err() {
            break;
        }
        waker.wake();
    }
    log::debug!("[scan] worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::loader::tests::NoWake;

    fn exts() -> Vec<String> {
        IMAGE_EXTENSIONS.iter().map(|s| s.to_string()).collect()
    }

    fn names(r: &FolderScanResult) -> Vec<&str> {
        r.files.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn numbers_compare_by_value() {
        let mut v = vec!["img10.png", "img2.png", "img20.png", "img1.png"];
        v.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(v, ["img1.png", "img2.png", "img10.png", "img20.png"]);

        assert_eq!(natural_cmp("a01", "a1"), Ordering::Greater);
        assert_eq!(natural_cmp("Beta", "alpha"), Ordering::Greater);
        assert_eq!(natural_cmp("x", "X"), Ordering::Greater);
        assert_eq!(natural_cmp("page", "page1"), Ordering::Less);
    }

    #[test]
    fn scan_sorts_naturally_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["img20.png", "img1.png", "img10.png", "img2.PNG", "notes.txt"] {
            fs::write(dir.path().join(name), b"data").unwrap();
        }
        fs::create_dir(dir.path().join("folder.png")).unwrap();

        let root = CanonicalPath::resolve(dir.path()).unwrap();
        let r = scan(
            &root,
            &exts(),
            SortField::Name,
            SortOrder::Ascending,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(names(&r), ["img1.png", "img2.PNG", "img10.png", "img20.png"]);
        assert_eq!(r.index_of("img10.png"), Some(2));
        assert_eq!(r.index_of("notes.txt"), None);
        assert_eq!(r.path_at(1).unwrap().basename(), "img2.PNG");
    }

    #[test]
    fn modified_sort_breaks_ties_by_name() {
        let mut files = vec![
            FileEntry { name: "b10.jpg".into(), modified_time: 5 },
            FileEntry { name: "c.jpg".into(), modified_time: 1 },
            FileEntry { name: "b9.jpg".into(), modified_time: 5 },
        ];
        sort_entries(&mut files, SortField::Modified, SortOrder::Ascending);
        let order: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, ["c.jpg", "b9.jpg", "b10.jpg"]);

        sort_entries(&mut files, SortField::Modified, SortOrder::Descending);
        let order: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, ["b10.jpg", "b9.jpg", "c.jpg"]);
    }

    #[test]
    fn scan_reports_missing_and_non_folder_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.png");
        fs::write(&file, b"x").unwrap();
        let cancel = CancelToken::new();

        let missing = CanonicalPath::from_resolved(dir.path().join("gone"));
        assert!(matches!(
            scan(&missing, &exts(), SortField::Name, SortOrder::Ascending, &cancel),
            Err(ScanError::NotFound(_))
        ));

        let not_dir = CanonicalPath::resolve(&file).unwrap();
        assert!(matches!(
            scan(&not_dir, &exts(), SortField::Name, SortOrder::Ascending, &cancel),
            Err(ScanError::NotADirectory(_))
        ));
    }

    #[test]
    fn cancelled_scan_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.png"), b"x").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let root = CanonicalPath::resolve(dir.path()).unwrap();
        let r = scan(&root, &exts(), SortField::Name, SortOrder::Ascending, &cancel);
        assert!(matches!(r, Err(ScanError::Aborted)));
    }

    #[test]
    fn background_scanner_reports_generation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.png"), b"x").unwrap();
        let root = CanonicalPath::resolve(dir.path()).unwrap();

        let (tx, rx) = unbounded();
        let mut scanner =
            FolderScanner::spawn(exts(), tx, Arc::new(NoWake), CancelToken::new()).unwrap();
        let generation = scanner.request(root.clone(), SortField::Name, SortOrder::Ascending);
        assert_eq!(generation, scanner.latest_generation());

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipelineEvent::Scanned { generation: g, dir, result } => {
                assert_eq!(g, generation);
                assert_eq!(dir, root);
                assert_eq!(result.unwrap().len(), 1);
            }
            PipelineEvent::Loaded(_) => panic!("unexpected load event"),
        }
        scanner.shutdown();
    }
}
