use crossbeam_channel::{Receiver, unbounded};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::cache::{Cache, CacheStats, LoadTicket};
use crate::cancel::CancelToken;
use crate::cli::ViewerConfig;
use crate::error::{ScanError, SinkError, StartupError};
use crate::files::{FolderScanResult, FolderScanner, SortField, SortOrder};
use crate::loader::{CacheEntry, ImageDecoder, LoadPipeline, PipelineEvent, Wake};
use crate::paths::CanonicalPath;

/// Where decoded images end up. Implemented by the window.
pub trait DisplaySink {
    fn show(&mut self, entry: &CacheEntry) -> Result<(), SinkError>;
    /// Transient "can't show X" message.
    fn show_error(&mut self, path: &CanonicalPath, message: &str);
}

pub enum Displayed {
    File(CanonicalPath),
    Clipboard(Box<CacheEntry>),
}

#[derive(Default)]
pub struct NavigationState {
    pub current: Option<Displayed>,
    pub folder: Option<FolderScanResult>,
    pub cursor: Option<usize>,
    /// Shown as soon as its load completes.
    pub requested: Option<CanonicalPath>,
}

impl NavigationState {
    pub fn current_file(&self) -> Option<&CanonicalPath> {
        match &self.current {
            Some(Displayed::File(p)) => Some(p),
            _ => None,
        }
    }

    fn is_requested(&self, key: &str) -> bool {
        self.requested.as_ref().is_some_and(|r| r.key() == key)
    }

    fn index_of(&self, path: &CanonicalPath) -> Option<usize> {
        self.folder
            .as_ref()
            .filter(|f| f.contains_folder_of(path))
            .and_then(|f| f.index_of(path.basename()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Already cached; handed to the display.
    Shown,
    /// A load for the path is in flight; it will be shown on arrival.
    AlreadyLoading,
    Submitted,
    Unresolved,
}

/// What `on_load_complete` did with a finished load.
///
/// Only `Shown` and `Cached` commit the entry. `Stale` and `Dropped` are
/// successful decodes that are discarded instead of cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Shown,
    Cached,
    /// Arrived for a folder or request nobody is looking at any more.
    Stale,
    /// Prefetch that did not fit the budget once its real size was known.
    Dropped,
    Failed,
    Aborted,
    /// The requested file's load had been cancelled; a fresh one was started.
    Restarted,
}

/// Offsets around the cursor in prefetch order: 0, +1, -1, +2, -2, ...
pub fn prefetch_offsets(count: usize) -> impl Iterator<Item = isize> {
    (0..count).map(|i| {
        let step = i.div_ceil(2) as isize;
        if i % 2 == 1 { step } else { -step }
    })
}

/// Owns the cache, the workers and the navigation state. Lives on the control
/// thread; workers only talk to it through `PipelineEvent`s.
pub struct Coordinator<S: DisplaySink> {
    config: ViewerConfig,
    cache: Cache,
    pipeline: LoadPipeline,
    scanner: FolderScanner,
    events: Receiver<PipelineEvent>,
    shutdown: CancelToken,
    sink: S,
    nav: NavigationState,
    /// Folder of the most recent scan request.
    scan_interest: Option<CanonicalPath>,
    failed_prefetch: HashSet<String>,
    /// Set when a folder was opened directly; its first file is shown on scan.
    show_first_on_scan: bool,
    clipboard_serial: u64,
    closed: bool,
}

impl<S: DisplaySink> Coordinator<S> {
    pub fn new(
        config: ViewerConfig,
        decoder: Arc<dyn ImageDecoder>,
        sink: S,
        waker: Arc<dyn Wake>,
    ) -> Result<Self, StartupError> {
        let (tx, rx) = unbounded();
        let shutdown = CancelToken::new();
        let scanner = FolderScanner::spawn(
            config.extensions.clone(),
            tx.clone(),
            Arc::clone(&waker),
            shutdown.clone(),
        )
        .map_err(StartupError::Scanner)?;
        let pipeline = LoadPipeline::new(decoder, tx, waker, shutdown.clone());

        log::info!(
            "Cache budget {:.0} MB, prefetch {} neighbours",
            config.cache_budget as f64 / (1024.0 * 1024.0),
            config.prefetch_count
        );
        Ok(Self {
            cache: Cache::new(config.cache_budget),
            config,
            pipeline,
            scanner,
            events: rx,
            shutdown,
            sink,
            nav: NavigationState::default(),
            scan_interest: None,
            failed_prefetch: HashSet::new(),
            show_first_on_scan: false,
            clipboard_serial: 0,
            closed: false,
        })
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn nav(&self) -> &NavigationState {
        &self.nav
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn current_entry(&self) -> Option<&CacheEntry> {
        match &self.nav.current {
            Some(Displayed::File(p)) => self.cache.lookup(p.key()),
            Some(Displayed::Clipboard(e)) => Some(e),
            None => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.nav.requested.is_some()
    }

    // -----------------------------------------------------------------------
    // User-driven operations
    // -----------------------------------------------------------------------

    /// Open a path given by the user (command line, drop, ...). A folder
    /// opens at its first image.
    pub fn open(&mut self, path: &Path) -> RequestOutcome {
        match CanonicalPath::resolve(path) {
            Ok(p) if p.as_path().is_dir() => {
                self.show_first_on_scan = true;
                self.start_scan(p);
                RequestOutcome::Submitted
            }
            Ok(p) => self.request(p),
            Err(e) => {
                log::warn!("Cannot open {}: {}", path.display(), e);
                let shown = CanonicalPath::from_resolved(path.to_path_buf());
                self.sink.show_error(&shown, &e.to_string());
                RequestOutcome::Unresolved
            }
        }
    }

    pub fn request(&mut self, target: CanonicalPath) -> RequestOutcome {
        let key = target.key().to_owned();
        self.show_first_on_scan = false;
        self.scan_folder_of(&target);

        if self.cache.lookup(&key).is_some() {
            self.nav.requested = None;
            self.display_loaded(&key);
            self.warm_cache();
            return RequestOutcome::Shown;
        }

        if self.cache.is_in_flight(&key) {
            if let Some(ticket) = self.cache.ticket_mut(&key) {
                ticket.is_prefetch = false;
            }
            if self.pipeline.is_cancelled(&key) {
                log::debug!("[nav] {} was cancelled; reloading once it reports", target);
            } else {
                log::debug!("[nav] {} already loading", target);
            }
            self.nav.requested = Some(target);
            return RequestOutcome::AlreadyLoading;
        }

        self.cache.begin_load(&key, LoadTicket { is_prefetch: false });
        self.nav.requested = Some(target.clone());
        self.pipeline.submit(Box::new(CacheEntry::new(target, false)));
        RequestOutcome::Submitted
    }

    /// Step through the current folder. No-op until the folder is scanned and
    /// the displayed file has been located in it.
    pub fn move_cursor(&mut self, delta: isize) -> Option<RequestOutcome> {
        let cursor = self.nav.cursor?;
        let folder = self.nav.folder.as_ref()?;
        if folder.is_empty() {
            return None;
        }
        let len = folder.len();
        let target = cursor.saturating_add_signed(delta).min(len - 1);
        if target == cursor {
            return None;
        }
        self.jump_to(target)
    }

    pub fn jump_to(&mut self, index: usize) -> Option<RequestOutcome> {
        let path = self.nav.folder.as_ref()?.path_at(index)?;
        if self.nav.cursor == Some(index) {
            return None;
        }
        log::debug!("[nav] move {:?} -> {}", self.nav.cursor, index);
        Some(self.request(path))
    }

    pub fn first(&mut self) -> Option<RequestOutcome> {
        self.jump_to(0)
    }

    pub fn last(&mut self) -> Option<RequestOutcome> {
        let len = self.nav.folder.as_ref()?.len();
        self.jump_to(len.checked_sub(1)?)
    }

    /// Decode in-memory bytes (a pasted image). The result is shown but never
    /// cached under a path.
    pub fn show_clipboard(&mut self, bytes: Vec<u8>) {
        self.clipboard_serial += 1;
        let entry = CacheEntry::clipboard(self.clipboard_serial, bytes);
        self.nav.requested = Some(entry.path.clone());
        self.pipeline.submit(Box::new(entry));
    }

    pub fn rescan(&mut self) {
        if let Some(dir) = self.scan_interest.clone() {
            self.start_scan(dir);
        }
    }

    pub fn set_sort(&mut self, field: SortField, order: SortOrder) {
        self.config.sort_field = field;
        self.config.sort_order = order;
        self.rescan();
    }

    // -----------------------------------------------------------------------
    // Worker completions
    // -----------------------------------------------------------------------

    /// Handle every queued worker message without blocking.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Block up to `timeout` for one worker message.
    #[cfg(test)]
    pub fn wait_for_event(&mut self, timeout: std::time::Duration) -> bool {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                true
            }
            Err(_) => false,
        }
    }

    pub fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Loaded(entry) => {
                self.on_load_complete(entry);
            }
            PipelineEvent::Scanned {
                generation,
                dir,
                result,
            } => {
                if generation != self.scanner.latest_generation() {
                    log::debug!("[scan] stale result #{} for {}", generation, dir);
                    return;
                }
                match result {
                    Ok(r) => self.on_folder_scanned(r),
                    Err(ScanError::Aborted) => {}
                    Err(e) => {
                        log::warn!("Cannot list {}: {}", dir, e);
                        self.nav.folder = None;
                        self.nav.cursor = None;
                        self.sink.show_error(&dir, &e.to_string());
                    }
                }
            }
        }
    }

    pub fn on_load_complete(&mut self, entry: Box<CacheEntry>) -> Completion {
        let key = entry.key().to_owned();
        self.pipeline.finished(&key);
        let requested = self.nav.is_requested(&key);
        if requested {
            self.nav.requested = None;
        }

        if entry.is_clipboard_pseudo_entry {
            return self.on_clipboard_complete(entry, requested);
        }

        let ticket = self.cache.abandon_load(&key);
        let was_prefetch = !requested && ticket.map_or(entry.is_prefetch, |t| t.is_prefetch);

        match &entry.decode_result {
            Some(Ok(_)) => {}
            Some(Err(failure)) if failure.is_aborted() => {
                if requested && !self.closed && !self.shutdown.is_cancelled() {
                    log::debug!("[load] {} aborted while requested; loading again", entry.path);
                    self.cache.begin_load(&key, LoadTicket { is_prefetch: false });
                    self.nav.requested = Some(entry.path.clone());
                    self.pipeline
                        .submit(Box::new(CacheEntry::new(entry.path.clone(), false)));
                    return Completion::Restarted;
                }
                log::debug!("[load] {} aborted", entry.path);
                return Completion::Aborted;
            }
            Some(Err(failure)) => {
                if requested {
                    log::warn!("Could not load {}: {}", entry.path, failure);
                    self.sink.show_error(&entry.path, &failure.to_string());
                } else if was_prefetch {
                    log::debug!("[load] prefetch of {} failed: {}", entry.path, failure);
                    self.failed_prefetch.insert(key);
                } else {
                    log::warn!("Could not load {}: {}", entry.path, failure);
                }
                return Completion::Failed;
            }
            None => {
                debug_assert!(false, "completion without a result for {}", entry.path);
                return Completion::Failed;
            }
        }

        let mut entry = *entry;
        let in_interest = entry.path.dirname().is_some_and(|d| self.scan_interest.as_ref() == Some(&d));
        if !requested && !in_interest {
            log::debug!("[load] {} is stale; discarded", entry.path);
            return Completion::Stale;
        }

        entry.folder_index = self.nav.index_of(&entry.path);
        entry.is_prefetch = was_prefetch;

        if was_prefetch {
            let size = entry.mem_size();
            if !self.cache.admit_for_prefetch(size, self.nav.cursor) {
                log::debug!("[cache] no room for {} ({} bytes); dropped", entry.path, size);
                return Completion::Dropped;
            }
        }
        self.cache.commit_load(entry);

        let completion = if requested && self.display_loaded(&key) {
            Completion::Shown
        } else {
            Completion::Cached
        };
        if !was_prefetch {
            self.warm_cache();
        }
        completion
    }

    fn on_clipboard_complete(&mut self, mut entry: Box<CacheEntry>, requested: bool) -> Completion {
        if !requested {
            return Completion::Stale;
        }
        match &entry.decode_result {
            Some(Ok(_)) => {}
            Some(Err(failure)) if failure.is_aborted() => return Completion::Aborted,
            Some(Err(failure)) => {
                log::warn!("Could not decode pasted image: {}", failure);
                self.sink.show_error(&entry.path, &failure.to_string());
                return Completion::Failed;
            }
            None => return Completion::Failed,
        }

        entry.view_count += 1;
        match self.sink.show(&entry) {
            Ok(()) => {
                self.release_unlisted_current(None);
                self.nav.current = Some(Displayed::Clipboard(entry));
                self.nav.cursor = None;
                Completion::Shown
            }
            Err(e) => {
                log::warn!("Display failed for pasted image: {}", e);
                self.sink.show_error(&entry.path, &e.to_string());
                Completion::Failed
            }
        }
    }

    pub fn on_folder_scanned(&mut self, result: FolderScanResult) {
        if self.scan_interest.as_ref() != Some(&result.path) {
            log::debug!("[scan] {} is no longer of interest", result.path);
            return;
        }
        self.nav.folder = Some(result);
        self.failed_prefetch.clear();

        let current_key = self.nav.current_file().map(|p| p.key().to_owned());
        let nav = &self.nav;
        self.cache.reindex(|e| nav.index_of(&e.path));
        let dropped = self
            .cache
            .retain(|e| e.folder_index.is_some() || current_key.as_deref() == Some(e.key()));
        if dropped > 0 {
            log::debug!("[cache] released {} entries outside the folder", dropped);
        }

        self.nav.cursor = current_key
            .as_deref()
            .and_then(|k| self.cache.lookup(k))
            .and_then(|e| e.folder_index);

        if std::mem::take(&mut self.show_first_on_scan) {
            if let Some(first) = self.nav.folder.as_ref().and_then(|f| f.path_at(0)) {
                self.request(first);
                return;
            }
        }
        self.warm_cache();
    }

    // -----------------------------------------------------------------------
    // Prefetch
    // -----------------------------------------------------------------------

    /// Start speculative loads around the cursor. Returns how many were started.
    pub fn warm_cache(&mut self) -> usize {
        if self.nav.current_file().is_none() {
            return 0;
        }
        let (Some(folder), Some(cursor)) = (&self.nav.folder, self.nav.cursor) else {
            return 0;
        };
        if self.scan_interest.as_ref() != Some(&folder.path) {
            return 0;
        }

        let mut pending = 0u64;
        let mut started = 0;
        for offset in prefetch_offsets(self.config.prefetch_count) {
            let Some(index) = cursor.checked_add_signed(offset) else {
                continue;
            };
            let Some(path) = folder.path_at(index) else {
                continue;
            };
            let key = path.key();
            if self.cache.lookup(key).is_some()
                || self.cache.is_in_flight(key)
                || self.failed_prefetch.contains(key)
            {
                continue;
            }
            let size = match fs::metadata(path.as_path()) {
                Ok(m) => m.len(),
                Err(e) => {
                    log::debug!("[prefetch] cannot stat {}: {}", path, e);
                    continue;
                }
            };
            if !self.cache.admit_for_prefetch(pending + size, Some(cursor)) {
                log::debug!("[prefetch] {} refused ({} bytes)", path, size);
                continue;
            }
            pending += size;
            self.cache.begin_load(key, LoadTicket { is_prefetch: true });
            self.pipeline.submit(Box::new(CacheEntry::new(path, true)));
            started += 1;
        }
        started
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn scan_folder_of(&mut self, target: &CanonicalPath) {
        let Some(dir) = target.dirname() else { return };
        if self.scan_interest.as_ref() == Some(&dir) {
            return;
        }
        // Speculative loads for the folder being left are not wanted any more.
        let cache = &self.cache;
        self.pipeline
            .cancel_where(|k| cache.ticket(k).is_some_and(|t| t.is_prefetch));
        self.start_scan(dir);
    }

    fn start_scan(&mut self, dir: CanonicalPath) {
        self.scan_interest = Some(dir.clone());
        self.scanner
            .request(dir, self.config.sort_field, self.config.sort_order);
    }

    /// Hand a loaded entry to the display and make it current.
    fn display_loaded(&mut self, key: &str) -> bool {
        let index = match self.cache.lookup(key) {
            Some(e) => e.folder_index.or_else(|| self.nav.index_of(&e.path)),
            None => return false,
        };
        let Some(entry) = self.cache.lookup_mut(key) else {
            return false;
        };
        entry.folder_index = index;
        entry.is_prefetch = false;
        entry.view_count += 1;

        let shown = self.sink.show(entry);
        let path = entry.path.clone();
        match shown {
            Ok(()) => {
                self.release_unlisted_current(Some(key));
                self.nav.current = Some(Displayed::File(path));
                self.nav.cursor = index;
                true
            }
            Err(e) => {
                log::warn!("Display failed for {}: {}", path, e);
                self.sink.show_error(&path, &e.to_string());
                false
            }
        }
    }

    /// The outgoing image leaves the cache if no folder listing accounts for it.
    fn release_unlisted_current(&mut self, incoming: Option<&str>) {
        let Some(prev) = self.nav.current_file() else { return };
        if incoming == Some(prev.key()) {
            return;
        }
        let key = prev.key().to_owned();
        if self.cache.lookup(&key).is_some_and(|e| e.folder_index.is_none()) {
            self.cache.evict(&key);
        }
    }

    /// Cancel all workers and wait for them to exit.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown.cancel();
        log::debug!("[load] shutting down with {} loads in flight", self.pipeline.in_flight());
        self.pipeline.shutdown();
        self.scanner.shutdown();
        while self.events.try_recv().is_ok() {}
        log::debug!("Coordinator shut down");
    }
}

impl<S: DisplaySink> Drop for Coordinator<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
