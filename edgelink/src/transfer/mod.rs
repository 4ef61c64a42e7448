//! File-transfer engine.
//!
//! Transfers run in a bounded set of worker slots. When every slot is busy a
//! new transfer queues as pending and is promoted in FIFO order as slots
//! free. Workers retry transient network failures with jittered exponential
//! backoff; checksum mismatches and client-side rejections are terminal.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::status::{AgentError, ErrorKind, Result};
use crate::transport::{ProxyOptions, KEEP_ALIVE};

pub(crate) mod http;
pub mod persist;

/// Default number of parallel transfer slots.
pub const DEFAULT_WORKERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
    /// Download resolved from the cloud's global file store.
    Ota,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
            TransferDirection::Ota => "ota",
        }
    }

    pub fn parse(s: &str) -> Result<TransferDirection> {
        match s {
            "upload" => Ok(TransferDirection::Upload),
            "download" => Ok(TransferDirection::Download),
            "ota" => Ok(TransferDirection::Ota),
            other => Err(AgentError::new(
                ErrorKind::ParseError,
                format!("unknown transfer direction {other:?}"),
            )),
        }
    }

    fn is_download(self) -> bool {
        matches!(self, TransferDirection::Download | TransferDirection::Ota)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NotStarted,
    InProgress,
    Pending,
    Completed,
    Failed,
}

impl TransferState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::NotStarted => "not-started",
            TransferState::InProgress => "in-progress",
            TransferState::Pending => "pending",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn parse(s: &str) -> Result<ChecksumAlgorithm> {
        match s {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(AgentError::new(
                ErrorKind::ParseError,
                format!("unknown checksum algorithm {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    /// Hex-lowercase digest.
    pub hex: String,
}

/// Everything needed to run one transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub url: String,
    /// Optional URL the cloud expects a completion report on.
    pub response_url: Option<String>,
    pub token: Option<String>,
    pub checksum: Option<Checksum>,
    pub expected_size: Option<u64>,
    pub expiry: Option<DateTime<Utc>>,
    /// The cloud resolves the file from its global store instead of the
    /// thing's own file area.
    pub global: bool,
}

impl TransferRequest {
    pub fn download(local_path: impl Into<PathBuf>, url: impl Into<String>) -> TransferRequest {
        TransferRequest {
            direction: TransferDirection::Download,
            local_path: local_path.into(),
            url: url.into(),
            response_url: None,
            token: None,
            checksum: None,
            expected_size: None,
            expiry: None,
            global: false,
        }
    }

    pub fn upload(local_path: impl Into<PathBuf>, url: impl Into<String>) -> TransferRequest {
        TransferRequest {
            direction: TransferDirection::Upload,
            ..TransferRequest::download(local_path, url)
        }
    }
}

/// Non-owning reference to a transfer tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(u64);

/// Progress report delivered to the per-transfer callback, at most once per
/// second while bytes move and exactly once with `completed == true`.
#[derive(Debug, Clone)]
pub struct Progress {
    pub state: TransferState,
    pub percent: f64,
    pub completed: bool,
}

pub type ProgressCallback = Box<dyn Fn(&Progress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Number of parallel transfer slots.
    pub workers: usize,
    /// Attempts per transfer: 0 and 1 both mean a single try, -1 means
    /// unlimited.
    pub max_retry: i32,
    pub proxy: Option<ProxyOptions>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            workers: DEFAULT_WORKERS,
            max_retry: 3,
            proxy: None,
        }
    }
}

struct Job {
    id: u64,
    request: TransferRequest,
    cancel: Arc<AtomicBool>,
    progress: Option<Arc<ProgressCallback>>,
    last_emit: Option<Instant>,
}

struct ActiveEntry {
    id: u64,
    request: TransferRequest,
    cancel: Arc<AtomicBool>,
}

struct Finished {
    state: TransferState,
    error: Option<AgentError>,
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    active: Vec<ActiveEntry>,
    pending: VecDeque<Job>,
    finished: HashMap<u64, Finished>,
}

struct EngineInner {
    config: TransferConfig,
    agent: ureq::Agent,
    state: Mutex<EngineState>,
}

/// Handle to the transfer engine. Cheap to clone; all clones share the same
/// slots.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(config: TransferConfig) -> TransferEngine {
        let agent = http::build_agent(config.proxy.as_ref());
        TransferEngine {
            inner: Arc::new(EngineInner {
                config,
                agent,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().expect("transfer engine mutex poisoned")
    }

    /// Starts a transfer or queues it as pending when every slot is busy.
    pub fn begin(
        &self,
        request: TransferRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<TransferHandle> {
        if request.url.is_empty() {
            return Err(AgentError::new(ErrorKind::BadParameter, "empty transfer URL"));
        }
        if request.local_path.as_os_str().is_empty() {
            return Err(AgentError::new(ErrorKind::BadParameter, "empty local path"));
        }
        if let Some(checksum) = &request.checksum {
            if checksum.hex.is_empty() || !checksum.hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(AgentError::new(
                    ErrorKind::BadParameter,
                    "expected checksum is not a hex digest",
                ));
            }
        }

        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let job = Job {
            id,
            request,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: progress.map(Arc::new),
            last_emit: None,
        };

        if state.active.len() < self.inner.config.workers {
            self.start_locked(&mut state, job);
        } else {
            log::debug!("transfer {id} queued as pending");
            state.pending.push_back(job);
        }
        Ok(TransferHandle(id))
    }

    /// Spawns the worker for `job`. The caller holds the state lock, which
    /// keeps the in-progress count bounded by the slot count at all times.
    fn start_locked(&self, state: &mut EngineState, job: Job) {
        log::debug!(
            "starting {} of {:?}{}",
            job.request.direction.as_str(),
            job.request.local_path,
            if job.request.global {
                " from the global store"
            } else {
                ""
            }
        );
        state.active.push(ActiveEntry {
            id: job.id,
            request: job.request.clone(),
            cancel: job.cancel.clone(),
        });
        let engine = self.clone();
        std::thread::Builder::new()
            .name(format!("transfer-{}", job.id))
            .spawn(move || engine.worker_main(job))
            .expect("unable to spawn transfer worker");
    }

    fn worker_main(&self, mut job: Job) {
        let outcome = self.run_attempts(&mut job);
        let cancelled = job.cancel.load(Ordering::Relaxed);

        let mut state = self.lock();
        state.active.retain(|entry| entry.id != job.id);
        if cancelled {
            // The whole record is dropped here, releasing the response URL
            // and token along with the slot.
            log::info!("transfer {} cancelled", job.id);
        } else {
            let final_state = match &outcome {
                Ok(()) => TransferState::Completed,
                Err(_) => TransferState::Failed,
            };
            state.finished.insert(
                job.id,
                Finished {
                    state: final_state,
                    error: outcome.as_ref().err().cloned(),
                },
            );
        }

        // Promote pending transfers in arrival order into the freed slot.
        let mut promoted = Vec::new();
        while state.active.len() + promoted.len() < self.inner.config.workers {
            match state.pending.pop_front() {
                Some(next) => promoted.push(next),
                None => break,
            }
        }
        for next in promoted {
            self.start_locked(&mut state, next);
        }
        drop(state);

        if !cancelled {
            let (final_state, percent) = match &outcome {
                Ok(()) => (TransferState::Completed, 100.0),
                Err(e) => {
                    log::warn!("transfer {} failed: {e}", job.id);
                    (TransferState::Failed, 0.0)
                }
            };
            if let Some(progress) = &job.progress {
                progress(&Progress {
                    state: final_state,
                    percent,
                    completed: true,
                });
            }
        }
    }

    fn run_attempts(&self, job: &mut Job) -> Result<()> {
        let mut attempts_done: u32 = 0;
        let mut last_seen_bytes = match job.request.direction.is_download() {
            true => fs::metadata(&job.request.local_path).map(|m| m.len()).unwrap_or(0),
            false => 0,
        };

        loop {
            if job.cancel.load(Ordering::Relaxed) {
                return Err(AgentError::new(ErrorKind::Failure, "transfer cancelled"));
            }
            if let Some(expiry) = job.request.expiry {
                if Utc::now() > expiry {
                    return Err(AgentError::new(ErrorKind::TimedOut, "transfer expired"));
                }
            }

            match self.one_attempt(job) {
                Ok(()) => return Ok(()),
                Err(e) if e.fatal => return Err(e.error),
                Err(e) => {
                    let bytes_now = fs::metadata(&job.request.local_path)
                        .map(|m| m.len())
                        .unwrap_or(0);
                    if job.request.direction.is_download() && bytes_now > last_seen_bytes {
                        // Forward progress resets the retry budget.
                        attempts_done = 0;
                        last_seen_bytes = bytes_now;
                    }
                    attempts_done += 1;
                    if !retry_allowed(self.inner.config.max_retry, attempts_done) {
                        return Err(e.error);
                    }
                    let delay = jittered(backoff_base(attempts_done));
                    log::debug!(
                        "transfer {} attempt {attempts_done} failed ({}), retrying in {delay:?}",
                        job.id,
                        e.error
                    );
                    if !sleep_with_cancel(delay, &job.cancel) {
                        return Err(AgentError::new(ErrorKind::Failure, "transfer cancelled"));
                    }
                }
            }
        }
    }

    fn one_attempt(&self, job: &mut Job) -> std::result::Result<(), http::HttpError> {
        match job.request.direction {
            TransferDirection::Download | TransferDirection::Ota => {
                let mut last_emit = job.last_emit;
                let result = {
                    let progress = job.progress.clone();
                    let expected_size = job.request.expected_size;
                    let mut observer = |written: u64, total: Option<u64>| {
                        emit_progress(&progress, &mut last_emit, expected_size, written, total);
                    };
                    http::download(
                        &self.inner.agent,
                        &job.request.url,
                        job.request.token.as_deref(),
                        &job.request.local_path,
                        &job.cancel,
                        &mut observer,
                    )
                };
                job.last_emit = last_emit;
                result?;

                if let Some(checksum) = job.request.checksum.clone() {
                    self.verify_checksum(&job.request, &checksum)?;
                }
                Ok(())
            }
            TransferDirection::Upload => http::upload(
                &self.inner.agent,
                &job.request.url,
                job.request.token.as_deref(),
                &job.request.local_path,
                &job.cancel,
            ),
        }
    }

    /// Verifies the on-disk digest. A mismatch deletes the file and is
    /// terminal; corrupt packages are never retried.
    fn verify_checksum(
        &self,
        request: &TransferRequest,
        checksum: &Checksum,
    ) -> std::result::Result<(), http::HttpError> {
        let actual = http::file_checksum(&request.local_path, checksum.algorithm)
            .map_err(|e| http::HttpError {
                error: AgentError::new(ErrorKind::IoError, e.to_string()),
                fatal: true,
            })?;
        if actual == checksum.hex.to_ascii_lowercase() {
            return Ok(());
        }

        log::error!(
            "checksum mismatch for {:?}: expected {}, computed {actual}",
            request.local_path,
            checksum.hex
        );
        if let Err(e) = fs::remove_file(&request.local_path) {
            log::warn!("unable to delete corrupt file {:?}: {e}", request.local_path);
        }
        Err(http::HttpError {
            error: AgentError::new(ErrorKind::Failure, "checksum mismatch"),
            fatal: true,
        })
    }

    pub fn state(&self, handle: TransferHandle) -> Option<TransferState> {
        let state = self.lock();
        if state.active.iter().any(|entry| entry.id == handle.0) {
            return Some(TransferState::InProgress);
        }
        if state.pending.iter().any(|job| job.id == handle.0) {
            return Some(TransferState::Pending);
        }
        state.finished.get(&handle.0).map(|finished| finished.state)
    }

    /// Removes and returns the terminal outcome of a finished transfer.
    pub fn take_finished(
        &self,
        handle: TransferHandle,
    ) -> Option<(TransferState, Option<AgentError>)> {
        self.lock()
            .finished
            .remove(&handle.0)
            .map(|finished| (finished.state, finished.error))
    }

    /// Flags a transfer for cancellation. Pending transfers are removed
    /// immediately; running workers observe the flag at their next I/O
    /// boundary.
    pub fn cancel(&self, handle: TransferHandle) -> Result<()> {
        let mut state = self.lock();
        if let Some(pos) = state.pending.iter().position(|job| job.id == handle.0) {
            state.pending.remove(pos);
            return Ok(());
        }
        if let Some(entry) = state.active.iter().find(|entry| entry.id == handle.0) {
            entry.cancel.store(true, Ordering::Relaxed);
            return Ok(());
        }
        if state.finished.remove(&handle.0).is_some() {
            return Ok(());
        }
        Err(AgentError::new(ErrorKind::NotFound, "unknown transfer handle"))
    }

    pub fn cancel_all(&self) {
        let mut state = self.lock();
        state.pending.clear();
        for entry in &state.active {
            entry.cancel.store(true, Ordering::Relaxed);
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Unfinished work for persistence: every active and pending request.
    pub fn snapshot_unfinished(&self) -> Vec<TransferRequest> {
        let state = self.lock();
        state
            .active
            .iter()
            .map(|entry| entry.request.clone())
            .chain(state.pending.iter().map(|job| job.request.clone()))
            .collect()
    }

    /// Re-queues persisted transfers, e.g. after a restart. Downloads resume
    /// from whatever is already on disk.
    pub fn restore(&self, requests: Vec<TransferRequest>) {
        for request in requests {
            if let Err(e) = self.begin(request, None) {
                log::warn!("unable to restore persisted transfer: {e}");
            }
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("transfer engine mutex poisoned");
        for entry in &state.active {
            entry.cancel.store(true, Ordering::Relaxed);
        }
    }
}

/// Throttled progress emission: at most one in-progress report per second
/// per transfer.
fn emit_progress(
    progress: &Option<Arc<ProgressCallback>>,
    last_emit: &mut Option<Instant>,
    expected_size: Option<u64>,
    written: u64,
    total: Option<u64>,
) {
    let Some(progress) = progress else { return };
    let now = Instant::now();
    if let Some(last) = *last_emit {
        if now.duration_since(last) < Duration::from_secs(1) {
            return;
        }
    }
    *last_emit = Some(now);
    let total = expected_size.or(total);
    let percent = match total {
        Some(0) | None => 100.0,
        Some(total) => (written as f64 / total as f64) * 100.0,
    };
    progress(&Progress {
        state: TransferState::InProgress,
        percent,
        completed: false,
    });
}

fn retry_allowed(max_retry: i32, attempts_done: u32) -> bool {
    if max_retry < 0 {
        return true;
    }
    let budget = (max_retry.max(1)) as u32;
    attempts_done < budget
}

/// Exponential base delay for the given attempt number, bounded by the
/// keep-alive interval.
fn backoff_base(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    let base = Duration::from_secs(1 << exp);
    base.min(KEEP_ALIVE)
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor).min(KEEP_ALIVE)
}

/// Sleeps for `delay`, waking early on cancellation. Returns false when
/// cancelled.
fn sleep_with_cancel(delay: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(Duration::from_millis(100).min(remaining));
    }
    !cancel.load(Ordering::Relaxed)
}
