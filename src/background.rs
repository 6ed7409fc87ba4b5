//! Background face-match loop driving automatic door opens.
//!
//! A timer (or an explicit request) runs a *cycle*: for every enrolled
//! door, fetch the current camera frame, match it against the known faces,
//! and — if a match clears the per-door cooldown — open the door. The
//! loop gates a physical side effect, so its concurrency rules are strict:
//!
//! - **Single flight**: at most one cycle runs at a time. The worker task
//!   is the only scheduler-driven runner and a `tokio::sync::Mutex`
//!   additionally serializes manual [`BackgroundCycle::run_once`] calls.
//! - **Coalescing**: a cycle requested while one is running is stored as a
//!   single pending permit and runs exactly once afterwards — requests are
//!   never dropped and never pile up.
//! - **Cooldown**: only a confirmed successful open stamps the cooldown;
//!   a failed open leaves the door immediately retryable.
//! - **Teardown**: cancellation stops scheduled-but-not-started cycles;
//!   an in-flight cycle always runs to completion so an open command is
//!   never left half-issued.
//!
//! Partial failures (one door's frame fetch, match or open) are logged and
//! isolated; they never abort the remaining doors.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::{RelayCatalog, RelayRecord};
use crate::command::DoorOpener;
use crate::error::ApiError;
use crate::face::FaceMatcher;

/// Default delay between scheduled cycles.
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_secs(10);

/// Default minimum time between automatic opens of the same door.
pub const DEFAULT_OPEN_COOLDOWN: Duration = Duration::from_secs(60);

/// Async capability fetching a camera frame by URL.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn fetch_frame(&self, url: &str) -> Result<Vec<u8>, ApiError>;
}

/// `reqwest`-backed frame source for the relay camera snapshot URLs.
pub struct HttpFrameSource {
    http: reqwest::Client,
}

impl HttpFrameSource {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn fetch_frame(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Source of the current door listing; the catalog implements this so the
/// loop always works against the latest refreshed records.
pub trait DoorDirectory: Send + Sync {
    fn current_doors(&self) -> Vec<RelayRecord>;
}

impl DoorDirectory for RelayCatalog {
    fn current_doors(&self) -> Vec<RelayRecord> {
        self.snapshot()
    }
}

/// Timing knobs for the loop.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub interval: Duration,
    pub cooldown: Duration,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CYCLE_INTERVAL,
            cooldown: DEFAULT_OPEN_COOLDOWN,
        }
    }
}

/// What one cycle did — useful for hosts and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Doors that went through fetch/match.
    pub processed: usize,
    /// Doors opened by a confirmed successful command.
    pub opened: usize,
    /// Doors dropped from the selection because the catalog lost them.
    pub pruned: usize,
}

/// Pick the default doors to enroll: the main video-capable entrance, or
/// failing that the first door with a camera.
pub fn default_selection(doors: &[RelayRecord]) -> Vec<String> {
    let candidates: Vec<&RelayRecord> = doors
        .iter()
        .filter(|door| door.has_video && door.image_url.is_some())
        .collect();
    if let Some(main) = candidates.iter().find(|door| door.is_main) {
        return vec![main.uid.clone()];
    }
    candidates
        .first()
        .map(|door| vec![door.uid.clone()])
        .unwrap_or_default()
}

struct CycleInner {
    directory: Arc<dyn DoorDirectory>,
    opener: Arc<dyn DoorOpener>,
    matcher: Arc<FaceMatcher>,
    frames: Arc<dyn FrameSource>,
    interval: Duration,
    cooldown: Duration,
    selection: Mutex<HashSet<String>>,
    last_open: Mutex<HashMap<String, Instant>>,
    /// Serializes cycles across the worker and manual `run_once` callers.
    cycle_lock: tokio::sync::Mutex<()>,
    /// Pending-run coalescing: holds at most one stored permit.
    trigger: Notify,
    cancel: CancellationToken,
    timer: Mutex<Option<CancellationToken>>,
}

impl CycleInner {
    async fn run_cycle(&self) -> CycleReport {
        let _flight = self.cycle_lock.lock().await;
        let mut report = CycleReport::default();

        let selected: Vec<String> = {
            let selection = self.selection.lock();
            let mut uids: Vec<String> = selection.iter().cloned().collect();
            uids.sort();
            uids
        };
        if selected.is_empty() {
            return report;
        }

        let doors: HashMap<String, RelayRecord> = self
            .directory
            .current_doors()
            .into_iter()
            .map(|door| (door.uid.clone(), door))
            .collect();

        for uid in selected {
            let Some(door) = doors.get(&uid) else {
                tracing::info!(uid = %uid, "door no longer listed, pruning from background selection");
                self.selection.lock().remove(&uid);
                report.pruned += 1;
                continue;
            };
            let Some(image_url) = door.image_url.as_deref() else {
                tracing::debug!(uid = %uid, "door has no frame URL, skipping");
                continue;
            };
            report.processed += 1;

            let frame = match self.frames.fetch_frame(image_url).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(uid = %uid, error = %err, "failed to fetch door frame");
                    continue;
                }
            };

            let Some(name) = self.matcher.match_frame(&frame) else {
                continue;
            };

            let now = Instant::now();
            let in_cooldown = self
                .last_open
                .lock()
                .get(&uid)
                .is_some_and(|last| now.duration_since(*last) < self.cooldown);
            if in_cooldown {
                tracing::debug!(uid = %uid, name = %name, "match ignored, door cooldown active");
                continue;
            }

            tracing::info!(uid = %uid, name = %name, "known face matched, opening door");
            match self.opener.open(door).await {
                Ok(()) => {
                    self.last_open.lock().insert(uid.clone(), now);
                    report.opened += 1;
                }
                Err(err) => {
                    // The cooldown is not stamped: the next cycle may retry.
                    tracing::error!(uid = %uid, error = %err, "automatic door open failed");
                }
            }
        }

        if self.selection.lock().is_empty() {
            self.disarm_timer();
        }
        report
    }

    fn disarm_timer(&self) {
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
            tracing::info!("background timer disarmed: no doors selected");
        }
    }
}

/// Periodic face-gated auto-open driver for a selected set of doors.
pub struct BackgroundCycle {
    inner: Arc<CycleInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundCycle {
    pub fn new(
        directory: Arc<dyn DoorDirectory>,
        opener: Arc<dyn DoorOpener>,
        matcher: Arc<FaceMatcher>,
        frames: Arc<dyn FrameSource>,
        options: CycleOptions,
    ) -> Self {
        Self {
            inner: Arc::new(CycleInner {
                directory,
                opener,
                matcher,
                frames,
                interval: options.interval,
                cooldown: options.cooldown,
                selection: Mutex::new(HashSet::new()),
                last_open: Mutex::new(HashMap::new()),
                cycle_lock: tokio::sync::Mutex::new(()),
                trigger: Notify::new(),
                cancel: CancellationToken::new(),
                timer: Mutex::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker that drains coalesced cycle requests.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                // Cancellation wins over a stored trigger permit, so a
                // scheduled-but-not-started cycle never runs after teardown.
                tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => break,
                    _ = inner.trigger.notified() => {
                        inner.run_cycle().await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Replace the enrolled door set. A non-empty selection (re)arms the
    /// timer; an empty one disarms it.
    pub fn set_selection(&self, uids: impl IntoIterator<Item = String>) {
        let uids: HashSet<String> = uids.into_iter().collect();
        let empty = uids.is_empty();
        let count = uids.len();
        *self.inner.selection.lock() = uids;
        if empty {
            self.inner.disarm_timer();
        } else {
            tracing::info!(doors = count, "background selection updated");
            self.arm_timer();
        }
    }

    /// Currently enrolled door uids (sorted, for stable display).
    pub fn selection(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.inner.selection.lock().iter().cloned().collect();
        uids.sort();
        uids
    }

    /// Request one cycle. If a cycle is already running the request is
    /// coalesced into a single pending run.
    pub fn request_cycle(&self) {
        self.inner.trigger.notify_one();
    }

    /// Run one cycle inline (manual trigger, tests). Serialized against
    /// the worker by the cycle lock.
    pub async fn run_once(&self) -> CycleReport {
        self.inner.run_cycle().await
    }

    fn arm_timer(&self) {
        let mut slot = self.inner.timer.lock();
        if slot.is_some() {
            return;
        }
        let token = self.inner.cancel.child_token();
        *slot = Some(token.clone());
        drop(slot);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; wait a full period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => inner.trigger.notify_one(),
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Cancel the timer and worker and wait for them to finish. An
    /// in-flight cycle completes before the worker exits.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!("background cycle stopped");
    }
}
