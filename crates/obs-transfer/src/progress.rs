//! Progress accounting across concurrent part tasks

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Default byte interval between notifications (100 KiB)
pub const DEFAULT_PROGRESS_BYTES: u64 = 100 * 1024;

/// Default time interval between notifications
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of per-tick samples in the speed window
pub const DEFAULT_SPEED_WINDOW: usize = 5;

/// Observer invoked with each progress snapshot
pub type ProgressObserver = Arc<dyn Fn(TransferStatus) + Send + Sync>;

/// How progress notifications are paced
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressType {
    /// Notify each time the byte count advances by the byte interval
    #[default]
    ByBytes,
    /// Notify on a fixed timer
    BySeconds,
}

/// Progress notification settings
#[derive(Clone, Debug)]
pub struct ProgressConfig {
    pub progress_type: ProgressType,
    /// Byte interval, used by `ByBytes`
    pub interval_bytes: u64,
    /// Timer interval, used by `BySeconds`
    pub interval: Duration,
    /// Samples kept for the instantaneous speed, used by `BySeconds`
    pub speed_window: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            progress_type: ProgressType::ByBytes,
            interval_bytes: DEFAULT_PROGRESS_BYTES,
            interval: DEFAULT_PROGRESS_INTERVAL,
            speed_window: DEFAULT_SPEED_WINDOW,
        }
    }
}

impl ProgressConfig {
    /// Notify every `bytes` transferred
    pub fn by_bytes(bytes: u64) -> Self {
        Self {
            progress_type: ProgressType::ByBytes,
            interval_bytes: bytes.max(1),
            ..Default::default()
        }
    }

    /// Notify every `interval`
    pub fn by_seconds(interval: Duration) -> Self {
        Self {
            progress_type: ProgressType::BySeconds,
            interval: interval.max(Duration::from_millis(10)),
            ..Default::default()
        }
    }
}

/// Immutable progress snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct TransferStatus {
    /// Bytes transferred since the previous notification
    pub newly_transferred_bytes: u64,
    /// Bytes transferred so far, including resumed parts
    pub transferred_bytes: u64,
    /// Total bytes, negative when unknown
    pub total_bytes: i64,
    /// Time since the previous notification
    pub interval: Duration,
    /// Time since the transfer started
    pub total_elapsed: Duration,
    /// Bytes and time covered by the rolling speed window, if any
    pub window: Option<(u64, Duration)>,
}

impl TransferStatus {
    /// Bytes per second over the last interval, or the rolling window
    pub fn instantaneous_speed(&self) -> f64 {
        let (bytes, elapsed) = self
            .window
            .unwrap_or((self.newly_transferred_bytes, self.interval));
        rate(bytes, elapsed)
    }

    /// Bytes per second since the transfer started
    pub fn average_speed(&self) -> f64 {
        rate(self.transferred_bytes, self.total_elapsed)
    }

    /// Whole percent complete; -1 if the total is unknown
    pub fn transfer_percentage(&self) -> i32 {
        if self.total_bytes < 0 {
            return -1;
        }
        if self.total_bytes == 0 {
            return 100;
        }
        (u128::from(self.transferred_bytes) * 100 / self.total_bytes as u128) as i32
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        bytes as f64 / secs
    }
}

/// Accumulates bytes from concurrent part tasks and paces notifications.
///
/// `record` is called from any task; the observer is invoked under a mutex
/// so notifications never interleave.
#[derive(Clone)]
pub struct ProgressAggregator {
    inner: Arc<Inner>,
}

struct Inner {
    total_bytes: i64,
    transferred: AtomicU64,
    config: ProgressConfig,
    observer: Option<ProgressObserver>,
    state: Mutex<EmitState>,
    started: Instant,
    ticker: CancellationToken,
}

struct EmitState {
    last_emitted_bytes: u64,
    last_emit_at: Instant,
    samples: VecDeque<(u64, Duration)>,
    finished: bool,
}

impl ProgressAggregator {
    /// Aggregator for `total_bytes` (negative when unknown)
    pub fn new(total_bytes: i64, config: ProgressConfig, observer: Option<ProgressObserver>) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                total_bytes,
                transferred: AtomicU64::new(0),
                config,
                observer,
                state: Mutex::new(EmitState {
                    last_emitted_bytes: 0,
                    last_emit_at: now,
                    samples: VecDeque::new(),
                    finished: false,
                }),
                started: now,
                ticker: CancellationToken::new(),
            }),
        }
    }

    /// Count bytes already transferred by an earlier run. Call before
    /// `start`; resumed bytes show up in `transferred_bytes` but never in
    /// `newly_transferred_bytes`.
    pub fn with_initial(self, bytes: u64) -> Self {
        self.inner.transferred.store(bytes, Ordering::SeqCst);
        self.inner.state.lock().last_emitted_bytes = bytes;
        self
    }

    /// Start the timer for `BySeconds` pacing. No-op for `ByBytes` or
    /// without an observer.
    pub fn start(&self) {
        if self.inner.config.progress_type != ProgressType::BySeconds || self.inner.observer.is_none() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.ticker.clone();
        let period = self.inner.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match weak.upgrade() {
                        Some(inner) => inner.tick(),
                        None => break,
                    },
                }
            }
        });
    }

    /// Add `bytes` to the running total
    pub fn record(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let current = self.inner.transferred.fetch_add(bytes, Ordering::SeqCst) + bytes;

        if self.inner.config.progress_type != ProgressType::ByBytes || self.inner.observer.is_none() {
            return;
        }

        let mut state = self.inner.state.lock();
        if state.finished || current.saturating_sub(state.last_emitted_bytes) < self.inner.config.interval_bytes {
            return;
        }
        let current = self.inner.transferred.load(Ordering::SeqCst);
        self.inner.emit(&mut state, current, None);
    }

    /// Bytes counted so far
    pub fn transferred_bytes(&self) -> u64 {
        self.inner.transferred.load(Ordering::SeqCst)
    }

    /// Stop the timer and send a final notification if anything is unreported
    pub fn finish(&self) {
        self.inner.ticker.cancel();
        let mut state = self.inner.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;

        let current = self.inner.transferred.load(Ordering::SeqCst);
        let never_emitted = state.last_emit_at == self.inner.started;
        if current > state.last_emitted_bytes || never_emitted {
            self.inner.emit(&mut state, current, None);
        }
    }

    /// Stop the timer without a final notification
    pub fn stop(&self) {
        self.inner.ticker.cancel();
        self.inner.state.lock().finished = true;
    }
}

impl Inner {
    fn tick(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }

        let current = self.transferred.load(Ordering::SeqCst);
        let newly = current - state.last_emitted_bytes;
        if newly == 0 && self.total_bytes >= 0 && current as i64 == self.total_bytes {
            return;
        }

        let elapsed = state.last_emit_at.elapsed();
        state.samples.push_back((newly, elapsed));
        while state.samples.len() > self.config.speed_window.max(1) {
            state.samples.pop_front();
        }
        let window = state
            .samples
            .iter()
            .fold((0u64, Duration::ZERO), |(b, d), (sb, sd)| (b + sb, d + *sd));

        self.emit(&mut state, current, Some(window));
    }

    fn emit(&self, state: &mut EmitState, current: u64, window: Option<(u64, Duration)>) {
        let Some(observer) = &self.observer else {
            return;
        };
        let now = Instant::now();
        let status = TransferStatus {
            newly_transferred_bytes: current - state.last_emitted_bytes,
            transferred_bytes: current,
            total_bytes: self.total_bytes,
            interval: now.duration_since(state.last_emit_at),
            total_elapsed: now.duration_since(self.started),
            window,
        };
        state.last_emitted_bytes = current;
        state.last_emit_at = now;
        observer(status);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.ticker.cancel();
    }
}
