//! Progress reporting for a run.
//!
//! Workers only bump atomic counters in a shared [`ProgressTracker`]. A
//! separate renderer task started by [`ProgressReporter::spawn`] copies the
//! counters into terminal progress bars (or periodic log lines) at a fixed
//! rate, so reporting never blocks a worker or the aggregator.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How progress is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    /// Aggregate bar plus one line per worker on stderr.
    #[default]
    Bars,
    /// Periodic `info` log lines.
    Log,
    /// Counters only.
    Hidden,
}

impl fmt::Display for ProgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressMode::Bars => write!(f, "bars"),
            ProgressMode::Log => write!(f, "log"),
            ProgressMode::Hidden => write!(f, "hidden"),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bars" | "bar" => Ok(ProgressMode::Bars),
            "log" => Ok(ProgressMode::Log),
            "hidden" | "none" | "off" => Ok(ProgressMode::Hidden),
            other => Err(format!(
                "unknown progress mode '{}', expected 'bars', 'log' or 'hidden'",
                other
            )),
        }
    }
}

/// Shared per-worker and aggregate counters.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    done: AtomicU64,
    per_worker: Vec<AtomicU64>,
}

/// Point-in-time copy of a [`ProgressTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub done: u64,
    pub per_worker: Vec<u64>,
}

impl ProgressTracker {
    pub fn new(total: u64, workers: usize) -> Self {
        Self {
            total,
            done: AtomicU64::new(0),
            per_worker: (0..workers).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Counts one finished item for `worker_id`.
    pub fn record(&self, worker_id: usize) {
        if let Some(counter) = self.per_worker.get(worker_id) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            done: self.done(),
            per_worker: self
                .per_worker
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

/// Handle to the renderer task.
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Starts rendering `tracker` every `refresh`.
    pub fn spawn(tracker: Arc<ProgressTracker>, mode: ProgressMode, refresh: Duration) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let renderer = Renderer::new(Arc::clone(&tracker), mode);
        let handle = tokio::spawn(renderer.run(refresh, stop_rx));

        Self {
            tracker,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Stops the renderer after one last refresh and returns the final counts.
    pub async fn finish(mut self) -> ProgressSnapshot {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Progress renderer task failed");
            }
        }
        self.tracker.snapshot()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

struct Renderer {
    tracker: Arc<ProgressTracker>,
    mode: ProgressMode,
    bars: Option<Bars>,
    last_logged: u64,
}

struct Bars {
    _multi: MultiProgress,
    overall: ProgressBar,
    workers: Vec<ProgressBar>,
}

impl Bars {
    fn new(total: u64, workers: usize) -> Self {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(4));

        let overall = multi.add(ProgressBar::new(total));
        overall.set_style(
            ProgressStyle::with_template(
                "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        overall.set_message("total");

        let worker_style = ProgressStyle::with_template("  {prefix:>10} {pos} done")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let workers = (0..workers)
            .map(|id| {
                let bar = multi.add(ProgressBar::new(total));
                bar.set_style(worker_style.clone());
                bar.set_prefix(format!("worker-{}", id));
                bar
            })
            .collect();

        Self {
            _multi: multi,
            overall,
            workers,
        }
    }

    fn update(&self, snapshot: &ProgressSnapshot) {
        self.overall.set_position(snapshot.done);
        for (bar, done) in self.workers.iter().zip(&snapshot.per_worker) {
            bar.set_position(*done);
        }
    }

    fn finish(&self) {
        for bar in &self.workers {
            bar.finish();
        }
        self.overall.finish();
    }
}

impl Renderer {
    fn new(tracker: Arc<ProgressTracker>, mode: ProgressMode) -> Self {
        let bars = match mode {
            ProgressMode::Bars => Some(Bars::new(tracker.total(), tracker.per_worker.len())),
            _ => None,
        };
        Self {
            tracker,
            mode,
            bars,
            last_logged: u64::MAX,
        }
    }

    async fn run(mut self, refresh: Duration, mut stop_rx: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.render(),
                _ = &mut stop_rx => break,
            }
        }

        self.render();
        if let Some(bars) = &self.bars {
            bars.finish();
        }
    }

    fn render(&mut self) {
        let snapshot = self.tracker.snapshot();
        match self.mode {
            ProgressMode::Bars => {
                if let Some(bars) = &self.bars {
                    bars.update(&snapshot);
                }
            }
            ProgressMode::Log => {
                if snapshot.done != self.last_logged {
                    self.last_logged = snapshot.done;
                    tracing::info!(done = snapshot.done, total = snapshot.total, "Progress");
                }
            }
            ProgressMode::Hidden => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_mode_parsing() {
        assert_eq!("log".parse::<ProgressMode>(), Ok(ProgressMode::Log));
        assert_eq!("OFF".parse::<ProgressMode>(), Ok(ProgressMode::Hidden));
        assert!("fancy".parse::<ProgressMode>().is_err());
        assert_eq!(ProgressMode::default().to_string(), "bars");
    }

    #[test]
    fn test_tracker_counts() {
        let tracker = ProgressTracker::new(10, 2);
        tracker.record(0);
        tracker.record(1);
        tracker.record(1);
        // Unknown worker ids still count toward the total.
        tracker.record(7);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total, 10);
        assert_eq!(snapshot.done, 4);
        assert_eq!(snapshot.per_worker, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_reporter_finish_returns_final_counts() {
        let tracker = Arc::new(ProgressTracker::new(3, 1));
        let reporter = ProgressReporter::spawn(
            Arc::clone(&tracker),
            ProgressMode::Hidden,
            Duration::from_millis(10),
        );

        tracker.record(0);
        tracker.record(0);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = reporter.finish().await;
        assert_eq!(snapshot.done, 2);
        assert_eq!(snapshot.per_worker, vec![2]);
    }

    #[tokio::test]
    async fn test_log_mode_runs() {
        let tracker = Arc::new(ProgressTracker::new(1, 1));
        let reporter =
            ProgressReporter::spawn(Arc::clone(&tracker), ProgressMode::Log, Duration::from_millis(5));
        tracker.record(0);
        assert_eq!(reporter.finish().await.done, 1);
    }
}
