//! Progress normalization and the engine-facing progress reporter.
//!
//! The engine reports raw, engine-shaped events ([`ProgressEvent`]); the
//! presentation layer wants one normalized [`ProgressSnapshot`] per event.
//! [`ProgressReporter`] sits between the two: it is the sink handed to the
//! engine for each item, checks the cancellation signal before anything
//! else, and forwards snapshots over the worker's event channel.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{ProgressEvent, ProgressSink, SinkControl};
use crate::worker::{CancelSignal, WorkerEvent};

/// Phase of the current download, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No transfer in progress.
    #[default]
    Idle,
    /// Bytes are moving.
    Downloading,
    /// Transfer done; post-processing (e.g. transcoding) may still run.
    Finalizing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Finalizing => write!(f, "Finalizing"),
        }
    }
}

/// Normalized progress state, recomputed on every engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Percent complete in `[0, 100]`, when byte counters are known.
    pub percent: Option<f64>,
    /// Engine-rendered transfer speed, when known.
    pub speed: Option<String>,
    /// Engine-rendered time remaining, when known.
    pub eta: Option<String>,
    /// Engine-rendered percentage string, the fallback when `percent` is
    /// unknown.
    pub raw_percent: Option<String>,
    /// Current phase.
    pub phase: Phase,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

impl ProgressSnapshot {
    /// Snapshot for a worker at rest: 0%, no transfer.
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            percent: Some(0.0),
            speed: None,
            eta: None,
            raw_percent: None,
            phase: Phase::Idle,
        }
    }

    /// Normalize one engine event.
    #[must_use]
    pub fn from_event(event: &ProgressEvent) -> Self {
        match event {
            ProgressEvent::Downloading {
                downloaded_bytes,
                total_bytes,
                percent_str,
                speed,
                eta,
            } => {
                let percent = percent_from_bytes(*downloaded_bytes, *total_bytes);
                Self {
                    percent,
                    speed: speed.clone(),
                    eta: eta.clone(),
                    raw_percent: percent_str.as_deref().map(|s| s.trim().to_string()),
                    phase: Phase::Downloading,
                }
            }
            ProgressEvent::Finished => Self {
                percent: Some(100.0),
                speed: None,
                eta: None,
                raw_percent: None,
                phase: Phase::Finalizing,
            },
        }
    }

    /// One-line status rendering for a status bar.
    #[must_use]
    pub fn status_line(&self) -> String {
        match self.phase {
            Phase::Idle => "Ready".to_string(),
            Phase::Finalizing => "Finalizing download...".to_string(),
            Phase::Downloading => match self.percent {
                Some(percent) => format!(
                    "Downloading... {percent:.1}% at {} | ETA: {}",
                    self.speed.as_deref().unwrap_or("N/A"),
                    self.eta.as_deref().unwrap_or("N/A")
                ),
                None => format!(
                    "Downloading... {}",
                    self.raw_percent.as_deref().unwrap_or("N/A")
                ),
            },
        }
    }
}

/// Percentage from byte counters, when both are known and sane.
#[must_use]
pub fn percent_from_bytes(downloaded: Option<u64>, total: Option<u64>) -> Option<f64> {
    match (downloaded, total) {
        (Some(downloaded), Some(total)) if total > 0 => {
            Some(downloaded as f64 / total as f64 * 100.0)
        }
        _ => None,
    }
}

/// The sink handed to the engine for one item.
///
/// Checks the cancellation signal on every event *before* any other work;
/// a set signal turns into [`SinkControl::Abort`], which the engine is
/// contracted to treat as "stop this download now". Otherwise the event is
/// normalized and forwarded as [`WorkerEvent::Progress`]. Send failures are
/// ignored: a departed receiver must not break a running download.
pub struct ProgressReporter {
    cancel: CancelSignal,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl ProgressReporter {
    /// Create a reporter bound to a run's cancel signal and event channel.
    #[must_use]
    pub const fn new(cancel: CancelSignal, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { cancel, events }
    }
}

impl ProgressSink for ProgressReporter {
    fn on_event(&mut self, event: ProgressEvent) -> SinkControl {
        if self.cancel.is_set() {
            debug!("Cancellation observed in progress callback; aborting transfer");
            return SinkControl::Abort;
        }

        let snapshot = ProgressSnapshot::from_event(&event);
        let _ = self.events.send(WorkerEvent::Progress(snapshot));
        SinkControl::Continue
    }
}
