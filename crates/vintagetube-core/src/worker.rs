//! Sequential download worker with cooperative cancellation.
//!
//! One worker handle owns one background thread at a time. A run drains the
//! queue front-to-back, invoking the external engine once per request; a
//! single item's failure is reported and the run moves on. Cancellation is
//! cooperative: the signal is checked between items by the loop and inside
//! items by the progress reporter, never preemptively.
//!
//! All sharing is through explicit handles (the queue, the cancel signal,
//! and the event channel) passed into the worker at construction. There
//! are no process-wide globals.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::engine::{DownloadEngine, EngineInvocation};
use crate::error::{Error, Result};
use crate::progress::{ProgressReporter, ProgressSnapshot};
use crate::queue::DownloadQueue;
use crate::settings::SettingsStore;

/// Shared cancellation flag for one worker handle.
///
/// Cleared immediately before a run starts, set by the cancel intent, never
/// reset mid-run. Observable from any thread without locking.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Create a signal in the cleared state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Reset the signal before a new run.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Lifecycle state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// No run in progress.
    #[default]
    Idle,
    /// A run is draining the queue.
    Running,
    /// Cancellation requested; the current item is finishing or aborting.
    Cancelling,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Cancelling => write!(f, "Cancelling"),
        }
    }
}

/// Per-run configuration resolved by the caller before starting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// Destination folder for downloads. A run cannot start without one.
    pub save_path: Option<PathBuf>,
    /// Location of the external transcoder binary, passed through to the
    /// engine when set.
    pub transcoder_path: Option<PathBuf>,
}

impl RunConfig {
    /// Build a run configuration from the settings store.
    #[must_use]
    pub fn from_settings(settings: &SettingsStore) -> Self {
        Self {
            save_path: settings.save_path(),
            transcoder_path: settings.transcoder_path(),
        }
    }
}

/// Notifications the worker sends to the presentation layer.
///
/// Delivered over an unbounded channel; the worker never blocks on, or
/// calls into, the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkerEvent {
    /// A request was dequeued and handed to the engine.
    ItemStarted {
        /// URL of the request.
        url: String,
    },
    /// Normalized progress for the item in flight.
    Progress(ProgressSnapshot),
    /// The engine failed for one request; the run continues.
    ItemFailed {
        /// URL of the failed request.
        url: String,
        /// Engine-reported error message.
        message: String,
    },
    /// The run stopped due to cancellation; remaining requests stay queued.
    RunCancelled,
    /// The run drained the queue completely.
    QueueFinished,
}

/// Handle to the download worker.
///
/// Cloning shares the same state machine, queue, and event channel. At most
/// one run is active per handle lineage; a start intent while a run is
/// active is a no-op.
#[derive(Clone)]
pub struct DownloadWorker {
    queue: DownloadQueue,
    engine: Arc<dyn DownloadEngine>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    state: Arc<Mutex<WorkerState>>,
    cancel: CancelSignal,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DownloadWorker {
    /// Create a worker over a queue and an engine.
    ///
    /// Returns the handle and the receiving end of its event channel.
    #[must_use]
    pub fn new(
        queue: DownloadQueue,
        engine: Arc<dyn DownloadEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let worker = Self {
            queue,
            engine,
            events,
            state: Arc::new(Mutex::new(WorkerState::Idle)),
            cancel: CancelSignal::new(),
            thread: Arc::new(Mutex::new(None)),
        };
        (worker, receiver)
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.lock_state()
    }

    /// Whether a run is in progress (running or cancelling).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() != WorkerState::Idle
    }

    /// The cancel signal shared with this worker's runs.
    #[must_use]
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Start a run draining the queue on a background thread.
    ///
    /// A start intent while a run is active is a no-op. Fails with
    /// [`Error::Configuration`] when the queue is empty or no save folder
    /// is configured; neither failure changes the worker state.
    pub fn start(&self, config: RunConfig) -> Result<()> {
        let mut state = self.lock_state();

        if *state != WorkerState::Idle {
            debug!("Start requested while {}; ignoring", *state);
            return Ok(());
        }

        if self.queue.is_empty() {
            return Err(Error::Configuration(
                "the download queue is empty".to_string(),
            ));
        }

        let Some(save_path) = config.save_path else {
            return Err(Error::Configuration(
                "no save folder is configured".to_string(),
            ));
        };

        // The previous run's thread has exited (state is Idle); reap it.
        if let Some(handle) = self.take_thread() {
            let _ = handle.join();
        }

        self.cancel.clear();
        info!("Starting download run: {} item(s) queued", self.queue.len());

        let worker = self.clone();
        let spawned = std::thread::Builder::new()
            .name("download-worker".to_string())
            .spawn(move || {
                worker.run_loop(&save_path, config.transcoder_path.as_deref());
            });

        match spawned {
            Ok(handle) => {
                *state = WorkerState::Running;
                *self
                    .thread
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Request cancellation of the active run.
    ///
    /// Cooperative: takes effect between items, or at the next progress
    /// callback inside the current item. Harmless when no run is active.
    pub fn cancel(&self) {
        let mut state = self.lock_state();
        if *state == WorkerState::Running {
            *state = WorkerState::Cancelling;
            info!("Cancellation requested; waiting for the current item");
        } else {
            debug!("Cancel requested while {}", *state);
        }
        self.cancel.set();
    }

    /// Block until the active run's thread has exited.
    ///
    /// Intended for shutdown paths and tests; a presentation event loop
    /// should never call this. No-op when no run is active.
    pub fn wait(&self) {
        if let Some(handle) = self.take_thread() {
            let _ = handle.join();
        }
    }

    fn run_loop(&self, save_path: &Path, transcoder_path: Option<&Path>) {
        let mut drained = false;

        loop {
            if self.cancel.is_set() {
                break;
            }

            let Some(request) = self.queue.dequeue_front() else {
                drained = true;
                break;
            };

            let url = request.url.clone();
            let _ = self.events.send(WorkerEvent::ItemStarted { url: url.clone() });

            let invocation = EngineInvocation::for_request(&request, save_path, transcoder_path);
            let mut reporter = ProgressReporter::new(self.cancel.clone(), self.events.clone());

            match self.engine.run(&invocation, &mut reporter) {
                Ok(()) => info!("Finished {}", url),
                Err(Error::Cancelled) => info!("Aborted {} on cancellation", url),
                Err(Error::Download { url, message }) => {
                    error!("Download failed for {}: {}", url, message);
                    let _ = self.events.send(WorkerEvent::ItemFailed { url, message });
                }
                Err(e) => {
                    error!("Download failed for {}: {}", url, e);
                    let _ = self.events.send(WorkerEvent::ItemFailed {
                        url,
                        message: e.to_string(),
                    });
                }
            }

            if self.cancel.is_set() {
                break;
            }
        }

        if drained {
            info!("Download queue finished");
            let _ = self
                .events
                .send(WorkerEvent::Progress(ProgressSnapshot::idle()));
            let _ = self.events.send(WorkerEvent::QueueFinished);
        } else {
            info!("Download run cancelled; {} item(s) left queued", self.queue.len());
            let _ = self.events.send(WorkerEvent::RunCancelled);
        }

        *self.lock_state() = WorkerState::Idle;
    }
}

impl std::fmt::Debug for DownloadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadWorker")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
