//! VintageTube Core Library
//!
//! This crate provides the core functionality for the VintageTube desktop
//! downloader:
//! - FIFO download queue shared between the UI and the worker
//! - Sequential download worker with cooperative cancellation
//! - Progress normalization from the external engine's callbacks
//! - Settings persistence (save folder, transcoder location, theme)
//! - yt-dlp engine adapter (the engine itself stays an opaque dependency)

pub mod engine;
pub mod error;
pub mod progress;
pub mod queue;
pub mod settings;
pub mod worker;

pub use engine::{DownloadEngine, EngineInvocation, YtDlpEngine};
pub use error::{Error, Result};
pub use progress::{Phase, ProgressSnapshot};
pub use queue::{DownloadQueue, DownloadRequest, FormatKind, Quality};
pub use settings::SettingsStore;
pub use worker::{CancelSignal, DownloadWorker, RunConfig, WorkerEvent, WorkerState};
