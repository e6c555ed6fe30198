//! Download queue for pending requests.
//!
//! The queue is a plain FIFO of [`DownloadRequest`]s shared between the
//! presentation thread (which appends and clears) and the worker thread
//! (which pops the front). A request leaves the queue *before* it is
//! processed, so at most one request is ever in flight and clearing the
//! queue can never touch an item the worker already owns.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Output kind for a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    /// Download the video stream, muxed with audio.
    #[default]
    Video,
    /// Extract the audio stream and transcode it to MP3.
    Audio,
}

impl std::fmt::Display for FormatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "Video"),
            Self::Audio => write!(f, "Audio (MP3)"),
        }
    }
}

/// Requested video quality cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Quality {
    /// Up to 144p.
    #[serde(rename = "144p")]
    P144,
    /// Up to 240p.
    #[serde(rename = "240p")]
    P240,
    /// Up to 360p.
    #[serde(rename = "360p")]
    P360,
    /// Up to 480p.
    #[serde(rename = "480p")]
    P480,
    /// Up to 720p (default).
    #[default]
    #[serde(rename = "720p")]
    P720,
    /// Up to 1080p.
    #[serde(rename = "1080p")]
    P1080,
    /// Best available, no height cap.
    #[serde(rename = "best")]
    Best,
}

impl Quality {
    /// Maximum stream height for this quality, or `None` for no cap.
    #[must_use]
    pub const fn height_cap(self) -> Option<u32> {
        match self {
            Self::P144 => Some(144),
            Self::P240 => Some(240),
            Self::P360 => Some(360),
            Self::P480 => Some(480),
            Self::P720 => Some(720),
            Self::P1080 => Some(1080),
            Self::Best => None,
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P144 => write!(f, "144p"),
            Self::P240 => write!(f, "240p"),
            Self::P360 => write!(f, "360p"),
            Self::P480 => write!(f, "480p"),
            Self::P720 => write!(f, "720p"),
            Self::P1080 => write!(f, "1080p"),
            Self::Best => write!(f, "best"),
        }
    }
}

/// One user-specified unit of work: a URL plus download options.
///
/// Immutable once created. Owned by the queue until the worker pops it, at
/// which point ownership transfers to the worker for the duration of the
/// engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Video or playlist URL. Non-emptiness is the caller's responsibility.
    pub url: String,
    /// Whether to keep the video or extract audio.
    #[serde(default)]
    pub format: FormatKind,
    /// Quality cap for video downloads; ignored for audio.
    #[serde(default)]
    pub quality: Quality,
    /// Whether the URL should be saved with the playlist output template.
    #[serde(default)]
    pub is_playlist: bool,
}

impl DownloadRequest {
    /// Create a request with default options (video, 720p, single item).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: FormatKind::default(),
            quality: Quality::default(),
            is_playlist: false,
        }
    }

    /// Set the output kind.
    #[must_use]
    pub const fn with_format(mut self, format: FormatKind) -> Self {
        self.format = format;
        self
    }

    /// Set the quality cap.
    #[must_use]
    pub const fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Mark the request as a playlist download.
    #[must_use]
    pub const fn as_playlist(mut self, is_playlist: bool) -> Self {
        self.is_playlist = is_playlist;
        self
    }
}

/// Shared handle to the FIFO of pending download requests.
///
/// Cloning the handle shares the same underlying queue. All operations are
/// atomic with respect to each other; no ordering is promised between an
/// `enqueue` racing a `dequeue_front` beyond that.
#[derive(Debug, Clone, Default)]
pub struct DownloadQueue {
    items: Arc<Mutex<VecDeque<DownloadRequest>>>,
}

impl DownloadQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<DownloadRequest>> {
        // A poisoned lock only means another thread panicked mid-operation;
        // the queue itself is still a coherent VecDeque.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a request to the back of the queue.
    pub fn enqueue(&self, request: DownloadRequest) {
        let mut items = self.items();
        info!(
            "Queued {} ({}, {}): {} item(s) pending",
            request.url,
            request.format,
            request.quality,
            items.len() + 1
        );
        items.push_back(request);
    }

    /// Remove all pending requests.
    ///
    /// Never affects a request the worker has already dequeued.
    pub fn clear(&self) {
        let mut items = self.items();
        let removed = items.len();
        items.clear();
        info!("Cleared {} request(s) from the queue", removed);
    }

    /// Remove and return the request at the front, if any.
    pub fn dequeue_front(&self) -> Option<DownloadRequest> {
        let request = self.items().pop_front();
        if let Some(ref request) = request {
            debug!("Dequeued {}", request.url);
        }
        request
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Whether the queue holds no pending requests.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Clone of the pending requests, front first, for display purposes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DownloadRequest> {
        self.items().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequeue_returns_fifo_order() {
        let queue = DownloadQueue::new();
        queue.enqueue(DownloadRequest::new("url-1"));
        queue.enqueue(DownloadRequest::new("url-2").with_format(FormatKind::Audio));
        queue.enqueue(DownloadRequest::new("url-3").with_quality(Quality::P480));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue_front().map(|r| r.url), Some("url-1".into()));
        assert_eq!(queue.dequeue_front().map(|r| r.url), Some("url-2".into()));
        assert_eq!(queue.dequeue_front().map(|r| r.url), Some("url-3".into()));
        assert!(queue.dequeue_front().is_none());
    }

    #[test]
    fn test_clear_then_dequeue_is_empty() {
        let queue = DownloadQueue::new();
        queue.enqueue(DownloadRequest::new("url-1"));
        queue.enqueue(DownloadRequest::new("url-2"));

        queue.clear();

        assert!(queue.is_empty());
        assert!(queue.dequeue_front().is_none());
    }

    #[test]
    fn test_clear_on_empty_queue_is_a_no_op() {
        let queue = DownloadQueue::new();
        queue.clear();
        assert!(queue.dequeue_front().is_none());
    }

    #[test]
    fn test_clones_share_the_same_queue() {
        let queue = DownloadQueue::new();
        let other = queue.clone();

        queue.enqueue(DownloadRequest::new("url-1"));
        assert_eq!(other.len(), 1);

        assert_eq!(other.dequeue_front().map(|r| r.url), Some("url-1".into()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_snapshot_preserves_order_and_contents() {
        let queue = DownloadQueue::new();
        queue.enqueue(DownloadRequest::new("url-1"));
        queue.enqueue(
            DownloadRequest::new("url-2")
                .with_format(FormatKind::Audio)
                .as_playlist(true),
        );

        let rows = queue.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].url, "url-1");
        assert_eq!(rows[1].format, FormatKind::Audio);
        assert!(rows[1].is_playlist);

        // Snapshot is a copy, not a drain.
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_concurrent_enqueue_and_dequeue_stay_coherent() {
        let queue = DownloadQueue::new();
        let producer_queue = queue.clone();

        let producer = std::thread::spawn(move || {
            for i in 0..100 {
                producer_queue.enqueue(DownloadRequest::new(format!("url-{i}")));
            }
        });

        let mut popped = 0;
        while popped < 100 {
            if queue.dequeue_front().is_some() {
                popped += 1;
            } else {
                std::thread::yield_now();
            }
        }

        producer.join().expect("producer thread panicked");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_quality_height_caps() {
        assert_eq!(Quality::P144.height_cap(), Some(144));
        assert_eq!(Quality::P1080.height_cap(), Some(1080));
        assert_eq!(Quality::Best.height_cap(), None);
    }

    #[test]
    fn test_request_serialization_roundtrip() {
        let request = DownloadRequest::new("https://example.com/watch?v=abc")
            .with_format(FormatKind::Audio)
            .with_quality(Quality::P360)
            .as_playlist(true);

        let json = serde_json::to_string(&request).expect("serialize");
        assert!(json.contains("\"audio\""));
        assert!(json.contains("\"360p\""));

        let back: DownloadRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, request);
    }
}
