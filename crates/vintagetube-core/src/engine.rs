//! External download engine contract and the yt-dlp adapter.
//!
//! The engine performs the actual network fetch, stream selection, and
//! transcoder invocation; this crate never reimplements any of that. The
//! worker hands the engine an [`EngineInvocation`] describing one request
//! and a [`ProgressSink`] the engine calls back into *synchronously, on the
//! worker's own thread*, at whatever intervals it reports progress.
//!
//! Cancellation contract: when the sink returns [`SinkControl::Abort`], the
//! engine must stop the current transfer immediately and return
//! [`Error::Cancelled`]. That return is the only mid-item cancellation
//! mechanism; between items the worker checks the signal itself.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::queue::{DownloadRequest, FormatKind};

/// MP3 bitrate used when extracting audio, in kbps.
pub const MP3_BITRATE_KBPS: u32 = 192;

/// Container every video download is merged into.
pub const VIDEO_CONTAINER: &str = "mp4";

/// Post-processing step the engine applies after the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessing {
    /// Extract the audio stream and transcode it to MP3.
    ExtractMp3 {
        /// Target bitrate in kbps.
        bitrate_kbps: u32,
    },
    /// Remux the merged streams into the standard container.
    RemuxMp4,
}

/// Everything the external engine needs to process one request.
///
/// Built by the worker from a [`DownloadRequest`] plus the run
/// configuration; the engine treats it as opaque input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    /// URL to download.
    pub url: String,
    /// Format selector string, in the engine's selector syntax.
    pub format_selector: String,
    /// Output path template, in the engine's template syntax.
    pub output_template: String,
    /// Container the selected streams are merged into, when applicable.
    pub merge_output_format: Option<String>,
    /// Post-processing directive.
    pub post_processing: PostProcessing,
    /// Location of the external transcoder binary, if configured.
    pub transcoder_location: Option<PathBuf>,
}

impl EngineInvocation {
    /// Build the invocation for one request.
    ///
    /// Audio requests always select the best audio stream and transcode to
    /// MP3 at 192 kbps, regardless of the request's quality field. Video
    /// requests cap the stream height at the requested quality, preferring
    /// mp4/avc1 with m4a audio and falling back to a generic capped
    /// selector when that pairing is unavailable.
    #[must_use]
    pub fn for_request(
        request: &DownloadRequest,
        save_path: &Path,
        transcoder_location: Option<&Path>,
    ) -> Self {
        let (format_selector, merge_output_format, post_processing) = match request.format {
            FormatKind::Audio => (
                "bestaudio/best".to_string(),
                None,
                PostProcessing::ExtractMp3 {
                    bitrate_kbps: MP3_BITRATE_KBPS,
                },
            ),
            FormatKind::Video => (
                video_format_selector(request.quality.height_cap()),
                Some(VIDEO_CONTAINER.to_string()),
                PostProcessing::RemuxMp4,
            ),
        };

        Self {
            url: request.url.clone(),
            format_selector,
            output_template: output_template(save_path, request.is_playlist),
            merge_output_format,
            post_processing,
            transcoder_location: transcoder_location.map(Path::to_path_buf),
        }
    }
}

/// Selector for a video download with an optional height cap.
fn video_format_selector(height_cap: Option<u32>) -> String {
    match height_cap {
        Some(height) => format!(
            "bestvideo[height<={height}][ext=mp4][vcodec^=avc1]+bestaudio[ext=m4a]\
             /best[height<={height}][ext=mp4]"
        ),
        None => {
            "bestvideo[ext=mp4][vcodec^=avc1]+bestaudio[ext=m4a]/best[ext=mp4]".to_string()
        }
    }
}

/// Output path template for a request.
///
/// Playlists get a per-playlist subdirectory with indexed entries; single
/// items land directly in the save folder.
fn output_template(save_path: &Path, is_playlist: bool) -> String {
    let template = if is_playlist {
        save_path
            .join("%(playlist)s")
            .join("%(playlist_index)s - %(title)s.%(ext)s")
    } else {
        save_path.join("%(title)s.%(ext)s")
    };
    template.display().to_string()
}

/// Flow-control value returned by the progress sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkControl {
    /// Keep going.
    Continue,
    /// Stop the current transfer now; the engine returns `Error::Cancelled`.
    Abort,
}

/// One progress report from the engine during a transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Bytes are moving. Counters are absent when the engine does not know
    /// them; `percent_str` carries the engine's own rendering as a fallback.
    Downloading {
        /// Bytes transferred so far for the current file.
        downloaded_bytes: Option<u64>,
        /// Total (or estimated total) bytes for the current file.
        total_bytes: Option<u64>,
        /// Engine-rendered percentage, e.g. `" 42.1%"`.
        percent_str: Option<String>,
        /// Engine-rendered transfer speed, e.g. `"1.23MiB/s"`.
        speed: Option<String>,
        /// Engine-rendered time remaining, e.g. `"00:42"`.
        eta: Option<String>,
    },
    /// The transfer finished; post-processing may still be running.
    Finished,
}

/// Callback sink the engine drives during a transfer.
///
/// Called synchronously from within the engine invocation, on the worker
/// thread. Implementations must be fast and must never block on the
/// presentation layer.
pub trait ProgressSink {
    /// Handle one progress event and decide whether the transfer continues.
    fn on_event(&mut self, event: ProgressEvent) -> SinkControl;
}

/// Opaque external download engine.
///
/// Implementations run one invocation to completion, reporting progress via
/// the sink, and honor [`SinkControl::Abort`] by stopping the transfer and
/// returning [`Error::Cancelled`].
#[cfg_attr(test, mockall::automock)]
pub trait DownloadEngine: Send + Sync {
    /// Process one invocation synchronously.
    fn run(&self, invocation: &EngineInvocation, sink: &mut dyn ProgressSink) -> Result<()>;
}

/// Name of the engine binary searched on `PATH` when no explicit path is set.
const DEFAULT_BINARY: &str = "yt-dlp";

/// Progress template handed to yt-dlp so every report arrives as one
/// machine-parseable line on stdout.
const PROGRESS_TEMPLATE: &str = "download:%(progress.status)s|%(progress.downloaded_bytes)s\
|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s\
|%(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s";

/// Production engine: spawns the yt-dlp binary and streams its progress.
#[derive(Debug, Clone, Default)]
pub struct YtDlpEngine {
    binary: Option<PathBuf>,
}

impl YtDlpEngine {
    /// Engine that locates `yt-dlp` on `PATH` at invocation time.
    #[must_use]
    pub const fn new() -> Self {
        Self { binary: None }
    }

    /// Engine that uses an explicit binary path.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(ref binary) = self.binary {
            return Ok(binary.clone());
        }
        which::which(DEFAULT_BINARY).map_err(|e| {
            Error::EngineNotFound(format!("{DEFAULT_BINARY} not found on PATH: {e}"))
        })
    }
}

/// Translate an invocation into yt-dlp command-line arguments.
fn build_args(invocation: &EngineInvocation) -> Vec<String> {
    let mut args = vec![
        "-f".to_string(),
        invocation.format_selector.clone(),
        "-o".to_string(),
        invocation.output_template.clone(),
        "--newline".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
    ];

    if let Some(ref container) = invocation.merge_output_format {
        args.push("--merge-output-format".to_string());
        args.push(container.clone());
    }

    match invocation.post_processing {
        PostProcessing::ExtractMp3 { bitrate_kbps } => {
            args.push("--extract-audio".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
            args.push("--audio-quality".to_string());
            args.push(format!("{bitrate_kbps}K"));
        }
        PostProcessing::RemuxMp4 => {
            args.push("--remux-video".to_string());
            args.push(VIDEO_CONTAINER.to_string());
        }
    }

    if let Some(ref location) = invocation.transcoder_location {
        args.push("--ffmpeg-location".to_string());
        args.push(location.display().to_string());
    }

    args.push(invocation.url.clone());
    args
}

/// Parse one stdout line into a progress event, if it is one.
///
/// Prefers the machine-readable template lines; falls back to the classic
/// `[download]  42.1% of 10.00MiB at 1.23MiB/s ETA 00:42` rendering for
/// engine builds that ignore `--progress-template`.
fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    if let Some(rest) = line.strip_prefix("download:") {
        return parse_template_fields(rest);
    }
    parse_classic_line(line)
}

fn parse_template_fields(rest: &str) -> Option<ProgressEvent> {
    let mut fields = rest.split('|');
    let status = fields.next()?;
    match status {
        "finished" => Some(ProgressEvent::Finished),
        "downloading" => {
            let downloaded_bytes = parse_byte_field(fields.next());
            let total_bytes = parse_byte_field(fields.next());
            let estimated_bytes = parse_byte_field(fields.next());
            let percent_str = known_field(fields.next());
            let speed = known_field(fields.next());
            let eta = known_field(fields.next());
            Some(ProgressEvent::Downloading {
                downloaded_bytes,
                total_bytes: total_bytes.or(estimated_bytes),
                percent_str,
                speed,
                eta,
            })
        }
        _ => None,
    }
}

/// Byte counters arrive as integers, floats (estimates), or `NA`.
fn parse_byte_field(field: Option<&str>) -> Option<u64> {
    let field = known_field(field)?;
    field.parse::<f64>().ok().map(|v| v as u64)
}

/// `NA` and empty fields mean the engine does not know the value.
fn known_field(field: Option<&str>) -> Option<String> {
    let field = field?.trim();
    if field.is_empty() || field == "NA" {
        None
    } else {
        Some(field.to_string())
    }
}

fn parse_classic_line(line: &str) -> Option<ProgressEvent> {
    let re = Regex::new(
        r"^\[download\]\s+(?P<percent>\d+(?:\.\d+)?%)\s+of\s+~?\s*\S+(?:\s+at\s+(?P<speed>\S+))?(?:\s+ETA\s+(?P<eta>\S+))?",
    )
    .ok()?;
    let caps = re.captures(line)?;
    Some(ProgressEvent::Downloading {
        downloaded_bytes: None,
        total_bytes: None,
        percent_str: caps.name("percent").map(|m| m.as_str().to_string()),
        speed: caps
            .name("speed")
            .map(|m| m.as_str().to_string())
            .filter(|s| s != "Unknown"),
        eta: caps
            .name("eta")
            .map(|m| m.as_str().to_string())
            .filter(|s| s != "Unknown"),
    })
}

/// Pick the most useful failure message out of the engine's stderr.
fn failure_message(stderr: &str, status: std::process::ExitStatus) -> String {
    let error_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()));

    match error_line {
        Some(line) => line.to_string(),
        None => format!("engine exited with {status}"),
    }
}

impl DownloadEngine for YtDlpEngine {
    fn run(&self, invocation: &EngineInvocation, sink: &mut dyn ProgressSink) -> Result<()> {
        let binary = self.resolve_binary()?;
        let args = build_args(invocation);

        info!("Invoking {} for {}", binary.display(), invocation.url);
        debug!("Engine arguments: {:?}", args);

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::download(
                    invocation.url.as_str(),
                    format!("failed to spawn {}: {e}", binary.display()),
                )
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::download(invocation.url.as_str(), "engine stdout was not captured")
        })?;

        // Drain stderr on its own thread so a chatty engine cannot deadlock
        // against our stdout reads.
        let mut stderr_reader = child.stderr.take().map(|stderr| {
            std::thread::spawn(move || {
                let mut buffer = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut buffer);
                buffer
            })
        });

        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Lost engine stdout for {}: {}", invocation.url, e);
                    break;
                }
            };

            let Some(event) = parse_progress_line(&line) else {
                continue;
            };

            if sink.on_event(event) == SinkControl::Abort {
                info!("Abort requested; stopping engine for {}", invocation.url);
                let _ = child.kill();
                let _ = child.wait();
                if let Some(reader) = stderr_reader.take() {
                    let _ = reader.join();
                }
                return Err(Error::Cancelled);
            }
        }

        let status = child.wait()?;
        let stderr = stderr_reader
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if status.success() {
            debug!("Engine finished for {}", invocation.url);
            Ok(())
        } else {
            Err(Error::download(
                invocation.url.as_str(),
                failure_message(&stderr, status),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Quality;

    fn video_request(quality: Quality) -> DownloadRequest {
        DownloadRequest::new("https://example.com/watch?v=abc").with_quality(quality)
    }

    #[test]
    fn test_video_selector_caps_height_at_480() {
        let invocation =
            EngineInvocation::for_request(&video_request(Quality::P480), Path::new("/dl"), None);
        assert_eq!(
            invocation.format_selector,
            "bestvideo[height<=480][ext=mp4][vcodec^=avc1]+bestaudio[ext=m4a]\
             /best[height<=480][ext=mp4]"
        );
        assert_eq!(invocation.merge_output_format.as_deref(), Some("mp4"));
        assert_eq!(invocation.post_processing, PostProcessing::RemuxMp4);
    }

    #[test]
    fn test_video_selector_for_every_capped_quality() {
        for (quality, height) in [
            (Quality::P144, 144),
            (Quality::P240, 240),
            (Quality::P360, 360),
            (Quality::P480, 480),
            (Quality::P720, 720),
            (Quality::P1080, 1080),
        ] {
            let invocation =
                EngineInvocation::for_request(&video_request(quality), Path::new("/dl"), None);
            assert!(
                invocation
                    .format_selector
                    .contains(&format!("height<={height}")),
                "selector for {quality} should cap at {height}"
            );
            assert!(invocation.format_selector.contains("vcodec^=avc1"));
        }
    }

    #[test]
    fn test_best_selector_has_no_height_cap() {
        let invocation =
            EngineInvocation::for_request(&video_request(Quality::Best), Path::new("/dl"), None);
        assert_eq!(
            invocation.format_selector,
            "bestvideo[ext=mp4][vcodec^=avc1]+bestaudio[ext=m4a]/best[ext=mp4]"
        );
    }

    #[test]
    fn test_audio_selector_ignores_quality() {
        for quality in [Quality::P144, Quality::P1080, Quality::Best] {
            let request = DownloadRequest::new("https://example.com/watch?v=abc")
                .with_format(FormatKind::Audio)
                .with_quality(quality);
            let invocation = EngineInvocation::for_request(&request, Path::new("/dl"), None);
            assert_eq!(invocation.format_selector, "bestaudio/best");
            assert_eq!(
                invocation.post_processing,
                PostProcessing::ExtractMp3 { bitrate_kbps: 192 }
            );
            assert!(invocation.merge_output_format.is_none());
        }
    }

    #[test]
    fn test_output_template_single_item() {
        let invocation =
            EngineInvocation::for_request(&video_request(Quality::P720), Path::new("/dl"), None);
        assert_eq!(invocation.output_template, "/dl/%(title)s.%(ext)s");
    }

    #[test]
    fn test_output_template_playlist() {
        let request = video_request(Quality::P720).as_playlist(true);
        let invocation = EngineInvocation::for_request(&request, Path::new("/dl"), None);
        assert_eq!(
            invocation.output_template,
            "/dl/%(playlist)s/%(playlist_index)s - %(title)s.%(ext)s"
        );
    }

    #[test]
    fn test_transcoder_location_is_carried_through() {
        let invocation = EngineInvocation::for_request(
            &video_request(Quality::P720),
            Path::new("/dl"),
            Some(Path::new("/opt/ffmpeg/bin")),
        );
        assert_eq!(
            invocation.transcoder_location.as_deref(),
            Some(Path::new("/opt/ffmpeg/bin"))
        );

        let args = build_args(&invocation);
        let position = args
            .iter()
            .position(|a| a == "--ffmpeg-location")
            .expect("ffmpeg location flag present");
        assert_eq!(args[position + 1], "/opt/ffmpeg/bin");
    }

    #[test]
    fn test_build_args_video() {
        let invocation =
            EngineInvocation::for_request(&video_request(Quality::P480), Path::new("/dl"), None);
        let args = build_args(&invocation);

        assert_eq!(args[0], "-f");
        assert_eq!(args[1], invocation.format_selector);
        assert!(args.contains(&"--newline".to_string()));
        assert!(args.contains(&"--merge-output-format".to_string()));
        assert!(args.contains(&"--remux-video".to_string()));
        assert!(!args.contains(&"--extract-audio".to_string()));
        assert_eq!(args.last().map(String::as_str), Some(invocation.url.as_str()));
    }

    #[test]
    fn test_build_args_audio() {
        let request =
            DownloadRequest::new("https://example.com/watch?v=abc").with_format(FormatKind::Audio);
        let invocation = EngineInvocation::for_request(&request, Path::new("/dl"), None);
        let args = build_args(&invocation);

        assert!(args.contains(&"--extract-audio".to_string()));
        let position = args
            .iter()
            .position(|a| a == "--audio-quality")
            .expect("audio quality flag present");
        assert_eq!(args[position + 1], "192K");
        assert!(!args.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn test_parse_template_line_with_byte_counters() {
        let event = parse_progress_line(
            "download:downloading|50|200|NA| 25.0%|1.23MiB/s|00:42",
        )
        .expect("line parses");
        assert_eq!(
            event,
            ProgressEvent::Downloading {
                downloaded_bytes: Some(50),
                total_bytes: Some(200),
                percent_str: Some("25.0%".to_string()),
                speed: Some("1.23MiB/s".to_string()),
                eta: Some("00:42".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_template_line_falls_back_to_estimate() {
        let event =
            parse_progress_line("download:downloading|1024|NA|2048.7|NA|NA|NA").expect("parses");
        let ProgressEvent::Downloading {
            downloaded_bytes,
            total_bytes,
            percent_str,
            speed,
            eta,
        } = event
        else {
            panic!("expected a downloading event");
        };
        assert_eq!(downloaded_bytes, Some(1024));
        assert_eq!(total_bytes, Some(2048));
        assert!(percent_str.is_none());
        assert!(speed.is_none());
        assert!(eta.is_none());
    }

    #[test]
    fn test_parse_template_line_finished() {
        let event = parse_progress_line("download:finished|200|200|NA|100%|NA|00:00");
        assert_eq!(event, Some(ProgressEvent::Finished));
    }

    #[test]
    fn test_parse_classic_line() {
        let event =
            parse_progress_line("[download]  42.1% of 10.00MiB at 1.23MiB/s ETA 00:42")
                .expect("line parses");
        let ProgressEvent::Downloading {
            percent_str,
            speed,
            eta,
            downloaded_bytes,
            ..
        } = event
        else {
            panic!("expected a downloading event");
        };
        assert_eq!(percent_str.as_deref(), Some("42.1%"));
        assert_eq!(speed.as_deref(), Some("1.23MiB/s"));
        assert_eq!(eta.as_deref(), Some("00:42"));
        assert!(downloaded_bytes.is_none());
    }

    #[test]
    fn test_non_progress_lines_are_ignored() {
        assert!(parse_progress_line("[youtube] abc: Downloading webpage").is_none());
        assert!(parse_progress_line("").is_none());
        assert!(parse_progress_line("download:error|NA|NA|NA|NA|NA|NA").is_none());
    }

    #[test]
    fn test_failure_message_prefers_error_lines() {
        let stderr = "WARNING: something minor\nERROR: Video unavailable\n";
        let message = failure_message(stderr, exit_status(1));
        assert_eq!(message, "ERROR: Video unavailable");
    }

    #[test]
    fn test_failure_message_falls_back_to_last_line() {
        let stderr = "something broke\n\n";
        let message = failure_message(stderr, exit_status(1));
        assert_eq!(message, "something broke");
    }

    #[test]
    fn test_failure_message_without_stderr() {
        let message = failure_message("", exit_status(2));
        assert!(message.contains("engine exited"));
    }

    #[cfg(unix)]
    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    #[cfg(not(unix))]
    fn exit_status(code: u32) -> std::process::ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code)
    }
}
