//! Progress reporting.
//!
//! Processors receive a [`ProgressReporter`] and push percentages into it;
//! the worker holds the matching [`ProgressReceiver`] and forwards changes
//! to the job store. The underlying `watch` channel coalesces bursts, so a
//! slow store never backs up a fast encoder.

use std::sync::Arc;

use tokio::sync::watch;

/// Progress sink handed to a processor.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<u8>>,
}

/// Receiving end owned by the worker.
pub struct ProgressReceiver {
    rx: watch::Receiver<u8>,
}

impl ProgressReporter {
    /// Create a reporter starting at 0 and its receiver.
    pub fn channel() -> (Self, ProgressReceiver) {
        let (tx, rx) = watch::channel(0u8);
        (Self { tx: Arc::new(tx) }, ProgressReceiver { rx })
    }

    /// Reporter whose values go nowhere.
    pub fn noop() -> Self {
        Self::channel().0
    }

    /// Report a percentage. Values are clamped to 0..=100 and never move
    /// backwards.
    pub fn report(&self, percent: f64) {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0) as u8
        } else {
            0
        };
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }

    /// Last reported value.
    pub fn current(&self) -> u8 {
        *self.tx.borrow()
    }
}

impl ProgressReceiver {
    /// Wait for the next change. Returns `None` once every reporter is gone.
    pub async fn changed(&mut self) -> Option<u8> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn current(&self) -> u8 {
        *self.rx.borrow()
    }
}

/// Progress information from FFmpeg.
#[derive(Debug, Clone, Default)]
pub struct FfmpegProgress {
    /// Current frame number
    pub frame: u64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed (e.g., 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Calculate progress percentage given total duration in milliseconds.
    pub fn percentage(&self, total_duration_ms: i64) -> f64 {
        if self.is_complete {
            return 100.0;
        }
        if total_duration_ms <= 0 {
            return 0.0;
        }
        ((self.out_time_ms as f64 / total_duration_ms as f64) * 100.0).clamp(0.0, 100.0)
    }
}

/// Parse a line of FFmpeg's `-progress` output. A snapshot is emitted at
/// each `progress=` line, which closes a block.
pub(crate) fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> Option<FfmpegProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_ms" | "out_time_us" => {
            // Both keys carry microseconds despite the name
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "frame" => {
            if let Ok(frame) = value.parse() {
                current.frame = frame;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            if value == "end" {
                current.is_complete = true;
            }
            return Some(current.clone());
        }
        _ => {}
    }
    None
}

/// Whether a stderr line belongs to the `-progress` key/value stream.
pub(crate) fn is_progress_line(line: &str) -> bool {
    const KEYS: &[&str] = &[
        "frame", "fps", "stream_", "bitrate", "total_size", "out_time", "dup_frames",
        "drop_frames", "speed", "progress",
    ];
    match line.trim().split_once('=') {
        Some((key, _)) => KEYS.iter().any(|k| key.starts_with(k)),
        None => false,
    }
}
