//! Source Runner: one blocking loop per camera.
//!
//!   Init ──open ok──▶ Streaming ──read error──▶ FrameLost ──reopen──▶ Streaming
//!     │                   │                         │
//!     └──open failed──────┴──end / stop ──▶ Stopped ◀┘ losses > reconnect_attempts
//!
//! Frame read, inference and the throttle decision run on this thread;
//! evidence, email and ledger work is handed to the dispatcher so the loop
//! never waits on disk or network.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, SourceConfig};
use crate::detector::Detector;
use crate::dispatcher::{Dispatcher, PendingAlert};
use crate::error::SourceError;
use crate::frame::{Detection, Frame, LazyFingerprint};
use crate::source::FrameSource;
use crate::throttle::AlertThrottle;

const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    Streaming,
    FrameLost,
    Stopped,
}

/// Receives every processed frame with its detections. Drawing and display
/// live outside this crate; the default does nothing.
pub trait Visualizer: Send {
    fn show(&mut self, source_id: &str, frame: &Frame, detections: &[Detection]);
}

pub struct Passthrough;

impl Visualizer for Passthrough {
    fn show(&mut self, _source_id: &str, _frame: &Frame, _detections: &[Detection]) {}
}

#[derive(Debug)]
pub struct RunReport {
    pub source_id: String,
    pub final_state: RunnerState,
    pub frames: u64,
    pub detections: u64,
    pub alerts: u64,
    pub suppressed: u64,
    pub error: Option<SourceError>,
}

impl RunReport {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            final_state: RunnerState::Init,
            frames: 0,
            detections: 0,
            alerts: 0,
            suppressed: 0,
            error: None,
        }
    }

    /// A runner that never streamed.
    pub fn failed(source_id: &str, error: SourceError) -> Self {
        Self {
            final_state: RunnerState::Stopped,
            error: Some(error),
            ..Self::new(source_id)
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} frames, {} detections, {} alerts, {} suppressed",
            self.source_id, self.frames, self.detections, self.alerts, self.suppressed
        )?;
        if let Some(e) = &self.error {
            write!(f, " (stopped: {})", e)?;
        }
        Ok(())
    }
}

pub struct SourceRunner {
    source: SourceConfig,
    alert_label: String,
    min_confidence: f32,
    process_every: u32,
    reconnect_attempts: u32,
    reconnect_backoff: Duration,
    detector: Box<dyn Detector>,
    throttle: AlertThrottle,
    dispatcher: Dispatcher,
    visualizer: Box<dyn Visualizer>,
    stop: watch::Receiver<bool>,
    state: RunnerState,
}

impl SourceRunner {
    pub fn new(
        source: SourceConfig,
        cfg: &AppConfig,
        detector: Box<dyn Detector>,
        throttle: AlertThrottle,
        dispatcher: Dispatcher,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            alert_label: cfg.detector.alert_label.clone(),
            min_confidence: cfg.detector.confidence_threshold,
            process_every: cfg.runner.process_every_n_frames.max(1),
            reconnect_attempts: cfg.runner.reconnect_attempts,
            reconnect_backoff: RECONNECT_BACKOFF,
            detector,
            throttle,
            dispatcher,
            visualizer: Box::new(Passthrough),
            stop,
            state: RunnerState::Init,
        }
    }

    pub fn with_visualizer(mut self, visualizer: Box<dyn Visualizer>) -> Self {
        self.visualizer = visualizer;
        self
    }

    /// Base delay before the n-th consecutive reconnect (n × base).
    pub fn with_reconnect_backoff(mut self, base: Duration) -> Self {
        self.reconnect_backoff = base;
        self
    }

    /// Stream from an opened (or failed to open) source until stop, end of
    /// stream, or persistent loss. Blocking.
    ///
    /// A lost read triggers one reopen. Losses are counted until the next
    /// good frame; once more than `reconnect_attempts` pile up the runner
    /// stops with the last error.
    pub fn run_on(mut self, opened: Result<Box<dyn FrameSource>, SourceError>) -> RunReport {
        let mut report = RunReport::new(&self.source.id);

        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                error!(source = %self.source.id, "Source could not be opened: {}", e);
                self.state = RunnerState::Stopped;
                report.final_state = self.state;
                report.error = Some(e);
                return report;
            }
        };
        self.state = RunnerState::Streaming;
        info!(source = %self.source.id, "Runner streaming");

        let mut frame_idx: u64 = 0;
        let mut losses: u32 = 0;
        loop {
            if self.stop_requested() {
                info!(source = %self.source.id, "Stop requested");
                break;
            }

            let frame = match stream.read() {
                Ok(Some(f)) => f,
                Ok(None) => {
                    info!(source = %self.source.id, "End of stream");
                    break;
                }
                Err(e) => {
                    self.state = RunnerState::FrameLost;
                    losses += 1;
                    warn!(source = %self.source.id, losses, "Frame read failed: {}", e);
                    if losses > self.reconnect_attempts {
                        error!(source = %self.source.id, "Giving up after {} lost reads", losses);
                        report.error = Some(e);
                        break;
                    }
                    if !self.pause(self.reconnect_backoff * losses) {
                        break;
                    }
                    match stream.reconnect() {
                        Ok(()) => info!(source = %self.source.id, attempt = losses, "Reconnected"),
                        Err(e) => debug!(source = %self.source.id, attempt = losses, "Reconnect failed: {}", e),
                    }
                    continue;
                }
            };
            if losses > 0 {
                losses = 0;
                self.state = RunnerState::Streaming;
            }

            frame_idx += 1;
            if frame_idx % self.process_every as u64 != 0 {
                continue;
            }
            self.process(frame, &mut report);
        }

        // releases the capture device
        drop(stream);
        self.state = RunnerState::Stopped;
        report.final_state = self.state;
        info!(source = %self.source.id, "Runner stopped. {}", report);
        report
    }

    fn process(&mut self, frame: Frame, report: &mut RunReport) {
        report.frames += 1;

        let detections = match self.detector.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                warn!(source = %self.source.id, "Detector error: {}", e);
                return;
            }
        };
        report.detections += detections.len() as u64;
        self.visualizer.show(&self.source.id, &frame, &detections);

        let candidates: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.is_alert(&self.alert_label, self.min_confidence))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let mut fingerprint = LazyFingerprint::new(&frame);
        // one alert per frame at most; every other candidate is suppressed
        let hit = candidates
            .iter()
            .find(|d| self.throttle.admit(d, &mut fingerprint))
            .map(|d| d.confidence);
        let Some(confidence) = hit else {
            report.suppressed += candidates.len() as u64;
            return;
        };
        report.suppressed += candidates.len() as u64 - 1;
        report.alerts += 1;
        let fingerprint = fingerprint.get();

        info!(source = %self.source.id, confidence, "No helmet detected, raising alert");
        self.dispatcher.raise(PendingAlert {
            source_id: self.source.id.clone(),
            fingerprint,
            detected_at: frame.captured_at,
            location: self.source.location.clone(),
            frame,
        });
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep up to `total`, waking early on stop. False when stopped.
    fn pause(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while !self.stop_requested() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            std::thread::sleep(left.min(STOP_POLL));
        }
        false
    }
}
