//! Alert dispatch.
//!
//! The runner hands an admitted detection to [`Dispatcher::raise`] and goes
//! straight back to reading frames. Everything after that runs in a tracked
//! background task:
//!
//! ```text
//! capture evidence ──fail──▶ log, stop (no email, no ledger row)
//!        │
//!   resolve location
//!        │
//!   ┌────┴─────────────┐
//!   notifiers        ledger append      (independent, no retry)
//! ```
//!
//! Tasks share nothing mutable except the ledger handle, which serializes
//! its own appends. `shutdown` waits for in-flight tasks with a bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{DispatchError, EvidenceError};
use crate::evidence::{EvidenceRef, EvidenceStore};
use crate::frame::{Fingerprint, Frame};
use crate::ledger::{Ledger, LedgerRecord};
use crate::location::LocationResolver;
use crate::notify::{AlertMessage, Attachment, EmailNotifier, LogNotifier, Notifier};

/// An admitted detection whose evidence is not yet written.
#[derive(Debug)]
pub struct PendingAlert {
    pub source_id: String,
    pub frame: Frame,
    pub fingerprint: Fingerprint,
    pub detected_at: DateTime<Utc>,
    /// Configured location of the source, if any.
    pub location: Option<String>,
}

/// A raised alert. Immutable once built.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub evidence_ref: EvidenceRef,
    pub frame_fingerprint: Fingerprint,
}

impl AlertEvent {
    pub fn compose(&self, subject: &str) -> (String, String) {
        let local = self.timestamp.with_timezone(&Local);
        let body = format!(
            "No helmet detected!\nTime: {}\nLocation: {}\nCamera: {}",
            local.format("%Y-%m-%d %H:%M:%S"),
            self.location,
            self.source_id
        );
        (subject.to_string(), body)
    }

    pub fn ledger_record(&self) -> LedgerRecord {
        LedgerRecord::new(
            self.timestamp,
            self.location.clone(),
            self.source_id.clone(),
            self.evidence_ref.to_string(),
        )
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    raised: AtomicU64,
    evidence_failures: AtomicU64,
    delivered: AtomicU64,
    notify_failures: AtomicU64,
    ledger_rows: AtomicU64,
    ledger_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub raised: u64,
    pub evidence_failures: u64,
    pub delivered: u64,
    pub notify_failures: u64,
    pub ledger_rows: u64,
    pub ledger_failures: u64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            raised: self.raised.load(Ordering::Relaxed),
            evidence_failures: self.evidence_failures.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            notify_failures: self.notify_failures.load(Ordering::Relaxed),
            ledger_rows: self.ledger_rows.load(Ordering::Relaxed),
            ledger_failures: self.ledger_failures.load(Ordering::Relaxed),
        }
    }
}

/// Everything a dispatch task needs.
pub struct DispatchContext {
    pub evidence: Arc<EvidenceStore>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
    pub ledger: Ledger,
    pub location: LocationResolver,
    pub subject: String,
}

impl DispatchContext {
    pub fn from_config(cfg: &AppConfig, ledger: Ledger) -> Self {
        let notifiers: Vec<Arc<dyn Notifier>> = if cfg.email.enabled {
            vec![Arc::new(EmailNotifier::new(cfg.email.clone()))]
        } else {
            vec![Arc::new(LogNotifier)]
        };
        Self {
            evidence: Arc::new(EvidenceStore::new(&cfg.evidence)),
            notifiers,
            ledger,
            location: LocationResolver::new(&cfg.location),
            subject: cfg.email.subject.clone(),
        }
    }
}

struct Inner {
    ctx: DispatchContext,
    stats: DispatchStats,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    tracker: TaskTracker,
    runtime: Handle,
}

impl Dispatcher {
    /// `runtime` is where tasks run; `raise` may be called from any thread.
    pub fn new(ctx: DispatchContext, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                stats: DispatchStats::default(),
            }),
            tracker: TaskTracker::new(),
            runtime,
        }
    }

    /// Capture evidence, then deliver. Returns immediately.
    pub fn raise(&self, pending: PendingAlert) {
        DispatchStats::bump(&self.inner.stats.raised);
        let inner = Arc::clone(&self.inner);
        self.tracker.spawn_on(async move { inner.process(pending).await }, &self.runtime);
    }

    /// Deliver an already captured alert. Returns immediately.
    pub fn dispatch(&self, event: AlertEvent) {
        let inner = Arc::clone(&self.inner);
        self.tracker.spawn_on(async move { inner.deliver(event).await }, &self.runtime);
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop accepting work and wait up to `grace` for in-flight tasks.
    /// Returns false if tasks were still running at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight alerts");
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(remaining = self.tracker.len(), "Shutdown grace expired with alerts in flight");
                false
            }
        }
    }
}

impl Inner {
    async fn process(&self, pending: PendingAlert) {
        let PendingAlert {
            source_id,
            frame,
            fingerprint,
            detected_at,
            location,
        } = pending;

        let evidence_ref = match self.capture(frame, &source_id, detected_at).await {
            Ok(r) => r,
            Err(e) => {
                DispatchStats::bump(&self.stats.evidence_failures);
                warn!(source = %source_id, "Alert dropped, evidence not written: {}", e);
                return;
            }
        };

        let location = self.ctx.location.resolve(location.as_deref()).await;
        let event = AlertEvent {
            source_id,
            timestamp: detected_at,
            location,
            evidence_ref,
            frame_fingerprint: fingerprint,
        };
        self.deliver(event).await;
    }

    async fn capture(
        &self,
        frame: Frame,
        source_id: &str,
        at: DateTime<Utc>,
    ) -> Result<EvidenceRef, EvidenceError> {
        let store = Arc::clone(&self.ctx.evidence);
        let source = source_id.to_string();
        tokio::task::spawn_blocking(move || store.capture(&frame, &source, at))
            .await
            .map_err(|e| EvidenceError::Join(e.to_string()))?
    }

    async fn deliver(&self, event: AlertEvent) {
        info!(
            source = %event.source_id,
            location = %event.location,
            evidence = %event.evidence_ref,
            fingerprint = %event.frame_fingerprint.short(),
            "ALERT: no helmet detected"
        );

        let record = event.ledger_record();
        let (notified, logged) = tokio::join!(self.notify_all(&event), self.ctx.ledger.append(record));

        if notified {
            DispatchStats::bump(&self.stats.delivered);
        }
        match logged {
            Ok(()) => DispatchStats::bump(&self.stats.ledger_rows),
            Err(e) => {
                DispatchStats::bump(&self.stats.ledger_failures);
                warn!(source = %event.source_id, "Ledger append failed (notification unaffected): {}", e);
            }
        }
    }

    /// True when every sink accepted the message.
    async fn notify_all(&self, event: &AlertEvent) -> bool {
        let message = match self.compose(event).await {
            Ok(m) => m,
            Err(e) => {
                DispatchStats::bump(&self.stats.notify_failures);
                warn!(source = %event.source_id, "Alert raised but undelivered: {}", e);
                return false;
            }
        };

        let mut all_ok = true;
        for sink in &self.ctx.notifiers {
            if let Err(e) = sink.send(&message).await {
                all_ok = false;
                DispatchStats::bump(&self.stats.notify_failures);
                warn!(
                    source = %event.source_id,
                    channel = sink.name(),
                    "Alert raised but undelivered: {}",
                    e
                );
            }
        }
        all_ok
    }

    async fn compose(&self, event: &AlertEvent) -> Result<AlertMessage, DispatchError> {
        let path = event.evidence_ref.path();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| DispatchError::Attachment {
                path: path.to_path_buf(),
                source,
            })?;
        let (subject, body) = event.compose(&self.ctx.subject);

        Ok(AlertMessage {
            subject,
            body,
            source_id: event.source_id.clone(),
            attachment: Some(Attachment {
                filename: event.evidence_ref.file_name(),
                content_type: "image/jpeg".to_string(),
                bytes,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use image::{Rgb, RgbImage};

    use crate::ledger::CsvLedger;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<AlertMessage>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send(&self, message: &AlertMessage) -> Result<(), DispatchError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn pending(source: &str) -> PendingAlert {
        let frame = Frame::new(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])));
        PendingAlert {
            source_id: source.into(),
            fingerprint: frame.fingerprint(),
            frame,
            detected_at: Utc::now(),
            location: Some("Site A".into()),
        }
    }

    fn dispatcher(dir: &std::path::Path, sink: Arc<dyn Notifier>) -> (Dispatcher, Ledger) {
        let ledger = Ledger::new(
            Box::new(CsvLedger::open(dir.join("log.csv")).unwrap()),
            "test ledger",
        );
        let ctx = DispatchContext {
            evidence: Arc::new(EvidenceStore::with_dir(dir.join("alerts"), 80)),
            notifiers: vec![sink],
            ledger: ledger.clone(),
            location: LocationResolver::fixed_fallback("Unknown Location"),
            subject: "No Helmet Detected!".into(),
        };
        (Dispatcher::new(ctx, Handle::current()), ledger)
    }

    #[tokio::test]
    async fn raise_captures_notifies_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(Recorder::default());
        let (d, ledger) = dispatcher(dir.path(), sink.clone());

        d.raise(pending("cam0"));
        assert!(d.shutdown(Duration::from_secs(5)).await);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("Location: Site A"));
        assert!(sent[0].body.contains("Camera: cam0"));
        let att = sent[0].attachment.as_ref().unwrap();
        assert!(att.filename.starts_with("cam0_nohelmet_"));
        assert!(!att.bytes.is_empty());

        let rows = ledger.recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].location, "Site A");
        assert!(rows[0].evidence_ref.ends_with(&att.filename));

        let stats = d.stats();
        assert_eq!((stats.raised, stats.delivered, stats.ledger_rows), (1, 1, 1));
    }

    #[tokio::test]
    async fn configured_location_missing_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(Recorder::default());
        let (d, ledger) = dispatcher(dir.path(), sink);

        let mut p = pending("cam1");
        p.location = None;
        d.raise(p);
        assert!(d.shutdown(Duration::from_secs(5)).await);
        assert_eq!(ledger.recent(1).unwrap()[0].location, "Unknown Location");
    }

    #[tokio::test]
    async fn dispatch_of_event_without_evidence_file_still_logs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(Recorder::default());
        let (d, ledger) = dispatcher(dir.path(), sink.clone());

        let store = EvidenceStore::with_dir(dir.path().join("alerts"), 80);
        let p = pending("cam2");
        let evidence_ref = store.capture(&p.frame, "cam2", p.detected_at).unwrap();
        std::fs::remove_file(evidence_ref.path()).unwrap();

        d.dispatch(AlertEvent {
            source_id: "cam2".into(),
            timestamp: p.detected_at,
            location: "Gate".into(),
            evidence_ref,
            frame_fingerprint: p.fingerprint,
        });
        assert!(d.shutdown(Duration::from_secs(5)).await);

        assert!(sink.sent.lock().unwrap().is_empty());
        assert_eq!(ledger.recent(10).unwrap().len(), 1);
        assert_eq!(d.stats().notify_failures, 1);
    }
}
