use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use image::{Rgb, RgbImage};
use tokio::runtime::Handle;

use helmet_watch::config::{ThrottleConfig, ThrottleStrategy};
use helmet_watch::dispatcher::{DispatchContext, Dispatcher, PendingAlert};
use helmet_watch::error::DispatchError;
use helmet_watch::evidence::EvidenceStore;
use helmet_watch::frame::{Fingerprint, Frame};
use helmet_watch::ledger::{CsvLedger, Ledger};
use helmet_watch::location::LocationResolver;
use helmet_watch::notify::{AlertMessage, Notifier};
use helmet_watch::throttle::AlertThrottle;

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

/// Slow SMTP server that finally refuses.
struct Refusing;

#[async_trait]
impl Notifier for Refusing {
    fn name(&self) -> &str {
        "refusing"
    }

    async fn send(&self, _message: &AlertMessage) -> Result<(), DispatchError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Err(DispatchError::Rejected {
            channel: "refusing".into(),
            reason: "535 authentication failed".into(),
        })
    }
}

fn pending(source: &str, shade: u8) -> PendingAlert {
    let frame = Frame::new(RgbImage::from_pixel(32, 24, Rgb([255, shade, 0])));
    PendingAlert {
        source_id: source.into(),
        fingerprint: frame.fingerprint(),
        frame,
        detected_at: Utc::now(),
        location: Some("North gate".into()),
    }
}

fn dispatcher_with(
    evidence: EvidenceStore,
    ledger_path: &std::path::Path,
    notifier: Arc<dyn Notifier>,
) -> (Dispatcher, Ledger) {
    let ledger = Ledger::new(Box::new(CsvLedger::open(ledger_path).unwrap()), "test");
    let ctx = DispatchContext {
        evidence: Arc::new(evidence),
        notifiers: vec![notifier],
        ledger: ledger.clone(),
        location: LocationResolver::fixed_fallback("Unknown Location"),
        subject: "No Helmet Detected!".into(),
    };
    (Dispatcher::new(ctx, Handle::current()), ledger)
}

fn fp(n: u8) -> Fingerprint {
    Fingerprint::from_bytes([n; 32])
}

#[test]
fn test_cooldown_scenario_0_5_35() {
    let cfg = ThrottleConfig {
        strategy: ThrottleStrategy::Cooldown,
        cooldown_seconds: 30,
        ..ThrottleConfig::default()
    };
    let mut throttle = AlertThrottle::new("cam0", &cfg, None);
    let t0 = Instant::now();

    assert!(throttle.admit_at(fp(1), t0));
    assert!(!throttle.admit_at(fp(2), t0 + Duration::from_secs(5)));
    assert!(throttle.admit_at(fp(3), t0 + Duration::from_secs(35)));
    assert_eq!((throttle.admitted(), throttle.rejected()), (2, 1));
}

#[test]
fn test_identical_frame_never_alerts_twice() {
    let cfg = ThrottleConfig {
        strategy: ThrottleStrategy::Both,
        cooldown_seconds: 30,
        ..ThrottleConfig::default()
    };
    let mut throttle = AlertThrottle::new("cam0", &cfg, None);
    let t0 = Instant::now();

    assert!(throttle.admit_at(fp(7), t0));
    // cooldown over, same content
    assert!(!throttle.admit_at(fp(7), t0 + Duration::from_secs(120)));
    assert!(throttle.admit_at(fp(8), t0 + Duration::from_secs(121)));
}

#[tokio::test]
async fn test_evidence_failure_suppresses_email_and_ledger() {
    let dir = tempfile::TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file in the way").unwrap();

    let sink = Arc::new(Recorder::default());
    let (d, ledger) = dispatcher_with(
        EvidenceStore::with_dir(blocker.join("alerts"), 90),
        &dir.path().join("log.csv"),
        sink.clone(),
    );

    d.raise(pending("cam0", 1));
    assert!(d.shutdown(Duration::from_secs(5)).await);

    assert!(sink.sent.lock().unwrap().is_empty());
    assert!(ledger.recent(10).unwrap().is_empty());
    let stats = d.stats();
    assert_eq!((stats.raised, stats.evidence_failures), (1, 1));
    assert_eq!((stats.delivered, stats.ledger_rows), (0, 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_notification_still_logs_and_raise_returns_immediately() {
    let dir = tempfile::TempDir::new().unwrap();
    let (d, ledger) = dispatcher_with(
        EvidenceStore::with_dir(dir.path().join("alerts"), 90),
        &dir.path().join("log.csv"),
        Arc::new(Refusing),
    );

    let start = Instant::now();
    for shade in 0..3 {
        d.raise(pending("cam0", shade));
    }
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(100), "raise blocked for {:?}", elapsed);

    assert!(d.shutdown(Duration::from_secs(10)).await);
    assert_eq!(d.in_flight(), 0);

    let rows = ledger.recent(10).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.location == "North gate" && r.source_id == "cam0"));
    for r in &rows {
        assert!(std::path::Path::new(&r.evidence_ref).exists(), "missing {}", r.evidence_ref);
    }

    let stats = d.stats();
    assert_eq!(stats.notify_failures, 3);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.ledger_rows, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_email_body_and_attachment_match_ledger_row() {
    let dir = tempfile::TempDir::new().unwrap();
    let sink = Arc::new(Recorder::default());
    let (d, ledger) = dispatcher_with(
        EvidenceStore::with_dir(dir.path().join("alerts"), 90),
        &dir.path().join("log.csv"),
        sink.clone(),
    );

    d.raise(pending("gate-2", 9));
    assert!(d.shutdown(Duration::from_secs(5)).await);

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "No Helmet Detected!");
    assert!(sent[0].body.starts_with("No helmet detected!\nTime: "));
    assert!(sent[0].body.contains("Location: North gate"));

    let attachment = sent[0].attachment.as_ref().unwrap();
    assert_eq!(attachment.content_type, "image/jpeg");
    // JPEG SOI marker
    assert_eq!(&attachment.bytes[..2], &[0xFF, 0xD8]);

    let row = &ledger.recent(1).unwrap()[0];
    assert!(row.evidence_ref.ends_with(&attachment.filename));
    assert!(attachment.filename.starts_with("gate-2_nohelmet_"));
}
