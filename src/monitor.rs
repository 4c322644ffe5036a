//! Process orchestration: one blocking runner per source, one shared
//! dispatcher, one ledger. Ctrl-C (or any supplied stop future) broadcasts
//! stop; in-flight alerts then get a bounded grace period.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{AppConfig, DetectorConfig, SourceConfig};
use crate::detector::{build_detector, Detector};
use crate::dispatcher::{DispatchContext, Dispatcher, StatsSnapshot};
use crate::error::SourceError;
use crate::ledger::Ledger;
use crate::runner::{RunReport, SourceRunner};
use crate::source::{open_source, FrameSource};
use crate::throttle::{shared_fingerprints, AlertThrottle};

pub type DetectorFactory = Arc<dyn Fn(&DetectorConfig) -> Result<Box<dyn Detector>> + Send + Sync>;
pub type SourceOpener =
    Arc<dyn Fn(&SourceConfig) -> std::result::Result<Box<dyn FrameSource>, SourceError> + Send + Sync>;

#[derive(Debug)]
pub struct MonitorSummary {
    pub reports: Vec<RunReport>,
    pub stats: StatsSnapshot,
    /// False when the shutdown grace expired with alerts still in flight.
    pub drained: bool,
}

impl MonitorSummary {
    pub fn all_failed(&self) -> bool {
        !self.reports.is_empty() && self.reports.iter().all(|r| r.error.is_some() && r.frames == 0)
    }
}

pub struct Monitor {
    cfg: Arc<AppConfig>,
    detector_factory: DetectorFactory,
    source_opener: SourceOpener,
    ledger: Option<Ledger>,
}

impl Monitor {
    pub fn new(cfg: Arc<AppConfig>) -> Self {
        Self {
            cfg,
            detector_factory: Arc::new(build_detector),
            source_opener: Arc::new(open_source),
            ledger: None,
        }
    }

    pub fn with_detector_factory(mut self, factory: DetectorFactory) -> Self {
        self.detector_factory = factory;
        self
    }

    pub fn with_source_opener(mut self, opener: SourceOpener) -> Self {
        self.source_opener = opener;
        self
    }

    /// Use this ledger instead of opening the configured one.
    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Run until Ctrl-C or until every source has stopped.
    pub async fn run(self) -> Result<MonitorSummary> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Ctrl-C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Ctrl-C received, stopping sources");
        })
        .await
    }

    pub async fn run_until<F>(self, stop: F) -> Result<MonitorSummary>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cfg = self.cfg;
        let ledger = match self.ledger {
            Some(l) => l,
            None => Ledger::open(&cfg.ledger)?,
        };
        info!(ledger = %ledger.describe(), sources = cfg.sources.len(), "Monitor starting");

        let dispatcher = Dispatcher::new(DispatchContext::from_config(&cfg, ledger), Handle::current());
        let shared = shared_fingerprints(&cfg.throttle);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(cfg.sources.len());
        for source in &cfg.sources {
            let source = source.clone();
            let throttle = AlertThrottle::new(&source.id, &cfg.throttle, shared.clone());
            let dispatcher = dispatcher.clone();
            let stop_rx = stop_rx.clone();
            let factory = Arc::clone(&self.detector_factory);
            let opener = Arc::clone(&self.source_opener);
            let cfg = Arc::clone(&cfg);
            let id = source.id.clone();

            let handle = tokio::task::spawn_blocking(move || {
                let detector = match factory(&cfg.detector) {
                    Ok(d) => d,
                    Err(e) => {
                        error!(source = %source.id, "Detector unavailable: {:#}", e);
                        let err = SourceError::Detector {
                            source_id: source.id.clone(),
                            reason: format!("{:#}", e),
                        };
                        return RunReport::failed(&source.id, err);
                    }
                };
                let opened = opener(&source);
                SourceRunner::new(source, &cfg, detector, throttle, dispatcher, stop_rx).run_on(opened)
            });
            handles.push((id, handle));
        }
        drop(stop_rx);

        let stopper = tokio::spawn(async move {
            stop.await;
            let _ = stop_tx.send(true);
        });

        let mut reports = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(source = %id, "Runner task failed: {}", e);
                    let err = SourceError::unavailable(id.clone(), e);
                    reports.push(RunReport::failed(&id, err));
                }
            }
        }
        stopper.abort();

        let grace = Duration::from_secs(cfg.runner.shutdown_grace_seconds);
        let drained = dispatcher.shutdown(grace).await;
        let stats = dispatcher.stats();

        for r in &reports {
            match &r.error {
                Some(_) => warn!("{}", r),
                None => info!("{}", r),
            }
        }
        info!(
            raised = stats.raised,
            delivered = stats.delivered,
            ledger_rows = stats.ledger_rows,
            notify_failures = stats.notify_failures,
            ledger_failures = stats.ledger_failures,
            evidence_failures = stats.evidence_failures,
            "Monitor stopped"
        );

        Ok(MonitorSummary { reports, stats, drained })
    }
}
