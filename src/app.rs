//! Wiring: one place that builds the store, storage, pipeline and queue
//! from a [`Config`].

use crate::analysis::{Analyzer, AnalysisPipeline, OpenAiAnalyzer, PipelineOptions};
use crate::config::Config;
use crate::gateway::{self, AppState};
use crate::metrics::Metrics;
use crate::scan::{DirectoryScanner, Retention, ScanProcessor, ScanQueue, ScanRecorder};
use crate::store::{ScanIndex, ScanStatus};
use crate::uploads::{Assembler, BlobStorage, ChunkStore};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default, Clone, Serialize)]
pub struct PendingReport {
    pub processed: usize,
    pub failed: usize,
}

pub struct App {
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub index: Arc<ScanIndex>,
    pub storage: Arc<BlobStorage>,
    pub chunks: Arc<ChunkStore>,
    pub recorder: Arc<ScanRecorder>,
    pub processor: Arc<ScanProcessor>,
    pub assembler: Arc<Assembler>,
}

impl App {
    /// Build with the configured OpenAI-compatible analyzer.
    pub fn build(config: Config) -> Result<Self> {
        let analyzer = Arc::new(OpenAiAnalyzer::new(&config.analyzer));
        Self::with_analyzer(config, analyzer)
    }

    pub fn with_analyzer(config: Config, analyzer: Arc<dyn Analyzer>) -> Result<Self> {
        let base_dir = config.base_dir();
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create {}", base_dir.display()))?;
        let metrics = Metrics::new().context("Failed to register metrics")?;
        let index = Arc::new(ScanIndex::open(&config.database_path())?);
        let storage = Arc::new(BlobStorage::from_path(base_dir));
        let chunks = Arc::new(ChunkStore::new(
            index.clone(),
            storage.clone(),
            Duration::from_secs(config.uploads.session_ttl_secs),
        ));
        let recorder = Arc::new(ScanRecorder::new(
            index.clone(),
            storage.clone(),
            metrics.clone(),
        ));
        let pipeline = Arc::new(AnalysisPipeline::new(
            analyzer,
            PipelineOptions::from_config(&config.analyzer, &config.analysis),
            metrics.clone(),
        ));
        let processor = Arc::new(ScanProcessor::new(recorder.clone(), pipeline));
        let assembler = Arc::new(Assembler::new(
            chunks.clone(),
            recorder.clone(),
            metrics.clone(),
        ));
        info!(
            storage = %storage.base_dir().display(),
            model = %config.analyzer.model,
            "Application wired"
        );
        Ok(Self {
            config: Arc::new(config),
            metrics,
            index,
            storage,
            chunks,
            recorder,
            processor,
            assembler,
        })
    }

    pub fn retention(&self) -> Retention {
        Retention::new(self.recorder.clone(), self.chunks.clone())
    }

    pub fn directory_scanner(&self) -> DirectoryScanner {
        DirectoryScanner::new(self.processor.clone())
    }

    pub fn start_queue(&self, cancel: CancellationToken) -> (ScanQueue, Vec<JoinHandle<()>>) {
        ScanQueue::start(self.processor.clone(), &self.config.queue, cancel)
    }

    /// Process up to `limit` `pending` scans in the foreground.
    pub async fn process_pending(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<PendingReport> {
        let mut report = PendingReport::default();
        for scan in self.index.scans_with_status(ScanStatus::Pending, limit)? {
            if cancel.is_cancelled() {
                break;
            }
            match self.processor.process(scan.id, cancel).await {
                Ok(outcome) => {
                    info!(scan_id = scan.id, ?outcome, "Pending scan processed");
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(scan_id = scan.id, "Pending scan failed: {e}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub fn gateway_state(&self, queue: ScanQueue) -> AppState {
        AppState {
            assembler: self.assembler.clone(),
            recorder: self.recorder.clone(),
            queue,
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        }
    }

    /// Run workers, the periodic session purge and the HTTP gateway until
    /// `shutdown` fires.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let (queue, workers) = self.start_queue(shutdown.clone());
        if let Err(e) = queue.redispatch_queued().await {
            warn!("Queued scans not re-dispatched: {e}");
        }
        if self.config.queue.auto_enqueue {
            if let Err(e) = queue.enqueue_pending(self.config.scan.pending_limit).await {
                warn!("Pending scans not queued: {e}");
            }
        }
        let purge = self.spawn_session_purge(shutdown.clone());

        let served = gateway::serve(self.gateway_state(queue), shutdown.clone()).await;
        shutdown.cancel();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Scan worker ended abnormally: {e}");
            }
        }
        if let Err(e) = purge.await {
            warn!("Session purge task ended abnormally: {e}");
        }
        info!("Shutdown complete");
        served
    }

    fn spawn_session_purge(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let retention = self.retention();
        let ttl = Duration::from_secs(self.config.uploads.session_ttl_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL.min(ttl.max(Duration::from_secs(1))));
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = retention.purge_sessions(ttl).await {
                    warn!("Session purge failed: {e:#}");
                }
            }
        })
    }
}
