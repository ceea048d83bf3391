use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Process metrics in a private registry, rendered at `GET /metrics`.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub uploads_received: IntCounterVec,
    pub chunks_received: IntCounter,
    pub uploads_finalized: IntCounter,
    pub analyzer_calls: IntCounterVec,
    pub scans_finished: IntCounterVec,
    pub issues_recorded: IntCounter,
    pub analysis_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let uploads_received = IntCounterVec::new(
            Opts::new("wpaudit_uploads_received_total", "Uploads started, by mode"),
            &["mode"],
        )?;
        let chunks_received =
            IntCounter::with_opts(Opts::new("wpaudit_chunks_received_total", "Upload chunks stored"))?;
        let uploads_finalized = IntCounter::with_opts(Opts::new(
            "wpaudit_uploads_finalized_total",
            "Chunked uploads assembled into a stored file",
        ))?;
        let analyzer_calls = IntCounterVec::new(
            Opts::new("wpaudit_analyzer_calls_total", "Analyzer chunk calls, by outcome"),
            &["outcome"],
        )?;
        let scans_finished = IntCounterVec::new(
            Opts::new("wpaudit_scans_finished_total", "Scans reaching a terminal status"),
            &["status"],
        )?;
        let issues_recorded = IntCounter::with_opts(Opts::new(
            "wpaudit_issues_recorded_total",
            "Validated issues persisted in suggestions",
        ))?;
        let analysis_seconds = Histogram::with_opts(
            HistogramOpts::new("wpaudit_analysis_seconds", "Wall time of one file analysis")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;

        registry.register(Box::new(uploads_received.clone()))?;
        registry.register(Box::new(chunks_received.clone()))?;
        registry.register(Box::new(uploads_finalized.clone()))?;
        registry.register(Box::new(analyzer_calls.clone()))?;
        registry.register(Box::new(scans_finished.clone()))?;
        registry.register(Box::new(issues_recorded.clone()))?;
        registry.register(Box::new(analysis_seconds.clone()))?;

        Ok(Self {
            registry,
            uploads_received,
            chunks_received,
            uploads_finalized,
            analyzer_calls,
            scans_finished,
            issues_recorded,
            analysis_seconds,
        })
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
