//! Per-file analysis: chunk, call the analyzer with bounded concurrency,
//! validate and remap issues, then summarize.

use super::analyzer::{Analyzer, AnalyzerError, CompletionRequest};
use super::chunker::{chunk_by_lines, chunk_by_tokens, CodeChunk};
use super::issues::{extract_issues, Issue};
use super::prompt::{chunk_prompt, CHUNK_SYSTEM_PROMPT};
use super::retry::RetryPolicy;
use super::summary::{summarize, Documentation, SummaryOptions};
use crate::config::{AnalysisConfig, AnalyzerConfig, ChunkPolicy};
use crate::metrics::Metrics;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("analysis of {file} aborted at lines {start}-{end}: {source}")]
    Aborted {
        file: String,
        start: usize,
        end: usize,
        #[source]
        source: AnalyzerError,
    },
    #[error("analysis of {0} cancelled")]
    Cancelled(String),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_policy: ChunkPolicy,
    pub lines_per_chunk: usize,
    pub max_tokens_per_chunk: usize,
    pub max_concurrent_chunks: usize,
    pub skip_summary: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    pub chunk_timeout: Duration,
    pub summary_max_tokens: u32,
    pub summary_timeout: Duration,
    pub retry: RetryPolicy,
}

impl PipelineOptions {
    pub fn from_config(analyzer: &AnalyzerConfig, analysis: &AnalysisConfig) -> Self {
        Self {
            chunk_policy: analysis.chunk_policy,
            lines_per_chunk: analysis.lines_per_chunk,
            max_tokens_per_chunk: analysis.max_tokens_per_chunk,
            max_concurrent_chunks: analysis.max_concurrent_chunks.max(1),
            skip_summary: analysis.skip_summary,
            temperature: analyzer.temperature,
            max_tokens: analyzer.max_tokens,
            chunk_timeout: Duration::from_secs(analyzer.chunk_timeout_secs),
            summary_max_tokens: analyzer.summary_max_tokens,
            summary_timeout: Duration::from_secs(analyzer.summary_timeout_secs),
            retry: RetryPolicy {
                max_attempts: analyzer.max_attempts,
                base_delay: Duration::from_millis(analyzer.retry_base_delay_ms),
            },
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&AnalyzerConfig::default(), &AnalysisConfig::default())
    }
}

/// Consolidated result for one file.
#[derive(Debug, Clone)]
pub struct FileAnalysis {
    /// Sorted by absolute start line; ties keep chunk order.
    pub issues: Vec<Issue>,
    pub documentation: Documentation,
    pub chunk_count: usize,
    /// Chunks that degraded to zero issues after exhausting retries.
    pub failed_chunks: usize,
    pub token_count: u64,
    pub model: String,
}

struct ChunkOutcome {
    index: usize,
    issues: Vec<Issue>,
    tokens: u64,
    failed: bool,
}

pub struct AnalysisPipeline {
    analyzer: Arc<dyn Analyzer>,
    options: PipelineOptions,
    metrics: Metrics,
}

impl AnalysisPipeline {
    pub fn new(analyzer: Arc<dyn Analyzer>, options: PipelineOptions, metrics: Metrics) -> Self {
        Self {
            analyzer,
            options,
            metrics,
        }
    }

    pub fn model(&self) -> &str {
        self.analyzer.model()
    }

    pub fn chunk(&self, content: &str) -> Vec<CodeChunk> {
        match self.options.chunk_policy {
            ChunkPolicy::Lines => chunk_by_lines(content, self.options.lines_per_chunk),
            ChunkPolicy::Tokens => chunk_by_tokens(content, self.options.max_tokens_per_chunk),
        }
    }

    pub async fn analyze(
        &self,
        file_path: &str,
        file_type: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<FileAnalysis, PipelineError> {
        let started = Instant::now();
        let chunks = self.chunk(content);
        info!(
            file = file_path,
            chunks = chunks.len(),
            concurrency = self.options.max_concurrent_chunks,
            "Analyzing file"
        );

        // Boxed up front: mapping the stream lazily makes this future !Send,
        // and queue workers spawn it.
        let calls: Vec<BoxFuture<'_, Result<ChunkOutcome, PipelineError>>> = chunks
            .iter()
            .map(|chunk| {
                self.analyze_chunk(file_path, file_type, chunk, cancel)
                    .boxed()
            })
            .collect();
        let mut outcomes: Vec<ChunkOutcome> = stream::iter(calls)
            .buffer_unordered(self.options.max_concurrent_chunks.max(1))
            .try_collect()
            .await?;
        outcomes.sort_by_key(|o| o.index);

        let failed_chunks = outcomes.iter().filter(|o| o.failed).count();
        let mut token_count: u64 = outcomes.iter().map(|o| o.tokens).sum();
        let mut issues: Vec<Issue> = outcomes.into_iter().flat_map(|o| o.issues).collect();
        issues.sort_by_key(|i| i.location.start());

        let documentation = if self.options.skip_summary {
            if issues.is_empty() {
                Documentation::clean()
            } else {
                Documentation::fallback()
            }
        } else {
            let options = SummaryOptions {
                max_tokens: self.options.summary_max_tokens,
                timeout: self.options.summary_timeout,
            };
            let (doc, tokens) =
                summarize(self.analyzer.as_ref(), file_path, &issues, &options, cancel).await;
            token_count += tokens.unwrap_or(0);
            doc
        };
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(file_path.to_string()));
        }

        self.metrics
            .analysis_seconds
            .observe(started.elapsed().as_secs_f64());
        info!(
            file = file_path,
            issues = issues.len(),
            failed_chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "File analysis finished"
        );
        Ok(FileAnalysis {
            issues,
            documentation,
            chunk_count: chunks.len(),
            failed_chunks,
            token_count,
            model: self.analyzer.model().to_string(),
        })
    }

    async fn analyze_chunk(
        &self,
        file_path: &str,
        file_type: &str,
        chunk: &CodeChunk,
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome, PipelineError> {
        let request = CompletionRequest {
            system: CHUNK_SYSTEM_PROMPT.into(),
            user: chunk_prompt(file_path, file_type, chunk),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
            timeout: self.options.chunk_timeout,
            json_mode: false,
        };
        debug!(
            file = file_path,
            chunk = chunk.index,
            start = chunk.start_line,
            end = chunk.end_line,
            "Sending chunk"
        );
        match self
            .options
            .retry
            .call(self.analyzer.as_ref(), &request, cancel)
            .await
        {
            Ok(done) => {
                self.metrics.analyzer_calls.with_label_values(&["ok"]).inc();
                Ok(ChunkOutcome {
                    index: chunk.index,
                    issues: extract_issues(&done.content, chunk, file_path),
                    tokens: done.total_tokens.unwrap_or(0),
                    failed: false,
                })
            }
            Err(AnalyzerError::Cancelled) => Err(PipelineError::Cancelled(file_path.to_string())),
            Err(e) if e.is_fatal() => {
                self.metrics.analyzer_calls.with_label_values(&[e.kind()]).inc();
                Err(PipelineError::Aborted {
                    file: file_path.to_string(),
                    start: chunk.start_line,
                    end: chunk.end_line,
                    source: e,
                })
            }
            Err(e) => {
                self.metrics.analyzer_calls.with_label_values(&[e.kind()]).inc();
                warn!(
                    file = file_path,
                    chunk = chunk.index,
                    start = chunk.start_line,
                    end = chunk.end_line,
                    "Chunk analysis failed after retries; continuing without it: {e}"
                );
                Ok(ChunkOutcome {
                    index: chunk.index,
                    issues: Vec::new(),
                    tokens: 0,
                    failed: true,
                })
            }
        }
    }
}
