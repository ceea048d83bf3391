//! The external code analyzer seam.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure of one analyzer call, classified for the caller.
#[derive(Debug, Clone, Error)]
pub enum AnalyzerError {
    /// HTTP 429. Retried with exponential backoff.
    #[error("analyzer rate limited: {0}")]
    RateLimited(String),
    /// Timeout, 5xx or an unreadable body. Retried, then the chunk degrades
    /// to zero issues.
    #[error("analyzer call failed: {0}")]
    Recoverable(String),
    /// Connection-level or credential failure. Aborts the whole file.
    #[error("analyzer unreachable: {0}")]
    Fatal(String),
    #[error("analysis cancelled")]
    Cancelled,
}

impl AnalyzerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Cancelled)
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::Recoverable(_) => "recoverable",
            Self::Fatal(_) => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Ask the analyzer for a JSON object response.
    pub json_mode: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub total_tokens: Option<u64>,
}

/// A chat-completion style analyzer.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AnalyzerError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted analyzer for pipeline, job and HTTP tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Responder = dyn Fn(&CompletionRequest) -> Result<Completion, AnalyzerError> + Send + Sync;

    pub struct ScriptedAnalyzer {
        script: Mutex<VecDeque<Result<String, AnalyzerError>>>,
        responder: Option<Box<Responder>>,
        pub calls: AtomicUsize,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedAnalyzer {
        /// Replies in order; once the script runs out every call returns
        /// an empty issue list.
        pub fn new(script: Vec<Result<String, AnalyzerError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                responder: None,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn with_responder(
            f: impl Fn(&CompletionRequest) -> Result<Completion, AnalyzerError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                responder: Some(Box::new(f)),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Analyzer for ScriptedAnalyzer {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<Completion, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            if let Some(responder) = &self.responder {
                return responder(&request);
            }
            let next = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(r#"{"issues": []}"#.to_string()));
            next.map(|content| Completion {
                content,
                model: "scripted".into(),
                total_tokens: Some(10),
            })
        }
    }
}
