//! Free-text documentation for a file's issue list.

use super::analyzer::{Analyzer, CompletionRequest};
use super::issues::{parse_json_object, Issue};
use super::prompt::{summary_prompt, SUMMARY_SYSTEM_PROMPT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_ISSUE_DETAILS: &str = "Analysis complete. Review individual issues.";
pub const DEFAULT_FIX_EXPLANATION: &str =
    "Apply fixes based on individual issue suggestions and severity.";
pub const CLEAN_ISSUE_DETAILS: &str =
    "No specific code issues requiring fixes were automatically detected.";
pub const CLEAN_FIX_EXPLANATION: &str = "No fixes suggested.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Documentation {
    pub issue_details: String,
    pub fix_explanation: String,
}

impl Documentation {
    pub fn fallback() -> Self {
        Self {
            issue_details: DEFAULT_ISSUE_DETAILS.into(),
            fix_explanation: DEFAULT_FIX_EXPLANATION.into(),
        }
    }

    pub fn clean() -> Self {
        Self {
            issue_details: CLEAN_ISSUE_DETAILS.into(),
            fix_explanation: CLEAN_FIX_EXPLANATION.into(),
        }
    }

    fn from_response(content: &str) -> Option<Self> {
        let value = parse_json_object(content)?;
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        Some(Self {
            issue_details: field("issue_details").unwrap_or_else(|| DEFAULT_ISSUE_DETAILS.into()),
            fix_explanation: field("fix_explanation")
                .unwrap_or_else(|| DEFAULT_FIX_EXPLANATION.into()),
        })
    }
}

pub struct SummaryOptions {
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// One summary call, no retries. Any failure yields the fallback text.
pub async fn summarize(
    analyzer: &dyn Analyzer,
    file_path: &str,
    issues: &[Issue],
    options: &SummaryOptions,
    cancel: &CancellationToken,
) -> (Documentation, Option<u64>) {
    if issues.is_empty() {
        return (Documentation::clean(), None);
    }
    let request = CompletionRequest {
        system: SUMMARY_SYSTEM_PROMPT.into(),
        user: summary_prompt(file_path, issues),
        max_tokens: options.max_tokens,
        temperature: 0.3,
        timeout: options.timeout,
        json_mode: true,
    };
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => return (Documentation::fallback(), None),
        r = analyzer.complete(request) => r,
    };
    match result {
        Ok(done) => match Documentation::from_response(&done.content) {
            Some(doc) => (doc, done.total_tokens),
            None => {
                warn!(file = file_path, "Summary response is not JSON; using fallback text");
                (Documentation::fallback(), done.total_tokens)
            }
        },
        Err(e) => {
            warn!(file = file_path, "Summary call failed; using fallback text: {e}");
            (Documentation::fallback(), None)
        }
    }
}
