//! LLM-backed code review of stored files.

pub mod analyzer;
pub mod chunker;
pub mod issues;
pub mod openai;
pub mod pipeline;
pub mod prompt;
pub mod retry;
pub mod summary;

pub use analyzer::{Analyzer, AnalyzerError, Completion, CompletionRequest};
pub use chunker::{chunk_by_lines, chunk_by_tokens, split_by_budget, CodeChunk};
pub use issues::{Issue, Location, Severity};
pub use openai::OpenAiAnalyzer;
pub use pipeline::{AnalysisPipeline, FileAnalysis, PipelineError, PipelineOptions};
pub use retry::RetryPolicy;
pub use summary::Documentation;
