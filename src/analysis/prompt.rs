//! Prompt text for chunk review and documentation summaries.

use super::chunker::CodeChunk;
use super::issues::Issue;
use std::fmt::Write;

pub const CHUNK_SYSTEM_PROMPT: &str = "You are a senior WordPress code reviewer. You inspect \
code for security vulnerabilities, performance problems, WordPress coding standard violations \
and plain bugs. You answer with a single JSON object and nothing else.";

pub const SUMMARY_SYSTEM_PROMPT: &str = "You summarize code review findings for site owners. \
You answer with a single JSON object and nothing else.";

/// Issues quoted in the summary request.
pub const SUMMARY_ISSUE_LIMIT: usize = 10;

pub fn chunk_prompt(file_path: &str, file_type: &str, chunk: &CodeChunk) -> String {
    format!(
        "Review lines {start}-{end} of `{file_path}` (type: {file_type}).\n\
         Line numbers you report are relative to this excerpt: its first line is line 1 \
         and its last line is line {count}.\n\n\
         Return ONLY a JSON object of the form {{\"issues\": [...]}}. Each issue has exactly \
         these fields, in this order, and every field is required:\n\
         - relative_line: an integer, or a \"start-end\" string for a range\n\
         - original_code_snippet: the offending code, copied verbatim\n\
         - issue: what is wrong\n\
         - severity: one of Critical, High, Medium, Low, Info\n\
         - fix_suggestion: replacement code, or an explanation when no code fix applies; never empty\n\
         - auto_fixable: one of yes, semi, no\n\
         - apply_method: one of replace_lines, modify_lines\n\n\
         Return {{\"issues\": []}} when the excerpt has no problems.\n\n\
         ```{file_type}\n{content}\n```",
        start = chunk.start_line,
        end = chunk.end_line,
        count = chunk.line_count,
        content = chunk.content,
    )
}

pub fn summary_prompt(file_path: &str, issues: &[Issue]) -> String {
    let mut listing = String::new();
    for issue in issues.iter().take(SUMMARY_ISSUE_LIMIT) {
        let _ = writeln!(
            listing,
            "- Line(s) {} ({:?}): {}",
            issue.location, issue.severity, issue.issue
        );
    }
    format!(
        "`{file_path}` has {total} reported issue(s). The first ones:\n{listing}\n\
         Return ONLY a JSON object with two string fields:\n\
         - issue_details: a short overview of the problems\n\
         - fix_explanation: how to approach fixing them",
        total = issues.len(),
    )
}
