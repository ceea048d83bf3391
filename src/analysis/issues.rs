//! Analyzer response parsing, issue validation and line remapping.

use super::chunker::CodeChunk;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

static FENCED_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?(.*?)```").ok());

const REQUIRED_FIELDS: [&str; 7] = [
    "relative_line",
    "original_code_snippet",
    "issue",
    "severity",
    "fix_suggestion",
    "auto_fixable",
    "apply_method",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoFixable {
    Yes,
    Semi,
    No,
}

impl AutoFixable {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Some(Self::Yes),
            "semi" => Some(Self::Semi),
            "no" => Some(Self::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMethod {
    ReplaceLines,
    ModifyLines,
}

impl ApplyMethod {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace_lines" => Some(Self::ReplaceLines),
            "modify_lines" => Some(Self::ModifyLines),
            _ => None,
        }
    }
}

/// Absolute position of an issue: one line, or an inclusive range
/// rendered as `"start-end"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Line(usize),
    Range(usize, usize),
}

impl Location {
    pub fn start(self) -> usize {
        match self {
            Self::Line(l) | Self::Range(l, _) => l,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(l) => write!(f, "{l}"),
            Self::Range(a, b) => write!(f, "{a}-{b}"),
        }
    }
}

impl Serialize for Location {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Line(l) => serializer.serialize_u64(*l as u64),
            Self::Range(..) => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_relative(&value).ok_or_else(|| serde::de::Error::custom("invalid location"))
    }
}

/// A validated issue with its absolute location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub location: Location,
    pub original_code_snippet: String,
    pub issue: String,
    pub severity: Severity,
    pub fix_suggestion: String,
    pub auto_fixable: AutoFixable,
    pub apply_method: ApplyMethod,
}

/// Why a reported issue was not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingField(&'static str),
    InvalidValue(&'static str),
    BadLineFormat(String),
    OutOfBounds { relative: String, line_count: usize },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(name) => write!(f, "missing field `{name}`"),
            Self::InvalidValue(name) => write!(f, "invalid value for `{name}`"),
            Self::BadLineFormat(raw) => write!(f, "unrecognized relative_line `{raw}`"),
            Self::OutOfBounds {
                relative,
                line_count,
            } => write!(f, "relative_line {relative} outside 1..={line_count}"),
        }
    }
}

/// Parse the analyzer's text as JSON, falling back to the first fenced
/// code block.
pub fn parse_json_object(content: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(content.trim()) {
        return Some(value);
    }
    let re = FENCED_BLOCK.as_ref()?;
    let inner = re.captures(content)?.get(1)?.as_str().trim();
    serde_json::from_str(inner).ok()
}

/// A relative line as the analyzer reports it: an integer, a numeric
/// string, or `"start-end"`.
fn parse_relative(value: &Value) -> Option<Location> {
    match value {
        Value::Number(n) => n.as_u64().map(|l| Location::Line(l as usize)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(l) = s.parse::<usize>() {
                return Some(Location::Line(l));
            }
            let (a, b) = s.split_once('-')?;
            Some(Location::Range(a.trim().parse().ok()?, b.trim().parse().ok()?))
        }
        _ => None,
    }
}

/// Map a chunk-relative location to absolute lines:
/// `absolute = start_line + relative - 1`, with `1 <= relative <= line_count`.
pub fn remap(relative: Location, chunk: &CodeChunk) -> Result<Location, Rejection> {
    let in_bounds = |l: usize| l >= 1 && l <= chunk.line_count;
    let absolute = |l: usize| chunk.start_line + l - 1;
    match relative {
        Location::Line(l) if in_bounds(l) => Ok(Location::Line(absolute(l))),
        Location::Range(a, b) if in_bounds(a) && in_bounds(b) && a <= b => {
            Ok(Location::Range(absolute(a), absolute(b)))
        }
        other => Err(Rejection::OutOfBounds {
            relative: other.to_string(),
            line_count: chunk.line_count,
        }),
    }
}

fn text_field(obj: &Map<String, Value>, name: &'static str) -> Result<String, Rejection> {
    match obj.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(Rejection::MissingField(name)),
        Some(other) => Ok(other.to_string()),
    }
}

/// Validate one raw issue object and convert it to absolute lines.
pub fn validate_issue(raw: &Value, chunk: &CodeChunk) -> Result<Issue, Rejection> {
    let obj = raw.as_object().ok_or(Rejection::InvalidValue("issue"))?;
    for name in REQUIRED_FIELDS {
        if obj.get(name).is_none_or(Value::is_null) {
            return Err(Rejection::MissingField(name));
        }
    }
    let raw_line = &obj["relative_line"];
    let relative =
        parse_relative(raw_line).ok_or_else(|| Rejection::BadLineFormat(raw_line.to_string()))?;
    let location = remap(relative, chunk)?;

    let fix_suggestion = text_field(obj, "fix_suggestion")?;
    if fix_suggestion.trim().is_empty() {
        return Err(Rejection::InvalidValue("fix_suggestion"));
    }
    let severity = Severity::parse(&text_field(obj, "severity")?)
        .ok_or(Rejection::InvalidValue("severity"))?;
    let auto_fixable = AutoFixable::parse(&text_field(obj, "auto_fixable")?)
        .ok_or(Rejection::InvalidValue("auto_fixable"))?;
    let apply_method = ApplyMethod::parse(&text_field(obj, "apply_method")?)
        .ok_or(Rejection::InvalidValue("apply_method"))?;

    Ok(Issue {
        location,
        original_code_snippet: text_field(obj, "original_code_snippet")?,
        issue: text_field(obj, "issue")?,
        severity,
        fix_suggestion,
        auto_fixable,
        apply_method,
    })
}

/// Every valid issue in an analyzer response for one chunk. Unparsable
/// responses and invalid issues are logged and skipped.
pub fn extract_issues(content: &str, chunk: &CodeChunk, file_path: &str) -> Vec<Issue> {
    let Some(parsed) = parse_json_object(content) else {
        warn!(
            file = file_path,
            chunk = chunk.index,
            lines = %format!("{}-{}", chunk.start_line, chunk.end_line),
            "Analyzer response is not JSON; treating chunk as clean"
        );
        return Vec::new();
    };
    let Some(raw_issues) = parsed.get("issues").and_then(Value::as_array) else {
        warn!(
            file = file_path,
            chunk = chunk.index,
            "Analyzer response has no `issues` array"
        );
        return Vec::new();
    };
    if raw_issues.is_empty() {
        debug!(file = file_path, chunk = chunk.index, "No issues reported");
    }
    raw_issues
        .iter()
        .filter_map(|raw| match validate_issue(raw, chunk) {
            Ok(issue) => Some(issue),
            Err(reason) => {
                warn!(
                    file = file_path,
                    chunk = chunk.index,
                    %reason,
                    "Dropping analyzer issue"
                );
                None
            }
        })
        .collect()
}
