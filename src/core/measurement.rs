//! Measurement records and classification of the tool's output.
//!
//! The Ookla CLI reports a result as one JSON document on stdout. When it
//! fails it writes a JSON diagnostic to stderr instead, while its progress
//! lines on stderr always start with `=`. [`classify`] relies on exactly that
//! convention: stderr wins unless it is empty or starts with `=`.
//!
//! Success document (trimmed):
//!
//! ```json
//! {"type":"result","timestamp":"2024-05-01T10:00:00Z",
//!  "ping":{"latency":12.345},
//!  "download":{"bandwidth":125000000},"upload":{"bandwidth":2500000},
//!  "isp":"Example ISP","server":{"id":4302,"name":"Vodafone"},
//!  "result":{"url":"https://www.speedtest.net/result/c/abc","persisted":true}}
//! ```
//!
//! Diagnostic line:
//!
//! ```json
//! {"type":"log","timestamp":"2024-05-01T10:00:00Z","message":"Configuration - No servers defined","level":"error"}
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::RunnerError;

/// A successful measurement, already normalized for publishing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementResult {
    /// Whole Mbit/s, truncated.
    pub download_mbps: u64,
    pub upload_mbps: u64,
    /// Milliseconds, two decimals.
    pub ping_ms: f64,
    pub isp: String,
    pub server_name: String,
    pub server_id: String,
    /// ISO-8601, as emitted by the tool.
    pub timestamp: String,
    /// Shareable result page. Empty unless the tool persisted the result.
    pub result_url: String,
}

/// A cycle that produced no result.
///
/// `level` is the tool's own severity for reported errors, `parse_error` for
/// unusable output and `fatal` when the tool could not be run at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementError {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

impl MeasurementError {
    /// Error stamped with the current time.
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }
}

impl From<RunnerError> for MeasurementError {
    fn from(err: RunnerError) -> Self {
        MeasurementError::new(err.level(), err.to_string())
    }
}

/// Outcome of one cycle. Exactly one is produced per run.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Success(MeasurementResult),
    Failure(MeasurementError),
}

impl Measurement {
    pub fn is_success(&self) -> bool {
        matches!(self, Measurement::Success(_))
    }
}

#[derive(Deserialize)]
struct ToolResult {
    download: Transfer,
    upload: Transfer,
    ping: Ping,
    isp: String,
    server: Server,
    #[serde(default)]
    result: ResultLink,
    timestamp: String,
}

#[derive(Deserialize)]
struct Transfer {
    /// Bytes per second.
    bandwidth: u64,
}

#[derive(Deserialize)]
struct Ping {
    latency: f64,
}

#[derive(Deserialize)]
struct Server {
    id: ServerId,
    name: String,
}

/// Numeric in current CLI versions, quoted in some older ones.
#[derive(Deserialize)]
#[serde(untagged)]
enum ServerId {
    Number(u64),
    Text(String),
}

impl ServerId {
    fn into_string(self) -> String {
        match self {
            ServerId::Number(n) => n.to_string(),
            ServerId::Text(s) => s,
        }
    }
}

#[derive(Deserialize, Default)]
struct ResultLink {
    #[serde(default)]
    url: String,
    #[serde(default)]
    persisted: bool,
}

#[derive(Deserialize)]
struct ToolDiagnostic {
    #[serde(rename = "type")]
    _kind: String,
    timestamp: String,
    message: String,
    level: String,
}

/// Bytes per second to whole Mbit/s, truncating.
pub fn to_mbps(bytes_per_sec: u64) -> u64 {
    bytes_per_sec.saturating_mul(8) / 1_000_000
}

/// Two decimals, halves rounded away from zero.
pub fn round_latency(latency: f64) -> f64 {
    (latency * 100.0).round() / 100.0
}

/// Latency payload text. Always carries a decimal point (`12.0`, `12.35`).
pub fn format_latency(ping_ms: f64) -> String {
    if ping_ms.fract() == 0.0 {
        format!("{ping_ms:.1}")
    } else {
        ping_ms.to_string()
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|e| {
            warn!("Failed to format error timestamp: {}", e);
            String::new()
        })
}

/// Parses a success document from stdout.
pub fn parse_result(stdout: &str) -> Result<MeasurementResult, RunnerError> {
    let raw: ToolResult = serde_json::from_str(stdout.trim())?;

    let result_url = if raw.result.persisted {
        raw.result.url
    } else {
        String::new()
    };

    Ok(MeasurementResult {
        download_mbps: to_mbps(raw.download.bandwidth),
        upload_mbps: to_mbps(raw.upload.bandwidth),
        ping_ms: round_latency(raw.ping.latency),
        isp: raw.isp,
        server_name: raw.server.name,
        server_id: raw.server.id.into_string(),
        timestamp: raw.timestamp,
        result_url,
    })
}

/// Parses the tool's diagnostic from stderr. Only the first non-empty line
/// is considered.
pub fn parse_diagnostic(stderr: &str) -> Result<MeasurementError, RunnerError> {
    let line = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let raw: ToolDiagnostic = serde_json::from_str(line)?;

    Ok(MeasurementError {
        level: raw.level,
        message: raw.message,
        timestamp: raw.timestamp,
    })
}

/// Whether stderr carries a diagnostic rather than progress output.
///
/// Only the very first character counts: progress lines start with `=`,
/// anything else (whitespace included) marks a diagnostic.
pub fn stderr_reports_error(stderr: &str) -> bool {
    stderr.chars().next().is_some_and(|first| first != '=')
}

/// Turns captured tool output into the outcome of the cycle.
pub fn classify(stdout: &str, stderr: &str) -> Measurement {
    let parsed = if stderr_reports_error(stderr) {
        debug!("Classifying output as a tool-reported error");
        parse_diagnostic(stderr).map(Measurement::Failure)
    } else {
        parse_result(stdout).map(Measurement::Success)
    };

    parsed.unwrap_or_else(|e| Measurement::Failure(e.into()))
}
