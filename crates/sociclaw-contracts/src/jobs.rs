use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

/// Lifecycle of an upstream generation job.
///
/// `TimedOut` is never reported by the upstream; it marks a job the client
/// stopped waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Submitted,
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    TimedOut,
    Unknown(String),
}

impl JobStatus {
    /// Case-insensitive parse of the upstream `status` string.
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "submitted" | "created" => Self::Submitted,
            "queued" | "pending" => Self::Queued,
            "running" | "processing" | "in_progress" | "starting" => Self::Running,
            "completed" => Self::Completed,
            "failed" | "error" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unknown(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
            Self::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful submission hands back: the job id plus the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub job_id: String,
    pub raw: Value,
}

impl JobDescriptor {
    /// Accepts `job_id` or `id`, as a string or a number. Returns `None` when neither is usable.
    pub fn from_payload(raw: Value) -> Option<Self> {
        let job_id = ["job_id", "id"]
            .iter()
            .filter_map(|key| raw.get(*key))
            .find_map(id_text)?;
        Some(Self { job_id, raw })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationJob {
    pub job_id: String,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub raw: Value,
}

impl GenerationJob {
    pub fn from_payload(job_id: impl Into<String>, raw: Value) -> Self {
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .map(JobStatus::parse)
            .unwrap_or_else(|| JobStatus::Unknown(String::new()));
        let result_url = ["result_url", "url"]
            .iter()
            .filter_map(|key| raw.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string);
        Self {
            job_id: job_id.into(),
            status,
            result_url,
            raw,
        }
    }
}

/// Outcome of one successful orchestration call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub url: String,
    pub local_path: Option<PathBuf>,
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => Some(raw.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(raw) => Some(raw.to_string()),
        _ => None,
    }
}
