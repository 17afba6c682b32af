use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::transport::{HttpResponse, TransportError};

const ERROR_BODY_MAX_CHARS: usize = 512;

/// Every failure the engine surfaces to callers.
///
/// Resolver rejections are deliberately absent: they resolve to `None`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{operation} transport failure: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("{operation} request failed ({status}): {body}")]
    Http {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("job contract violation: {0}")]
    JobContract(String),
    #[error("image job {job_id} failed with status '{status}': {}", preview(.payload))]
    JobFailed {
        job_id: String,
        status: String,
        payload: Value,
    },
    #[error("image job {job_id} did not complete within {:.1}s", .timeout.as_secs_f64())]
    JobTimedOut {
        job_id: String,
        timeout: Duration,
        last_payload: Option<Value>,
    },
    #[error("insufficient credits for {user} (balance {available})")]
    InsufficientCredits { user: String, available: u64 },
    #[error("image generation failed after {attempts} attempts: {last}")]
    GenerationExhausted {
        attempts: u32,
        #[source]
        last: Box<EngineError>,
    },
    #[error("payment collaborator failed: {0:#}")]
    Payment(#[source] anyhow::Error),
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn transport(operation: &'static str, source: TransportError) -> Self {
        Self::Transport { operation, source }
    }

    pub(crate) fn from_response(operation: &'static str, response: &HttpResponse) -> Self {
        Self::Http {
            operation,
            status: response.status,
            body: truncate_text(&response.text(), ERROR_BODY_MAX_CHARS),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether rerunning the whole submit-and-poll sequence could plausibly succeed.
    pub fn is_retryable_generation_failure(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::JobFailed { .. } | Self::JobTimedOut { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn preview(payload: &Value) -> String {
    truncate_text(&payload.to_string(), ERROR_BODY_MAX_CHARS)
}
