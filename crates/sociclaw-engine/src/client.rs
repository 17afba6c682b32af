use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use sociclaw_contracts::jobs::{GenerationJob, JobDescriptor, JobStatus};
use sociclaw_contracts::retry::RetryPolicy;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::EngineError;
use crate::resolver::ImageInputResolver;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, RetryTransport, Sleeper};

const MIN_POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGE_INPUT_HINTS: [&str; 5] = [
    "image input",
    "image_url",
    "image_data_url",
    "missing image",
    "requires an image",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRequest {
    pub prompt: String,
    pub model: String,
    pub image_reference: Option<String>,
    pub webhook_url: Option<String>,
    pub user_id: Option<String>,
    /// Merged into the payload last.
    pub extra: Map<String, Value>,
}

impl JobRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_image_reference(mut self, reference: Option<String>) -> Self {
        self.image_reference = reference.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_webhook_url(mut self, webhook_url: Option<String>) -> Self {
        self.webhook_url = webhook_url.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id.filter(|value| !value.trim().is_empty());
        self
    }

    fn base_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("prompt".to_string(), Value::String(self.prompt.clone()));
        payload.insert("model".to_string(), Value::String(self.model.clone()));
        let optional = [
            ("image_url", &self.image_reference),
            ("webhook_url", &self.webhook_url),
            ("user_id", &self.user_id),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                payload.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        for (key, value) in &self.extra {
            payload.insert(key.clone(), value.clone());
        }
        payload
    }
}

/// One submission body shape. `fallback_on` decides whether a failed response
/// justifies moving on to the next variant.
#[derive(Clone)]
pub struct PayloadVariant {
    pub label: &'static str,
    pub payload: Map<String, Value>,
    pub fallback_on: fn(&HttpResponse) -> bool,
}

/// Ordered submission shapes: the caller's reference, then the reference plus
/// the inline image, then the inline image alone.
pub fn payload_variants(request: &JobRequest, inline_image: Option<&str>) -> Vec<PayloadVariant> {
    let base = request.base_payload();
    let Some(inline_image) = inline_image else {
        return vec![PayloadVariant {
            label: "reference",
            payload: base,
            fallback_on: never,
        }];
    };

    let mut with_inline = base.clone();
    with_inline.insert(
        "image_data_url".to_string(),
        Value::String(inline_image.to_string()),
    );
    let mut inline_only = with_inline.clone();
    inline_only.remove("image_url");

    vec![
        PayloadVariant {
            label: "reference",
            payload: base,
            fallback_on: is_image_input_rejection,
        },
        PayloadVariant {
            label: "reference_with_inline",
            payload: with_inline,
            fallback_on: is_image_input_rejection,
        },
        PayloadVariant {
            label: "inline_only",
            payload: inline_only,
            fallback_on: never,
        },
    ]
}

/// A 400/422 whose body points at the image input.
pub fn is_image_input_rejection(response: &HttpResponse) -> bool {
    if !matches!(response.status, 400 | 422) {
        return false;
    }
    let body = response.text().to_ascii_lowercase();
    IMAGE_INPUT_HINTS.iter().any(|hint| body.contains(hint))
}

fn never(_: &HttpResponse) -> bool {
    false
}

fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= 128
        && job_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':'))
}

/// Submits generation jobs and waits for them to reach a terminal state.
pub struct JobClient {
    api_key: String,
    generate_url: String,
    jobs_base_url: String,
    request_timeout: Duration,
    retry: RetryPolicy,
    transport: RetryTransport,
    resolver: ImageInputResolver,
    sleeper: Sleeper,
}

impl JobClient {
    pub fn new(config: &ClientConfig, transport: Arc<dyn HttpTransport>) -> Result<Self, EngineError> {
        let retry = RetryTransport::new(transport);
        let sleeper = retry.sleeper();
        Self::build(config, retry, sleeper)
    }

    pub fn with_sleeper(
        config: &ClientConfig,
        transport: Arc<dyn HttpTransport>,
        sleeper: Sleeper,
    ) -> Result<Self, EngineError> {
        let retry = RetryTransport::new(transport).with_sleeper(sleeper.clone());
        Self::build(config, retry, sleeper)
    }

    fn build(
        config: &ClientConfig,
        transport: RetryTransport,
        sleeper: Sleeper,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let mut jobs_base_url = config.jobs_base_url.trim().to_string();
        if !jobs_base_url.ends_with('/') {
            jobs_base_url.push('/');
        }
        Ok(Self {
            api_key: config.api_key.trim().to_string(),
            generate_url: config.generate_url.trim().to_string(),
            jobs_base_url,
            request_timeout: config.request_timeout,
            retry: config.retry.clone(),
            resolver: ImageInputResolver::new(&config.resolver, transport.clone()),
            transport,
            sleeper,
        })
    }

    pub fn transport(&self) -> &RetryTransport {
        &self.transport
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn sleeper(&self) -> Sleeper {
        self.sleeper.clone()
    }

    pub fn resolver(&self) -> &ImageInputResolver {
        &self.resolver
    }

    pub fn create_job(&self, request: &JobRequest) -> Result<JobDescriptor, EngineError> {
        let inline_image = request
            .image_reference
            .as_deref()
            .and_then(|reference| self.resolver.resolve_data_url(reference));
        if request.image_reference.is_some() && inline_image.is_none() {
            debug!("image reference has no inline form; submitting reference only");
        }

        let mut variants = payload_variants(request, inline_image.as_deref())
            .into_iter()
            .peekable();
        while let Some(variant) = variants.next() {
            let http_request = HttpRequest::post_json(
                &self.generate_url,
                Value::Object(variant.payload),
                self.request_timeout,
            )
            .bearer_auth(&self.api_key);
            let response = self
                .transport
                .execute(&http_request, &self.retry)
                .map_err(|err| EngineError::transport("create_job", err))?;

            if response.is_success() {
                let payload = response.json().map_err(|err| {
                    EngineError::JobContract(format!("create_job returned invalid JSON: {err}"))
                })?;
                let descriptor = JobDescriptor::from_payload(payload).ok_or_else(|| {
                    EngineError::JobContract("create_job response has no job_id or id".to_string())
                })?;
                info!(job_id = %descriptor.job_id, variant = variant.label, "image job submitted");
                return Ok(descriptor);
            }

            if variants.peek().is_some() && (variant.fallback_on)(&response) {
                warn!(
                    status = response.status,
                    variant = variant.label,
                    "upstream rejected image input; retrying with alternate payload"
                );
                continue;
            }
            return Err(EngineError::from_response("create_job", &response));
        }
        Err(EngineError::JobContract(
            "no payload variant was submitted".to_string(),
        ))
    }

    /// Raw status payload for `job_id`.
    pub fn get_job(&self, job_id: &str) -> Result<Value, EngineError> {
        if !is_valid_job_id(job_id) {
            return Err(EngineError::JobContract(format!(
                "job id contains unsupported characters: {job_id:?}"
            )));
        }
        let request = HttpRequest::get(
            format!("{}{}", self.jobs_base_url, job_id),
            self.request_timeout.max(MIN_POLL_REQUEST_TIMEOUT),
        )
        .bearer_auth(&self.api_key)
        .header("Content-Type", "application/json");
        let response = self
            .transport
            .execute(&request, &self.retry)
            .map_err(|err| EngineError::transport("get_job", err))?;
        if !response.is_success() {
            return Err(EngineError::from_response("get_job", &response));
        }
        response
            .json()
            .map_err(|err| EngineError::JobContract(format!("get_job returned invalid JSON: {err}")))
    }

    pub fn poll(&self, job_id: &str, settings: PollSettings) -> Result<GenerationJob, EngineError> {
        let started = Instant::now();
        let mut last_payload = None;

        while started.elapsed() < settings.timeout {
            let job = GenerationJob::from_payload(job_id, self.get_job(job_id)?);
            match &job.status {
                JobStatus::Completed if job.result_url.is_none() => {
                    return Err(EngineError::JobContract(format!(
                        "job {job_id} completed without result_url or url"
                    )));
                }
                JobStatus::Completed => {
                    info!(job_id, "image job completed");
                    return Ok(job);
                }
                status if status.is_failure() => {
                    return Err(EngineError::JobFailed {
                        job_id: job_id.to_string(),
                        status: status.to_string(),
                        payload: job.raw,
                    });
                }
                status => debug!(job_id, status = %status, "image job not finished"),
            }
            last_payload = Some(job.raw);

            let remaining = settings.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            (self.sleeper)(settings.interval.min(remaining));
        }

        Err(EngineError::JobTimedOut {
            job_id: job_id.to_string(),
            timeout: settings.timeout,
            last_payload,
        })
    }

    /// Submit then poll; returns the result URL.
    pub fn generate(&self, request: &JobRequest, settings: PollSettings) -> Result<String, EngineError> {
        let descriptor = self.create_job(request)?;
        let job = self.poll(&descriptor.job_id, settings)?;
        job.result_url.ok_or_else(|| {
            EngineError::JobContract(format!("job {} has no result URL", job.job_id))
        })
    }
}
