//! Env-driven configuration for the job client, the input resolver and the generator.
//!
//! Every loader goes through a lookup function so callers (and tests) can
//! supply values without touching the process environment. Fields are public:
//! explicit arguments override whatever the environment provided.
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sociclaw_contracts::images::DEFAULT_MAX_IMAGE_BYTES;
use sociclaw_contracts::retry::{RetryPolicy, DEFAULT_BACKOFF_BASE_SECONDS, DEFAULT_MAX_RETRIES};
use sociclaw_contracts::validators::redact_secret;

use crate::client::PollSettings;
use crate::error::EngineError;

pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub const DEFAULT_MODEL: &str = "nano-banana";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: f64 = 30.0;
pub const DEFAULT_MAX_REDIRECTS: usize = 3;
pub const DEFAULT_MAX_DOWNLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lookup_text(lookup: EnvLookup<'_>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lookup_bool(lookup: EnvLookup<'_>, key: &str) -> bool {
    lookup_text(lookup, key)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn lookup_f64(lookup: EnvLookup<'_>, key: &str, default: f64, min: f64, max: f64) -> f64 {
    lookup_text(lookup, key)
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

fn lookup_list(lookup: EnvLookup<'_>, key: &str) -> Vec<String> {
    lookup_text(lookup, key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn retry_from_lookup(lookup: EnvLookup<'_>) -> RetryPolicy {
    let max_retries = lookup_f64(
        lookup,
        "SOCICLAW_HTTP_MAX_RETRIES",
        f64::from(DEFAULT_MAX_RETRIES),
        0.0,
        10.0,
    )
    .round() as u32;
    let backoff = lookup_f64(
        lookup,
        "SOCICLAW_HTTP_BACKOFF_SECONDS",
        DEFAULT_BACKOFF_BASE_SECONDS,
        0.05,
        30.0,
    );
    RetryPolicy::new(max_retries, backoff)
}

fn current_dir() -> PathBuf {
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Generate and jobs endpoints derived from a single API base URL.
pub fn endpoints_from_base(base_url: &str) -> Option<(String, String)> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return None;
    }
    Some((
        format!("{base}/api/v1?path=generate"),
        format!("{base}/api/v1/jobs/"),
    ))
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub max_payload_bytes: usize,
    /// Relative paths and relative root entries resolve against this directory.
    pub base_dir: PathBuf,
    /// Raw root entries; empty means the defaults under `base_dir`.
    pub allowed_roots: Vec<PathBuf>,
    pub allow_absolute_roots: bool,
    pub allow_remote_fetch: bool,
    pub allowed_hosts: Vec<String>,
    pub max_redirects: usize,
    /// Skips remote fetching for inline fallback even when it is otherwise allowed.
    pub disable_inline_fallback: bool,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ResolverConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_IMAGE_BYTES,
            base_dir: base_dir.into(),
            allowed_roots: Vec::new(),
            allow_absolute_roots: false,
            allow_remote_fetch: false,
            allowed_hosts: Vec::new(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            disable_inline_fallback: false,
            request_timeout: Duration::from_secs_f64(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_lookup(lookup: EnvLookup<'_>, base_dir: impl Into<PathBuf>) -> Self {
        let defaults = Self::new(base_dir);
        Self {
            max_payload_bytes: lookup_f64(
                lookup,
                "SOCICLAW_IMAGE_INPUT_MAX_BYTES",
                DEFAULT_MAX_IMAGE_BYTES as f64,
                1.0,
                (256 * 1024 * 1024) as f64,
            ) as usize,
            allowed_roots: lookup_list(lookup, "SOCICLAW_ALLOWED_IMAGE_INPUT_DIRS")
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            allow_absolute_roots: lookup_bool(lookup, "SOCICLAW_ALLOW_ABSOLUTE_IMAGE_INPUT_DIRS"),
            allow_remote_fetch: lookup_bool(lookup, "SOCICLAW_ALLOW_IMAGE_URL_INPUT"),
            allowed_hosts: lookup_list(lookup, "SOCICLAW_ALLOWED_IMAGE_URL_HOSTS"),
            max_redirects: lookup_f64(
                lookup,
                "SOCICLAW_IMAGE_URL_MAX_REDIRECTS",
                DEFAULT_MAX_REDIRECTS as f64,
                0.0,
                10.0,
            )
            .round() as usize,
            disable_inline_fallback: lookup_bool(lookup, "SOCICLAW_DISABLE_IMAGE_DATA_URL_FALLBACK"),
            request_timeout: Duration::from_secs_f64(lookup_f64(
                lookup,
                "SOCICLAW_HTTP_TIMEOUT_SECONDS",
                DEFAULT_REQUEST_TIMEOUT_SECONDS,
                1.0,
                300.0,
            )),
            retry: retry_from_lookup(lookup),
            ..defaults
        }
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub generate_url: String,
    pub jobs_base_url: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub resolver: ResolverConfig,
}

impl ClientConfig {
    pub fn new(
        api_key: impl Into<String>,
        generate_url: impl Into<String>,
        jobs_base_url: impl Into<String>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            generate_url: generate_url.into(),
            jobs_base_url: jobs_base_url.into(),
            request_timeout: Duration::from_secs_f64(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            retry: RetryPolicy::default(),
            resolver: ResolverConfig::new(base_dir),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(&non_empty_env, current_dir())
    }

    pub fn from_lookup(lookup: EnvLookup<'_>, base_dir: impl Into<PathBuf>) -> Self {
        let resolver = ResolverConfig::from_lookup(lookup, base_dir);
        let derived = lookup_text(lookup, "SOCICLAW_IMAGE_API_BASE_URL")
            .and_then(|base| endpoints_from_base(&base));
        let generate_url = lookup_text(lookup, "SOCICLAW_IMAGE_GENERATE_URL")
            .or_else(|| derived.as_ref().map(|(generate, _)| generate.clone()))
            .unwrap_or_default();
        let jobs_base_url = lookup_text(lookup, "SOCICLAW_IMAGE_JOBS_URL")
            .or_else(|| derived.as_ref().map(|(_, jobs)| jobs.clone()))
            .unwrap_or_default();
        Self {
            api_key: lookup_text(lookup, "SOCICLAW_IMAGE_API_KEY").unwrap_or_default(),
            generate_url,
            jobs_base_url,
            request_timeout: resolver.request_timeout,
            retry: resolver.retry.clone(),
            resolver,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        if let Some((generate_url, jobs_base_url)) = endpoints_from_base(base_url) {
            self.generate_url = generate_url;
            self.jobs_base_url = jobs_base_url;
        }
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.api_key.trim().is_empty() {
            return Err(EngineError::Config(
                "Missing image API key. Set SOCICLAW_IMAGE_API_KEY.".to_string(),
            ));
        }
        if self.generate_url.trim().is_empty() || self.jobs_base_url.trim().is_empty() {
            return Err(EngineError::Config(
                "Image API URLs are required. Set SOCICLAW_IMAGE_API_BASE_URL or pass generate/jobs URLs."
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &redact_secret(&self.api_key))
            .field("generate_url", &self.generate_url)
            .field("jobs_base_url", &self.jobs_base_url)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("resolver", &self.resolver)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub model: String,
    pub image_reference: Option<String>,
    pub webhook_url: Option<String>,
    pub poll: PollSettings,
    pub output_dir: PathBuf,
    /// Whole create-and-poll attempts, including the first.
    pub max_attempts: u32,
    pub initial_retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub download_timeout: Duration,
    /// Generated images larger than this are refused while downloading.
    pub max_download_bytes: usize,
}

impl GeneratorConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            image_reference: None,
            webhook_url: None,
            poll: PollSettings::default(),
            output_dir: output_dir.into(),
            max_attempts: 3,
            initial_retry_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            download_timeout: Duration::from_secs(30),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(&non_empty_env, &current_dir())
    }

    pub fn from_lookup(lookup: EnvLookup<'_>, base_dir: &Path) -> Self {
        let defaults = Self::new(default_output_dir(base_dir));
        Self {
            model: lookup_text(lookup, "SOCICLAW_IMAGE_MODEL").unwrap_or(defaults.model.clone()),
            image_reference: lookup_text(lookup, "SOCICLAW_IMAGE_URL"),
            webhook_url: lookup_text(lookup, "SOCICLAW_WEBHOOK_URL"),
            poll: PollSettings {
                timeout: Duration::from_secs_f64(lookup_f64(
                    lookup,
                    "SOCICLAW_IMAGE_TIMEOUT_SECONDS",
                    defaults.poll.timeout.as_secs_f64(),
                    1.0,
                    3600.0,
                )),
                interval: Duration::from_secs_f64(lookup_f64(
                    lookup,
                    "SOCICLAW_IMAGE_POLL_INTERVAL_SECONDS",
                    defaults.poll.interval.as_secs_f64(),
                    0.1,
                    60.0,
                )),
            },
            ..defaults
        }
    }
}

pub fn default_output_dir(base_dir: &Path) -> PathBuf {
    base_dir.join(".sociclaw").join("generated_images")
}
