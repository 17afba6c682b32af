use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sociclaw_contracts::events::EventWriter;
use sociclaw_contracts::images::{extension_for_mime, sniff_image_mime};
use sociclaw_contracts::jobs::GenerationResult;
use tracing::{info, warn};

use crate::client::{JobClient, JobRequest};
use crate::config::GeneratorConfig;
use crate::error::EngineError;
use crate::transport::{HttpRequest, HttpResponse, Sleeper};

/// Balance reported when no ledger is attached.
pub const UNLIMITED_CREDITS: u64 = 1_000_000_000;

const MAX_RETRY_DELAY_SECONDS: f64 = 300.0;

/// External payment collaborator that owns credit balances.
pub trait CreditLedger: Send + Sync {
    fn get_credits(&self, user_address: &str) -> anyhow::Result<u64>;

    /// Debits one credit and returns the ledger's reference for the debit.
    fn use_credit(&self, user_address: &str) -> anyhow::Result<String>;
}

/// Credit-gated image generation with whole-job retries and local persistence.
pub struct ImageGenerator {
    config: GeneratorConfig,
    client: JobClient,
    ledger: Option<Arc<dyn CreditLedger>>,
    events: Option<EventWriter>,
    sleeper: Sleeper,
}

impl ImageGenerator {
    pub fn new(config: GeneratorConfig, client: JobClient) -> Result<Self, EngineError> {
        fs::create_dir_all(&config.output_dir).map_err(|source| EngineError::Io {
            path: config.output_dir.clone(),
            source,
        })?;
        let sleeper = client.sleeper();
        Ok(Self {
            config,
            client,
            ledger: None,
            events: None,
            sleeper,
        })
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn CreditLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn check_credits(&self, user_address: &str) -> Result<u64, EngineError> {
        match &self.ledger {
            Some(ledger) => ledger
                .get_credits(user_address)
                .map_err(EngineError::Payment),
            None => {
                warn!("no credit ledger configured; generation is not gated");
                Ok(UNLIMITED_CREDITS)
            }
        }
    }

    pub fn generate_image(
        &self,
        prompt: &str,
        user_address: &str,
    ) -> Result<GenerationResult, EngineError> {
        let available = self.check_credits(user_address)?;
        if available == 0 {
            return Err(EngineError::InsufficientCredits {
                user: user_address.to_string(),
                available,
            });
        }

        let request = JobRequest::new(prompt, &self.config.model)
            .with_image_reference(self.config.image_reference.clone())
            .with_webhook_url(self.config.webhook_url.clone())
            .with_user_id(Some(user_address.to_string()));
        self.emit(
            "generation_started",
            json!({
                "model": self.config.model,
                "has_image_reference": request.image_reference.is_some(),
                "max_attempts": self.attempts(),
            }),
        );

        let url = match self.generate_with_retries(&request) {
            Ok(url) => url,
            Err(err) => {
                self.emit("generation_failed", json!({"error": err.to_string()}));
                return Err(err);
            }
        };

        let local_path = self.save_artifact(&url)?;

        if let Some(ledger) = &self.ledger {
            let reference = ledger.use_credit(user_address).map_err(|err| {
                self.emit("generation_failed", json!({"error": format!("credit debit failed: {err:#}")}));
                EngineError::Payment(err)
            })?;
            info!(reference = %reference, "credit debited");
            self.emit("credit_debited", json!({"reference": reference}));
        }

        Ok(GenerationResult {
            url,
            local_path: Some(local_path),
        })
    }

    fn attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    fn generate_with_retries(&self, request: &JobRequest) -> Result<String, EngineError> {
        let attempts = self.attempts();
        let mut delay = self.config.initial_retry_delay;
        let mut attempt = 1;
        loop {
            info!(attempt, attempts, model = %self.config.model, "generating image");
            let err = match self.client.generate(request, self.config.poll) {
                Ok(url) => return Ok(url),
                Err(err) => err,
            };
            if !err.is_retryable_generation_failure() {
                return Err(err);
            }
            if attempt >= attempts {
                return Err(EngineError::GenerationExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            warn!(
                attempt,
                attempts,
                error = %err,
                delay_s = delay.as_secs_f64(),
                "image generation failed; retrying"
            );
            self.emit(
                "generation_attempt_failed",
                json!({
                    "attempt": attempt,
                    "error": err.to_string(),
                    "retry_in_s": delay.as_secs_f64(),
                }),
            );
            (self.sleeper)(delay);
            delay = next_delay(delay, self.config.backoff_multiplier);
            attempt += 1;
        }
    }

    fn save_artifact(&self, url: &str) -> Result<PathBuf, EngineError> {
        let parsed = Url::parse(url)
            .map_err(|err| EngineError::JobContract(format!("result URL is invalid: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::JobContract(format!(
                "result URL scheme '{}' is not downloadable",
                parsed.scheme()
            )));
        }

        let request = HttpRequest::get(url, self.config.download_timeout)
            .with_body_limit(self.config.max_download_bytes);
        let response = self
            .client
            .transport()
            .execute(&request, self.client.retry_policy())
            .map_err(|err| EngineError::transport("download_artifact", err))?;
        if !response.is_success() {
            return Err(EngineError::from_response("download_artifact", &response));
        }
        if response.body_truncated {
            return Err(EngineError::JobContract(format!(
                "result download exceeds {} bytes",
                self.config.max_download_bytes
            )));
        }
        if response.body.is_empty() {
            return Err(EngineError::JobContract(
                "result download returned an empty body".to_string(),
            ));
        }

        let extension = artifact_extension(&response).ok_or_else(|| {
            EngineError::JobContract(format!(
                "result download is not an image (content-type: {})",
                response.content_type().unwrap_or_else(|| "unknown".to_string())
            ))
        })?;
        let path = write_new_file(&self.config.output_dir, extension, &response.body)?;
        let sha256 = hex::encode(Sha256::digest(&response.body));
        info!(path = %path.display(), bytes = response.body.len(), "saved generated image");
        self.emit(
            "artifact_saved",
            json!({
                "url": url,
                "path": path.display().to_string(),
                "bytes": response.body.len(),
                "sha256": sha256,
            }),
        );
        Ok(path)
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(events) = &self.events else {
            return;
        };
        let payload = match payload {
            Value::Object(map) => map,
            _ => return,
        };
        if let Err(err) = events.emit(event_type, payload) {
            warn!(event_type, error = %err, "failed to write run event");
        }
    }
}

/// File extension for a downloaded artifact: sniffed bytes first, then a raster
/// `image/*` content type. `None` when neither identifies an image.
fn artifact_extension(response: &HttpResponse) -> Option<&'static str> {
    if let Some(extension) = sniff_image_mime(&response.body).and_then(extension_for_mime) {
        return Some(extension);
    }
    response
        .content_type()
        .filter(|value| value.starts_with("image/") && !value.contains("svg"))
        .and_then(|value| extension_for_mime(&value))
}

fn next_delay(delay: Duration, multiplier: f64) -> Duration {
    let multiplier = if multiplier.is_finite() && multiplier > 0.0 {
        multiplier
    } else {
        1.0
    };
    Duration::from_secs_f64((delay.as_secs_f64() * multiplier).min(MAX_RETRY_DELAY_SECONDS))
}

/// `sociclaw_<UTC timestamp>.<ext>`, never overwriting an existing file.
fn write_new_file(dir: &Path, extension: &str, bytes: &[u8]) -> Result<PathBuf, EngineError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let mut suffix = 0u32;
    loop {
        let name = if suffix == 0 {
            format!("sociclaw_{stamp}.{extension}")
        } else {
            format!("sociclaw_{stamp}_{suffix}.{extension}")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes)
                    .map_err(|source| EngineError::Io {
                        path: path.clone(),
                        source,
                    })?;
                return Ok(path);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(source) => return Err(EngineError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::client::PollSettings;
    use crate::config::ClientConfig;
    use crate::testing::{bytes_response, json_response, recording_sleeper, ScriptedTransport, PNG_BYTES};
    use sociclaw_contracts::retry::RetryPolicy;

    struct FakeLedger {
        credits: u64,
        output_dir: PathBuf,
        fail_debit: bool,
        debits: Mutex<Vec<String>>,
        saved_before_debit: Mutex<Vec<bool>>,
    }

    impl FakeLedger {
        fn new(credits: u64, output_dir: &Path) -> Self {
            Self {
                credits,
                output_dir: output_dir.to_path_buf(),
                fail_debit: false,
                debits: Mutex::new(Vec::new()),
                saved_before_debit: Mutex::new(Vec::new()),
            }
        }
    }

    impl CreditLedger for FakeLedger {
        fn get_credits(&self, _user_address: &str) -> anyhow::Result<u64> {
            Ok(self.credits)
        }

        fn use_credit(&self, user_address: &str) -> anyhow::Result<String> {
            let saved = fs::read_dir(&self.output_dir)?.next().is_some();
            self.saved_before_debit.lock().unwrap().push(saved);
            if self.fail_debit {
                anyhow::bail!("ledger unavailable");
            }
            self.debits.lock().unwrap().push(user_address.to_string());
            Ok("tx-1".to_string())
        }
    }

    fn generator(
        transport: Arc<ScriptedTransport>,
        output_dir: &Path,
    ) -> (ImageGenerator, Arc<Mutex<Vec<Duration>>>) {
        let mut client_config = ClientConfig::new(
            "sk_test_key_123456",
            "https://api.example.com/api/v1?path=generate",
            "https://api.example.com/api/v1/jobs/",
            output_dir,
        );
        client_config.retry = RetryPolicy::no_retries();
        let (sleeper, delays) = recording_sleeper();
        let client = JobClient::with_sleeper(&client_config, transport, sleeper).unwrap();

        let mut config = GeneratorConfig::new(output_dir);
        config.poll = PollSettings {
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(10),
        };
        (ImageGenerator::new(config, client).unwrap(), delays)
    }

    fn create(job_id: &str) -> crate::testing::Scripted {
        Ok(json_response(200, json!({"job_id": job_id})))
    }

    fn completed(job_id: &str) -> crate::testing::Scripted {
        Ok(json_response(
            200,
            json!({"status": "completed", "result_url": format!("https://cdn.example.com/{job_id}.png")}),
        ))
    }

    fn failed() -> crate::testing::Scripted {
        Ok(json_response(200, json!({"status": "failed", "error": "upstream"})))
    }

    fn download() -> crate::testing::Scripted {
        Ok(bytes_response(200, Some("image/png"), PNG_BYTES, "https://cdn.example.com/out.png"))
    }

    #[test]
    fn single_credit_is_debited_once_after_save() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("images");
        let transport = Arc::new(ScriptedTransport::new(vec![
            create("job_1"),
            completed("job_1"),
            download(),
        ]));
        let (generator, _) = generator(transport.clone(), &out);
        let ledger = Arc::new(FakeLedger::new(1, &out));
        let events_path = temp.path().join("events.jsonl");
        let generator = generator
            .with_ledger(ledger.clone())
            .with_events(EventWriter::new(&events_path, "run-1"));

        let result = generator.generate_image("a fox", "telegram:1")?;
        assert_eq!(result.url, "https://cdn.example.com/job_1.png");
        let local_path = result.local_path.expect("saved");
        assert_eq!(fs::read(&local_path)?, PNG_BYTES);
        assert_eq!(local_path.extension().and_then(|ext| ext.to_str()), Some("png"));
        assert!(local_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .starts_with("sociclaw_"));

        assert_eq!(*ledger.debits.lock().unwrap(), vec!["telegram:1".to_string()]);
        assert_eq!(*ledger.saved_before_debit.lock().unwrap(), vec![true]);
        assert_eq!(transport.requests()[0].json.clone().unwrap_or_default()["user_id"], json!("telegram:1"));

        let events = fs::read_to_string(&events_path)?;
        let types: Vec<String> = events
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(types, vec!["generation_started", "artifact_saved", "credit_debited"]);
        assert!(events.contains(&hex::encode(Sha256::digest(PNG_BYTES))));
        Ok(())
    }

    #[test]
    fn zero_credits_fail_before_any_network_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(Vec::new()));
        let (generator, _) = generator(transport.clone(), temp.path());
        let ledger = Arc::new(FakeLedger::new(0, temp.path()));
        let generator = generator.with_ledger(ledger.clone());

        let err = generator.generate_image("a fox", "telegram:1").unwrap_err();
        assert!(matches!(err, EngineError::InsufficientCredits { available: 0, .. }));
        assert_eq!(transport.calls(), 0);
        assert!(ledger.debits.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn without_ledger_generation_is_ungated() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![
            create("job_1"),
            completed("job_1"),
            download(),
        ]));
        let (generator, _) = generator(transport, temp.path());
        assert_eq!(generator.check_credits("anyone")?, UNLIMITED_CREDITS);
        assert!(generator.generate_image("a fox", "anyone")?.local_path.is_some());
        Ok(())
    }

    #[test]
    fn failed_job_is_retried_as_a_whole() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![
            create("job_1"),
            failed(),
            create("job_2"),
            completed("job_2"),
            download(),
        ]));
        let (generator, delays) = generator(transport.clone(), temp.path());

        let result = generator.generate_image("a fox", "telegram:1")?;
        assert_eq!(result.url, "https://cdn.example.com/job_2.png");
        assert_eq!(transport.calls(), 5);
        assert_eq!(*delays.lock().unwrap(), vec![Duration::from_secs(1)]);
        Ok(())
    }

    #[test]
    fn exhausted_attempts_wrap_last_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![
            create("job_1"),
            failed(),
            create("job_2"),
            failed(),
            create("job_3"),
            failed(),
        ]));
        let (generator, delays) = generator(transport.clone(), temp.path());
        let ledger = Arc::new(FakeLedger::new(5, temp.path()));
        let generator = generator.with_ledger(ledger.clone());

        match generator.generate_image("a fox", "telegram:1") {
            Err(EngineError::GenerationExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, EngineError::JobFailed { .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(
            *delays.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_millis(1500)]
        );
        assert!(ledger.debits.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn non_retryable_failures_surface_immediately() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json_response(
            401,
            json!({"error": "Unauthorized"}),
        ))]));
        let (generator, delays) = generator(transport.clone(), temp.path());

        let err = generator.generate_image("a fox", "telegram:1").unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.calls(), 1);
        assert!(delays.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn download_failure_propagates_without_outer_retry_or_debit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![
            create("job_1"),
            completed("job_1"),
            Ok(bytes_response(404, Some("text/plain"), b"gone", "https://cdn.example.com/job_1.png")),
        ]));
        let (generator, _) = generator(transport.clone(), temp.path());
        let ledger = Arc::new(FakeLedger::new(1, temp.path()));
        let generator = generator.with_ledger(ledger.clone());

        let err = generator.generate_image("a fox", "telegram:1").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Http {
                operation: "download_artifact",
                status: 404,
                ..
            }
        ));
        assert_eq!(transport.calls(), 3);
        assert!(ledger.debits.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn non_image_or_oversized_downloads_are_not_saved() -> anyhow::Result<()> {
        let mut oversized = bytes_response(200, Some("image/png"), PNG_BYTES, "https://cdn.example.com/job_1.png");
        oversized.body_truncated = true;
        let cases = vec![
            Ok(bytes_response(200, Some("text/html"), b"<html>login</html>", "https://cdn.example.com/job_1.png")),
            Ok(bytes_response(200, Some("image/svg+xml"), b"<svg/>", "https://cdn.example.com/job_1.svg")),
            Ok(oversized),
        ];
        for case in cases {
            let temp = tempfile::tempdir()?;
            let transport = Arc::new(ScriptedTransport::new(vec![
                create("job_1"),
                completed("job_1"),
                case,
            ]));
            let (generator, _) = generator(transport.clone(), temp.path());
            let ledger = Arc::new(FakeLedger::new(1, temp.path()));
            let generator = generator.with_ledger(ledger.clone());

            let err = generator.generate_image("a fox", "telegram:1").unwrap_err();
            assert!(matches!(err, EngineError::JobContract(_)), "{err:?}");
            assert_eq!(fs::read_dir(temp.path())?.count(), 0);
            assert!(ledger.debits.lock().unwrap().is_empty());
            assert_eq!(
                transport.requests()[2].max_body_bytes,
                Some(generator.config().max_download_bytes)
            );
        }
        Ok(())
    }

    #[test]
    fn content_type_names_the_artifact_when_bytes_are_unrecognized() {
        let response = bytes_response(200, Some("image/jpeg"), b"opaque", "https://cdn.example.com/a");
        assert_eq!(artifact_extension(&response), Some("jpg"));
        let response = bytes_response(200, Some("application/octet-stream"), b"opaque", "https://cdn.example.com/a");
        assert_eq!(artifact_extension(&response), None);
        let response = bytes_response(200, None, PNG_BYTES, "https://cdn.example.com/a");
        assert_eq!(artifact_extension(&response), Some("png"));
    }

    #[test]
    fn debit_failure_is_reported_after_save() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = Arc::new(ScriptedTransport::new(vec![
            create("job_1"),
            completed("job_1"),
            download(),
        ]));
        let (generator, _) = generator(transport, temp.path());
        let mut ledger = FakeLedger::new(1, temp.path());
        ledger.fail_debit = true;
        let generator = generator.with_ledger(Arc::new(ledger));

        let err = generator.generate_image("a fox", "telegram:1").unwrap_err();
        assert!(matches!(err, EngineError::Payment(_)));
        assert_eq!(fs::read_dir(temp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn artifact_names_do_not_collide() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = write_new_file(temp.path(), "png", PNG_BYTES)?;
        let second = write_new_file(temp.path(), "png", PNG_BYTES)?;
        assert_ne!(first, second);
        assert_eq!(fs::read_dir(temp.path())?.count(), 2);
        Ok(())
    }

    #[test]
    fn retry_delay_grows_by_multiplier() {
        assert_eq!(next_delay(Duration::from_secs(2), 1.5), Duration::from_secs(3));
        assert_eq!(next_delay(Duration::from_secs(2), f64::NAN), Duration::from_secs(2));
        assert_eq!(
            next_delay(Duration::from_secs(250), 2.0),
            Duration::from_secs_f64(MAX_RETRY_DELAY_SECONDS)
        );
    }
}
