use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sociclaw_contracts::events::EventWriter;
use sociclaw_contracts::images::parse_data_url;
use sociclaw_contracts::validators::{redact_secret, upstream_user_id, validate_provider_user_id};
use sociclaw_engine::transport::HttpTransport;
use sociclaw_engine::{
    ClientConfig, GeneratorConfig, ImageGenerator, ImageInputResolver, JobClient, ReqwestTransport,
    RetryTransport,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const PROMPT_PREVIEW_MAX_CHARS: usize = 120;
const LOGO_DIRECTIVE: &str = "Use the attached logo image as the primary brand reference. \
Integrate the logo naturally, keep it recognizable, and keep visual hierarchy clean like an art director.";

#[derive(Debug, Parser)]
#[command(name = "sociclaw-rs", version, about = "SociClaw image job client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    GenerateImage(GenerateImageArgs),
    ResolveImage(ResolveImageArgs),
}

#[derive(Debug, Parser)]
struct GenerateImageArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    provider_user_id: String,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    /// Brand logo reference: local path, file:// URI, https URL or data URL.
    #[arg(long)]
    image_url: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Overrides SOCICLAW_IMAGE_API_KEY.
    #[arg(long)]
    api_key: Option<String>,
    /// Overrides SOCICLAW_IMAGE_API_BASE_URL.
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Parser)]
struct ResolveImageArgs {
    #[arg(long)]
    input: String,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sociclaw-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::GenerateImage(args) => run_generate_image(args),
        Command::ResolveImage(args) => run_resolve_image(args),
    }
}

fn run_generate_image(args: GenerateImageArgs) -> Result<i32> {
    let user_id = upstream_user_id(&args.provider, &args.provider_user_id)
        .context("invalid provider identity")?;

    let mut client_config = ClientConfig::from_env();
    if let Some(api_key) = args.api_key.as_deref().filter(|key| !key.trim().is_empty()) {
        client_config = client_config.with_api_key(api_key.trim());
    }
    if let Some(base_url) = args.api_base_url.as_deref() {
        client_config = client_config.with_base_url(base_url);
    }

    let mut generator_config = GeneratorConfig::from_env();
    if let Some(model) = args.model.as_deref().map(str::trim).filter(|model| !model.is_empty()) {
        generator_config.model = model.to_string();
    }
    if let Some(image_url) = args.image_url.as_deref().map(str::trim).filter(|url| !url.is_empty()) {
        generator_config.image_reference = Some(image_url.to_string());
    }
    if let Some(output_dir) = args.output_dir.clone() {
        generator_config.output_dir = output_dir;
    }
    let has_image = generator_config.image_reference.is_some();

    if model_requires_image(&generator_config.model) && !has_image && !args.dry_run {
        bail!(
            "Model {} requires an input image. Set --image-url or SOCICLAW_IMAGE_URL.",
            generator_config.model
        );
    }

    if args.dry_run {
        let preview = dry_run_preview(&args, &client_config, &generator_config)?;
        println!("{}", serde_json::to_string_pretty(&preview)?);
        return Ok(0);
    }

    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new());
    let client = JobClient::new(&client_config, transport)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| generator_config.output_dir.join("events.jsonl"));
    let run_id = Uuid::new_v4().to_string();
    info!(run_id = %run_id, events = %events_path.display(), "starting image generation");
    let generator = ImageGenerator::new(generator_config, client)?
        .with_events(EventWriter::new(events_path, run_id));

    let prompt = logo_directed_prompt(&args.prompt, has_image);
    let result = generator.generate_image(&prompt, &user_id)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn run_resolve_image(args: ResolveImageArgs) -> Result<i32> {
    let config = ClientConfig::from_env();
    let transport = RetryTransport::new(Arc::new(ReqwestTransport::new()));
    let resolver = ImageInputResolver::new(&config.resolver, transport);
    let report = resolution_report(resolver.resolve_data_url(&args.input).as_deref());
    let resolved = report["resolved"].as_bool().unwrap_or(false);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if resolved { 0 } else { 1 })
}

fn model_requires_image(model: &str) -> bool {
    model.to_ascii_lowercase().contains("nano-banana")
}

fn logo_directed_prompt(base_prompt: &str, has_logo_input: bool) -> String {
    if !has_logo_input {
        return base_prompt.to_string();
    }
    let text = base_prompt.trim();
    if text.is_empty() {
        return LOGO_DIRECTIVE.to_string();
    }
    format!("{text}. {LOGO_DIRECTIVE}")
}

fn dry_run_preview(
    args: &GenerateImageArgs,
    client_config: &ClientConfig,
    generator_config: &GeneratorConfig,
) -> Result<Value> {
    let provider_user_id = validate_provider_user_id(&args.provider_user_id)?;
    let has_api_key = !client_config.api_key.trim().is_empty();
    Ok(json!({
        "dry_run": true,
        "provider": args.provider.trim(),
        "provider_user_id": provider_user_id,
        "has_api_key": has_api_key,
        "api_key": has_api_key.then(|| redact_secret(&client_config.api_key)),
        "generate_url": client_config.generate_url,
        "model": generator_config.model,
        "has_image_url": generator_config.image_reference.is_some(),
        "output_dir": generator_config.output_dir.display().to_string(),
        "prompt_preview": args.prompt.chars().take(PROMPT_PREVIEW_MAX_CHARS).collect::<String>(),
    }))
}

/// Summary of a resolution attempt; never includes the encoded payload.
fn resolution_report(data_url: Option<&str>) -> Value {
    match data_url.and_then(parse_data_url) {
        Some(inline) => json!({
            "resolved": true,
            "content_type": inline.content_type,
            "bytes": inline.decoded_len(),
        }),
        None => json!({"resolved": false}),
    }
}
