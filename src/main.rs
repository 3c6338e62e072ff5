use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use voicereel::audio::OutputFormat;
use voicereel::config::{Config, parse_duration};
use voicereel::events::EventBus;
use voicereel::script::{ProgressSettings, RenderRequest, ScriptOrchestrator, SpeakerMap};
use voicereel::tts::{BackendConfig, BackendKind, BackendPool, BackendRegistry};

#[derive(Parser)]
#[command(name = "voicereel", version, about = "Render multi-speaker scripts into one audio file")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true, env = "VOICEREEL_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render a script into a preview file
    Render(RenderArgs),
    /// Print the effective configuration
    Config,
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Script file (JSON or YAML list of {speaker, text} entries)
    script: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "out")]
    out: PathBuf,

    /// Synthesis backend (default-fast, voicevox, command, mock)
    #[arg(short, long)]
    backend: Option<String>,

    /// Backend model name
    #[arg(long)]
    model: Option<String>,

    /// Parallel synthesis workers
    #[arg(short = 'j', long, allow_negative_numbers = true)]
    workers: Option<i64>,

    /// Output format (mp4, mp3, wav)
    #[arg(short, long)]
    format: Option<String>,

    #[arg(long)]
    bitrate: Option<String>,

    /// Clip cache directory (defaults to <out>/cache)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Overall synthesis timeout, e.g. "90s" or "5m"
    #[arg(long)]
    timeout: Option<String>,

    /// Path to the ffmpeg binary
    #[arg(long, env = "VOICEREEL_FFMPEG")]
    ffmpeg: Option<PathBuf>,

    /// Map a script speaker to a backend voice (repeatable)
    #[arg(short, long = "speaker", value_name = "NAME=VOICE", value_parser = parse_speaker)]
    speakers: Vec<(String, String)>,
}

fn parse_speaker(s: &str) -> Result<(String, String), String> {
    let (name, voice) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VOICE, got '{s}'"))?;
    if name.trim().is_empty() || voice.trim().is_empty() {
        return Err(format!("expected NAME=VOICE, got '{s}'"));
    }
    Ok((name.trim().to_string(), voice.trim().to_string()))
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "voicereel=info".into());

    // stdout carries the render result, logs go to stderr
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Render(args) => render(config, args).await,
    }
}

async fn render(config: Config, args: RenderArgs) -> Result<()> {
    let fallback: BackendKind = config
        .pool
        .fallback_backend
        .parse()
        .context("invalid pool.fallback_backend")?;
    let registry = BackendRegistry::from_config(&config.backends);
    let pool = BackendPool::with_fallback(registry, config.pool.max_resident, fallback);

    let orchestrator = ScriptOrchestrator::new(pool.clone(), EventBus::global().clone())
        .with_progress(ProgressSettings::from(&config.progress))
        .with_ffmpeg_path(args.ffmpeg.or(config.encoder.ffmpeg_path.clone()));

    let mut req = RenderRequest::new(&args.script, &args.out);
    req.speaker_map = args.speakers.into_iter().collect::<SpeakerMap>();
    req.backend = args.backend.unwrap_or(config.render.backend.clone());
    if let Some(model) = args.model {
        req.backend_config = BackendConfig::with_model(model);
    }
    req.cache_dir = args.cache_dir;
    req.max_workers = args.workers.unwrap_or(config.render.max_workers);
    req.output_format = args
        .format
        .as_deref()
        .unwrap_or(&config.render.output_format)
        .parse::<OutputFormat>()?;
    req.bitrate = args.bitrate.unwrap_or(config.render.bitrate.clone());
    req.timeout = match args.timeout {
        Some(t) => Some(parse_duration(&t)?),
        None => config.timeout()?,
    };

    let cancel = req.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling render");
            cancel.cancel();
        }
    });

    let result = orchestrator.synthesize_script_preview(req).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let stats = pool.stats();
    info!(resident = stats.resident.len(), "shutting down backend pool");
    tokio::time::timeout(Duration::from_secs(10), pool.shutdown())
        .await
        .ok();

    if !result.ok {
        std::process::exit(if result.cancelled { 130 } else { 1 });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_pairs_parse() {
        assert_eq!(
            parse_speaker("Host=de_DE-thorsten").unwrap(),
            ("Host".to_string(), "de_DE-thorsten".to_string())
        );
        assert!(parse_speaker("Host").is_err());
        assert!(parse_speaker("=voice").is_err());
    }

    #[test]
    fn render_args_parse() {
        let cli = Cli::try_parse_from([
            "voicereel", "render", "show.yaml", "-o", "build", "-j", "-1", "-s", "A=1", "-s", "B=2",
        ])
        .unwrap();
        match cli.command {
            Command::Render(args) => {
                assert_eq!(args.workers, Some(-1));
                assert_eq!(args.speakers.len(), 2);
                assert_eq!(args.out, PathBuf::from("build"));
            }
            Command::Config => panic!("expected render"),
        }
    }
}
