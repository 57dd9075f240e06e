use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::Config;
use mediarelay::engine::{ContentEngine, SpoolEngine};
use mediarelay::probe::FfprobeProber;
use mediarelay::registry::StreamRegistry;
use mediarelay::resolver::StreamResolver;
use mediarelay::signaling::{self, SignalingClient, SignalingConfig};
use mediarelay::transcode::TranscodeSettings;
use mediarelay::{create_app, AppState};
use serde::Deserialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Spool directory for swarm downloads (overrides config)
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct Settings {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    media: MediaConfig,
    #[serde(default)]
    streams: StreamsConfig,
    signaling: Option<SignalingConfig>,
}

#[derive(Debug, Deserialize)]
struct StreamsConfig {
    /// Streams nobody has touched for this long are dropped from the table.
    #[serde(default = "default_idle_timeout_secs")]
    idle_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    6 * 60 * 60
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MediaConfig {
    #[serde(default = "default_ffmpeg")]
    ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    ffprobe: String,
    #[serde(default = "default_downloads_dir")]
    downloads_dir: PathBuf,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_downloads_dir() -> PathBuf {
    std::env::temp_dir().join("mediarelay_streams")
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            downloads_dir: default_downloads_dir(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load configuration; every section has defaults so the file is optional.
    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;
    info!("Configuration loaded from {}: {:?}", args.config, settings);

    let downloads_dir = args
        .downloads_dir
        .unwrap_or_else(|| settings.media.downloads_dir.clone());
    tokio::fs::create_dir_all(&downloads_dir).await?;
    info!("Swarm spool directory: {}", downloads_dir.display());

    let registry = StreamRegistry::new();
    registry.spawn_eviction(
        std::time::Duration::from_secs(settings.streams.idle_timeout_secs),
        std::time::Duration::from_secs(60),
    );
    let engine: Arc<dyn ContentEngine> = SpoolEngine::new(&downloads_dir);
    let prober = Arc::new(FfprobeProber::new(settings.media.ffprobe.clone()));

    let (updates_tx, updates_rx) = tokio::sync::mpsc::unbounded_channel();
    match settings.signaling.clone() {
        Some(config) => {
            tokio::spawn(SignalingClient::new(config).run(updates_rx));
        }
        None => {
            tokio::spawn(signaling::drain(updates_rx));
        }
    }

    let resolver = StreamResolver::new(
        registry.clone(),
        engine.clone(),
        prober,
        updates_tx,
    );

    let app = create_app(Arc::new(AppState {
        registry,
        resolver,
        engine,
        transcode: TranscodeSettings {
            ffmpeg: settings.media.ffmpeg,
        },
    }));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
