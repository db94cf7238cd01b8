use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use scoreflow_core::{ConfigError, Executor, PipelineConfig};
use scoreflow_io::{FileFormat, FileSink, FileSource, GeneratorSource, UpsertSink};
use scoreflow_ops::NonSpammerTeamScore;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "scoreflow", version, about = "Windowed team scores with spam filtering", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline from a pipeline.toml
    Run {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Validate a pipeline.toml without running it
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            info!("serving /metrics on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run { config, http_port } => {
            if http_port != 0 {
                let addr = SocketAddr::from(([127, 0, 0, 1], http_port));
                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!("serving /metrics on {}", addr);
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app()).await;
                });
            }
            run_pipeline(&config).await
        }
        Commands::Check { config } => {
            let cfg = load_config(&config).await?;
            let engine = cfg.engine()?;
            println!(
                "{}: ok (window {}s, lateness {}s, score weight {}, source {}, sink {})",
                config.display(),
                engine.window_size.num_seconds(),
                engine.allowed_lateness.num_seconds(),
                engine.score_weight,
                cfg.source.kind,
                cfg.sink.kind
            );
            Ok(())
        }
    }
}

async fn metrics() -> String {
    scoreflow_core::metrics::render_prometheus()
}

async fn load_config(path: &Path) -> anyhow::Result<PipelineConfig> {
    let text = tokio::fs::read_to_string(path).await?;
    let cfg = PipelineConfig::from_toml_str(&text)?;
    cfg.validate()?;
    Ok(cfg)
}

async fn run_pipeline(path: &Path) -> anyhow::Result<()> {
    let cfg = load_config(path).await?;
    let engine = cfg.engine()?;
    info!(
        window = %engine.window_size,
        lateness = %engine.allowed_lateness,
        score_weight = engine.score_weight,
        streaming = engine.streaming,
        "starting pipeline"
    );

    let mut exec = Executor::new();
    match cfg.source.kind.as_str() {
        "file" => {
            let file = cfg
                .source
                .path
                .clone()
                .ok_or(ConfigError::Missing("source.path must be set for a file source"))?;
            exec.source(FileSource::new(file, FileFormat::parse(&cfg.source.format)?));
        }
        "generator" => {
            exec.source(GeneratorSource::from_config(&cfg.generator, chrono::Utc::now())?);
        }
        other => {
            return Err(ConfigError::Unsupported {
                what: "source",
                kind: other.to_string(),
            }
            .into())
        }
    }
    match cfg.sink.kind.as_str() {
        "stdout" => {
            exec.sink(FileSink::stdout());
        }
        "file" => {
            let out = cfg
                .sink
                .path
                .clone()
                .ok_or(ConfigError::Missing("sink.path must be set for a file sink"))?;
            exec.sink(FileSink::file(out));
        }
        "table" => {
            exec.sink(UpsertSink::new().printing());
        }
        other => {
            return Err(ConfigError::Unsupported {
                what: "sink",
                kind: other.to_string(),
            }
            .into())
        }
    }
    if let (true, Some(every)) = (engine.streaming, engine.early_firing) {
        exec.tick_every(every.to_std()?);
    }
    exec.operator(NonSpammerTeamScore::new(engine)?);
    exec.run().await?;
    info!("pipeline finished");
    Ok(())
}
