//! chunkflow: streaming HTTP bodies and incremental JSON, from the command line.
//!
//! # Usage
//!
//! ```text
//! chunkflow serve --bind 127.0.0.1:8080 --interval 1s
//! chunkflow watch http://127.0.0.1:8080/events --limit 10
//! chunkflow init --path chunkflow.toml
//! ```

mod demo;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use chunkflow_body::Request;
use chunkflow_client::{BearerSigner, Client};
use chunkflow_core::{ChunkflowConfig, parse_duration};
use chunkflow_server::Server;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "chunkflow.toml";

#[derive(Parser)]
#[command(
    name = "chunkflow",
    about = "Streaming HTTP bodies and incremental JSON decoding",
    version,
    propagate_version = true
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the demo event server.
    Serve {
        /// Address to listen on (overrides server.bind).
        #[arg(long)]
        bind: Option<String>,

        /// Config file (default: ./chunkflow.toml when present).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Period of the /events stream, e.g. "1s" or "250ms".
        #[arg(long, default_value = "1s")]
        interval: String,
    },
    /// Print each JSON value of a streaming response as it arrives.
    Watch {
        url: String,

        /// Stop after this many values.
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Send `Authorization: Bearer <TOKEN>`.
        #[arg(long, value_name = "TOKEN")]
        bearer: Option<String>,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Write a config file with every default spelled out.
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        path: PathBuf,

        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Serve {
            bind,
            config,
            interval,
        } => serve(bind, config.as_deref(), &interval).await,
        Command::Watch {
            url,
            limit,
            bearer,
            config,
        } => watch_url(&url, limit, bearer.as_deref(), config.as_deref()).await,
        Command::Init { path, bind, force } => init(&path, &bind, force),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chunkflow=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load `path`, or `./chunkflow.toml` if it exists, or the defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<ChunkflowConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => return Ok(ChunkflowConfig::default()),
    };
    let config = ChunkflowConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!(path = %path.display(), "loaded config");
    Ok(config)
}

async fn serve(bind: Option<String>, config: Option<&Path>, interval: &str) -> anyhow::Result<()> {
    let mut config = load_config(config)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let interval = events_interval(interval)?;

    let routes = demo::routes(interval, config.decoder.separator);
    let server = Server::new(config.server, routes);
    let listener = server
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", server.config().bind))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.serve(listener, shutdown_rx).await
}

/// Period of the `/events` stream; it must be positive.
fn events_interval(value: &str) -> anyhow::Result<Duration> {
    let Some(interval) = parse_duration(value) else {
        bail!("invalid --interval {value:?}");
    };
    if interval.is_zero() {
        bail!("--interval must be greater than zero");
    }
    Ok(interval)
}

async fn watch_url(
    url: &str,
    limit: Option<usize>,
    bearer: Option<&str>,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let uri = url.parse().with_context(|| format!("invalid url {url:?}"))?;

    let mut client = Client::new(config.client).with_decoder(config.decoder);
    if let Some(token) = bearer {
        client = client.with_signer(BearerSigner::new(token)?);
    }

    let values = client.stream_json::<serde_json::Value>(Request::get(uri));
    let mut values = match limit {
        Some(n) => values.take(n).boxed(),
        None => values,
    };

    let mut seen = 0usize;
    loop {
        tokio::select! {
            next = values.next() => match next {
                Some(value) => {
                    println!("{}", value?);
                    seen += 1;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    drop(values);

    info!(values = seen, "watch finished");
    client.shutdown();
    Ok(())
}

fn init(path: &Path, bind: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = ChunkflowConfig::scaffold(bind);
    std::fs::write(path, config.to_toml_string()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "wrote config");
    Ok(())
}
