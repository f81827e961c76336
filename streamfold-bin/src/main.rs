use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use streamfold_core::{
    config::Config,
    driver::StreamDriver,
    http_client::{HttpClient, HttpTransport},
    provider_factory::ProviderRegistry,
    transport::{MemoryTransport, Transport},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "streamfold: decode and merge LLM SSE streams",
    long_about = None
)]
struct Cli {
    /// JSON or TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a captured SSE body from disk (prints deltas live)
    Replay {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        file: PathBuf,
        /// Feed the body in chunks of this many bytes
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
    },
    /// POST a request body to a streaming endpoint (prints deltas live)
    Stream {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        url: String,
        /// Request JSON, or @path to read it from a file
        #[arg(long)]
        body: String,
        /// Environment variable holding the bearer token
        #[arg(long)]
        bearer_env: Option<String>,
        /// Extra header as name:value (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,
    },
    /// List built-in provider names
    Providers,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::from_path(p).with_context(|| format!("loading config {}", p.display())),
        None => Ok(Config::default()),
    }
}

fn read_body(arg: &str) -> anyhow::Result<serde_json::Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("request body is not valid JSON")
}

async fn run(driver: StreamDriver, transport: &dyn Transport) -> anyhow::Result<()> {
    let token = driver.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let msg = driver
        .run_with(
            transport,
            |delta| {
                if let Some(text) = &delta.content_fragment {
                    print!("{text}");
                    io::stdout().flush().ok();
                }
            },
            |_| println!(),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&msg)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay { provider, file, chunk_size } => {
            let reg = ProviderRegistry::from_config(&cfg)?;
            let driver = StreamDriver::from_registry(&reg, &provider, cfg.stream.clone())?;
            let body = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let transport = MemoryTransport::replay(provider, body, chunk_size.max(1));
            run(driver, &transport).await?;
        }
        Commands::Stream { provider, url, body, bearer_env, headers } => {
            let reg = ProviderRegistry::from_config(&cfg)?;
            let driver = StreamDriver::from_registry(&reg, &provider, cfg.stream.clone())?;
            let client = HttpClient::from_cfg(&cfg.http)?;
            let mut transport = HttpTransport::new(client, provider, url, read_body(&body)?);
            for h in headers {
                let (name, value) = h
                    .split_once(':')
                    .with_context(|| format!("header '{h}' is not name:value"))?;
                transport = transport.header(name.trim(), value.trim());
            }
            if let Some(var) = bearer_env {
                let token = std::env::var(&var).with_context(|| format!("{var} is not set"))?;
                transport = transport.bearer(SecretString::from(token));
            }
            run(driver, &transport).await?;
        }
        Commands::Providers => {
            let reg = ProviderRegistry::from_config(&cfg)?;
            for name in reg.names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}
