//! chorusclaw - several AI bots sharing one chat channel
//!
//! Usage:
//!   chorusclaw                        → run the bots on the console channel
//!   chorusclaw --config bots.toml     → same, with an explicit config file
//!   chorusclaw check                  → validate config and list the bots
//!   chorusclaw version                → show version

use anyhow::Context;
use chorusclaw_core::GatewayConfig;
use chorusclaw_gateway::{serve, ChannelTransport, ConsoleTransport};
use chorusclaw_llm::AnthropicFactory;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "chorusclaw",
    about = "Multi-bot chat gateway: several AI bots in one shared channel",
    version = env!("CARGO_PKG_VERSION"),
    long_about = "chorusclaw runs one agent loop per configured bot over a shared message bus.\n\
                   Default: reads ~/.chorusclaw/chorusclaw.toml and chats on the console.\n\
                   Type a line to speak as the human; every bot sees it."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the gateway config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Write logs to a file (in addition to stderr)
    #[arg(long, global = true)]
    log_file: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway on the console channel (default)
    Run,
    /// Validate the config and print the configured bots
    Check,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("chorusclaw v{}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Check) => {
            let config = load_config(cli.config.as_deref())?;
            check(&config)?;
        }
        Some(Commands::Run) | None => {
            let _guard = init_tracing(cli.log_file.as_deref(), cli.json_logs)?;
            let config = load_config(cli.config.as_deref())?;
            run(config).await?;
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout belongs to the console channel.
fn init_tracing(log_file: Option<&str>, json: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_writer, guard) = match log_file {
        Some(path) => {
            let path = chorusclaw_core::expand_tilde(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            let name = path
                .file_name()
                .context("--log-file needs a file name")?
                .to_owned();
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorusclaw=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .with(file_writer.map(|w| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(w)
        }))
        .init();

    Ok(guard)
}

/// An explicit `--config` must exist; the default path falls back to an
/// empty config, which then fails validation with a clear message.
fn load_config(explicit: Option<&str>) -> anyhow::Result<GatewayConfig> {
    let path: PathBuf = match explicit {
        Some(p) => chorusclaw_core::expand_tilde(p),
        None => {
            let default = GatewayConfig::default_path();
            if !default.exists() {
                tracing::info!(path = %default.display(), "no config file, using defaults");
                return Ok(GatewayConfig::default());
            }
            default
        }
    };
    let config = GatewayConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    tracing::info!(path = %path.display(), bots = config.bots.len(), "config loaded");
    Ok(config)
}

fn check(config: &GatewayConfig) -> anyhow::Result<()> {
    let identities = config.identities().context("invalid bot configuration")?;
    println!("channel: {} (human: {})", config.channel.id, config.channel.human_name);
    println!("{:<16} {:<28} {:<10} persona", "bot", "model", "key");
    for identity in &identities {
        println!(
            "{:<16} {:<28} {:<10} {}",
            identity.name,
            identity.model,
            identity.masked_credential(),
            identity.persona_preview()
        );
    }
    println!("{} bot(s) ok", identities.len());
    Ok(())
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let transport: Arc<dyn ChannelTransport> = Arc::new(ConsoleTransport::stdio(
        config.channel.id.clone(),
        config.channel.human_name.clone(),
    ));
    let names: Vec<&str> = config.bots.iter().map(|b| b.name.as_str()).collect();
    eprintln!(
        "chorusclaw v{}: {} in #{} (Ctrl-C to quit)",
        env!("CARGO_PKG_VERSION"),
        names.join(", "),
        config.channel.id
    );

    serve(&config, transport, Arc::new(AnthropicFactory), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}
