// anoverif — anonymizing verification proxy
//
// Runs the mixing frontend in front of a verification backend, plus a stub
// backend and a small client for local testing.

mod api;
mod config;
mod stub_backend;

use anoverif_core::{HttpBackendClient, Mixer};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "anoverif")]
#[command(about = "Anoverif — anonymizing verification proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mixing frontend
    Serve(ServeArgs),
    /// Run a local stub verification backend
    StubBackend {
        #[arg(short, long, default_value = "9090")]
        port: u16,
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
    },
    /// Verify an identifier through a running frontend
    Verify {
        idval: String,
        #[arg(short, long, default_value = api::DEFAULT_SERVER)]
        server: String,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short, long)]
    bind: Option<String>,
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    min_delay_ms: Option<u64>,
    #[arg(long)]
    max_delay_ms: Option<u64>,
    #[arg(long)]
    batch_size: Option<usize>,
}

impl ServeArgs {
    fn apply(self, config: &mut config::Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(url) = self.backend_url {
            config.backend_url = url;
        }
        if let Some(ms) = self.min_delay_ms {
            config.mixer.min_delay_ms = ms;
        }
        if let Some(ms) = self.max_delay_ms {
            config.mixer.max_delay_ms = ms;
        }
        if let Some(size) = self.batch_size {
            config.mixer.batch_size = size;
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Write a default config file
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Commands::Serve(_) | Commands::StubBackend { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config_path = config::Config::resolve_path(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => cmd_serve(config_path, args).await,
        Commands::StubBackend { port, bind } => cmd_stub_backend(&bind, port).await,
        Commands::Verify { idval, server } => cmd_verify(&server, &idval).await,
        Commands::Config { action } => cmd_config(config_path, action),
    }
}

/// Resolves on Ctrl-C
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => {
            warn!("Failed to listen for Ctrl-C: {}", e);
            futures::future::pending::<()>().await;
        }
    }
}

async fn cmd_serve(config_path: PathBuf, args: ServeArgs) -> Result<()> {
    let mut config = config::Config::load_from(&config_path)?;
    config.apply_env()?;
    args.apply(&mut config);
    config.validate()?;

    let backend =
        HttpBackendClient::new(&config.backend_url).context("Invalid backend URL")?;
    let mixer = Arc::new(
        Mixer::start(config.mixer.clone(), Arc::new(backend))
            .context("Failed to start mixer")?,
    );

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    println!("{}", "Anoverif — Starting...".bold());
    println!();
    println!("  {} Listening on   {}", "✓".green(), addr.to_string().bright_cyan());
    println!("  {} Backend        {}", "✓".green(), config.backend_url.bright_cyan());
    println!(
        "  {} Mixing delay   {}–{} ms, batch {}",
        "✓".green(),
        config.mixer.min_delay_ms,
        config.mixer.max_delay_ms,
        config.mixer.batch_size
    );
    if config.mixer.hash_salt.is_empty() {
        println!(
            "  {} {}",
            "⚠".yellow(),
            "No hash salt configured (set ANON_HASH_SALT)".yellow()
        );
    }
    println!();

    let limits = api::ConnectionLimits {
        max_connections: config.max_connections,
        connection_timeout: config.connection_timeout(),
    };
    let state = Arc::new(api::FrontendState::new(mixer.clone()));
    api::run_frontend(listener, state, limits, shutdown_signal()).await?;

    mixer.shutdown().await;

    let stats = mixer.metrics().snapshot();
    info!(
        requests = stats.requests,
        successes = stats.successes,
        errors = stats.errors,
        timeouts = stats.timeouts,
        late_completions = stats.late_completions,
        cancelled = stats.cancelled,
        "final statistics"
    );
    println!("{} Stopped", "✓".green());

    Ok(())
}

async fn cmd_stub_backend(bind: &str, port: u16) -> Result<()> {
    let listener = std::net::TcpListener::bind((bind, port))
        .with_context(|| format!("Failed to bind {}:{}", bind, port))?;
    let backend = Arc::new(stub_backend::StubBackend::seeded());

    println!("{}", "Stub verification backend".bold());
    println!(
        "  {} Listening on {}:{}",
        "✓".green(),
        bind,
        port.to_string().bright_cyan()
    );
    println!("  {} {} valid identifiers seeded", "✓".green(), backend.valid_count());
    println!("  Known: {}", stub_backend::KNOWN_VALID.join(", ").dimmed());
    println!();

    stub_backend::run_stub_backend(listener, backend.clone(), shutdown_signal()).await?;

    let stats = backend.stats();
    info!(
        total = stats.total_requests,
        verified_true = stats.verified_true,
        verified_false = stats.verified_false,
        "stub backend stopped"
    );
    Ok(())
}

async fn cmd_verify(server: &str, idval: &str) -> Result<()> {
    let response = api::verify_via_api(server, idval).await?;

    match (response.success, response.result) {
        (true, Some(true)) => println!("{} Verified", "✓".green()),
        (true, _) => println!("{} Not verified", "✗".red()),
        (false, _) => {
            let error = response.error.unwrap_or_else(|| "Unknown error".to_string());
            println!("{} Request failed: {}", "✗".red(), error);
        }
    }
    Ok(())
}

fn cmd_config(config_path: PathBuf, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load_from(&config_path)?;
            config.set(&key, &value)?;
            config.save_to(&config_path)?;
            let shown = config.get(&key).unwrap_or(value);
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), shown);
        }
        ConfigAction::Get { key } => {
            let config = config::Config::load_from(&config_path)?;
            match config.get(&key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
        ConfigAction::List => {
            let config = config::Config::load_from(&config_path)?;
            println!("{}", "Configuration".bold());
            println!("  {}", config_path.display().to_string().dimmed());
            println!();
            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            config::Config::default().save_to(&config_path)?;
            println!(
                "{} Wrote default config to {}",
                "✓".green(),
                config_path.display().to_string().bright_cyan()
            );
        }
    }
    Ok(())
}
