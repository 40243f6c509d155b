//! rollguardd — the rollguard daemon.
//!
//! Single binary that assembles the rollguard subsystems:
//! - Flag store (redb)
//! - Probe monitors for configured targets
//! - Health evaluator + rollback controller
//! - Deploy gate REST API
//!
//! It also carries thin client subcommands for pipelines and operators.
//!
//! # Usage
//!
//! ```text
//! rollguardd serve --config rollguard.toml --data-dir /var/lib/rollguard --port 7878
//! rollguardd authorize --server 127.0.0.1:7878 --target api   # exit 3 when blocked
//! rollguardd deployed --server 127.0.0.1:7878 --target api --version v42
//! rollguardd clear-cooldown --server 127.0.0.1:7878
//! rollguardd flag --server 127.0.0.1:7878 --key deployment_cooldown_state
//! ```

mod client;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use http::{Method, StatusCode};
use tracing::{error, info, warn};

use rollguard_core::GuardConfig;
use rollguard_health::{ProbeMonitor, ProbeSink, ProbeSpec};
use rollguard_rollout::Guard;
use rollguard_state::StateStore;

/// Exit code for a blocked `authorize`.
const EXIT_BLOCKED: i32 = 3;

#[derive(Parser)]
#[command(name = "rollguardd", about = "rollguard daemon — health-gated deploys and automatic rollback")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: probes, rollback control, and the API.
    Serve {
        /// Path to rollguard.toml; defaults apply when it is missing.
        #[arg(long, default_value = "rollguard.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/rollguard")]
        data_dir: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "7878")]
        port: u16,
    },

    /// Ask whether a target may be deployed (exit 0 allowed, 3 blocked).
    Authorize {
        #[arg(long, default_value = "127.0.0.1:7878")]
        server: String,

        #[arg(long)]
        target: String,
    },

    /// Manually end the active cooldown.
    ClearCooldown {
        #[arg(long, default_value = "127.0.0.1:7878")]
        server: String,
    },

    /// Report that a version is now live on a target.
    Deployed {
        #[arg(long, default_value = "127.0.0.1:7878")]
        server: String,

        #[arg(long)]
        target: String,

        #[arg(long)]
        version: String,
    },

    /// Print the raw flag stored under a key.
    Flag {
        #[arg(long, default_value = "127.0.0.1:7878")]
        server: String,

        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            data_dir,
            port,
        } => run_serve(config, data_dir, port).await,
        Command::Authorize { server, target } => {
            let reply = client::request(
                &server,
                Method::GET,
                &format!("/api/v1/targets/{target}/authorize"),
                None,
            )
            .await?;
            print_json(reply.payload())?;
            match reply.status {
                StatusCode::OK => Ok(()),
                StatusCode::LOCKED => std::process::exit(EXIT_BLOCKED),
                status => anyhow::bail!("authorize failed with {status}"),
            }
        }
        Command::ClearCooldown { server } => {
            let reply =
                client::request(&server, Method::POST, "/api/v1/cooldown/clear", None).await?;
            finish(reply)
        }
        Command::Deployed {
            server,
            target,
            version,
        } => {
            let reply = client::request(
                &server,
                Method::POST,
                &format!("/api/v1/targets/{target}/deployments"),
                Some(serde_json::json!({ "version": version })),
            )
            .await?;
            finish(reply)
        }
        Command::Flag { server, key } => {
            let reply =
                client::request(&server, Method::GET, &format!("/api/v1/flags/{key}"), None)
                    .await?;
            finish(reply)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,rollguardd=debug,rollguard=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn finish(reply: client::ApiReply) -> anyhow::Result<()> {
    print_json(reply.payload())?;
    if reply.status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("request failed with {}", reply.status)
    }
}

async fn run_serve(config_path: PathBuf, data_dir: PathBuf, port: u16) -> anyhow::Result<()> {
    info!("rollguard daemon starting");

    let config = GuardConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        targets = config.targets.len(),
        revert = config.revert.is_some(),
        "configuration loaded"
    );
    if config.revert.is_none() {
        warn!("no [revert] configured, failed targets will block deploys without reverting");
    }

    // ── Initialize subsystems ──────────────────────────────────

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("rollguard.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let guard = Arc::new(Guard::from_config(store, &config)?);

    let monitor = ProbeMonitor::new(probe_sink(guard.clone()));
    for target in &config.targets {
        monitor.start_monitor(ProbeSpec::try_from(target)?).await;
    }

    // ── Start API server ───────────────────────────────────────

    let router = rollguard_api::build_router(guard);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;

    monitor.stop_all().await;
    info!("rollguard daemon stopped");
    Ok(())
}

/// Feed every probe result into the guard.
///
/// Errors are logged; the next tick probes again.
fn probe_sink(guard: Arc<Guard>) -> ProbeSink {
    Arc::new(move |result| {
        let guard = guard.clone();
        Box::pin(async move {
            if let Err(e) = guard.record(&result).await {
                error!(target = %result.target, error = %e, retryable = e.is_retryable(), "failed to record probe");
            }
        })
    })
}
