//! relevod — the supervisor daemon.
//!
//! Loads the YAML configuration, binds every external and RPC socket (both
//! fatal on failure), launches one instance per app, and runs until SIGINT.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use relevo::app::App;
use relevo::config::{Config, ProxyMode};
use relevo::logfile::{RotatingFile, SharedWriter};
use relevo::ports::PortPool;
use relevo::{http_proxy, rpc, tcp_proxy};

#[derive(Parser)]
#[command(
    name = "relevod",
    version,
    about = "Graceful process supervisor and front proxy"
)]
struct Args {
    /// Directory containing relevo.yaml.
    #[arg(long, default_value = "/etc/relevo")]
    config: PathBuf,

    /// Log to stderr instead of the configured log file.
    #[arg(long)]
    stderr: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relevo=info"));
    if args.stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        let sink = RotatingFile::new(config.logger.log_file.clone(), &config.logger);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(SharedWriter::new(sink))
            .with_ansi(false)
            .init();
    }

    tracing::info!(
        config = %args.config.display(),
        apps = config.apps.len(),
        "starting relevod"
    );

    let pool = Arc::new(PortPool::new(config.port_range.from, config.port_range.to));

    let mut apps: HashMap<String, Arc<App>> = HashMap::new();
    for app_config in &config.apps {
        let name = app_config.name.clone();
        let external = app_config.external_addr();
        let mode = app_config.proxy;

        let listener = TcpListener::bind(&external)
            .await
            .with_context(|| format!("binding external socket {external} for app '{name}'"))?;

        let app = App::new(app_config.clone(), &config.logger, Arc::clone(&pool));
        tracing::info!(app = %name, addr = %external, ?mode, "external listener bound");

        Arc::clone(&app).spawn_tick();
        if let Err(e) = app.start_new_instance() {
            // Not fatal: the tick retries up to max_retries.
            tracing::error!(app = %name, error = %e, "initial start failed");
        }

        let proxied = Arc::clone(&app);
        match mode {
            ProxyMode::Http => {
                tokio::spawn(async move {
                    if let Err(e) = http_proxy::serve(proxied, listener).await {
                        tracing::error!(error = %e, "http proxy terminated");
                    }
                });
            }
            ProxyMode::Tcp => {
                tokio::spawn(async move {
                    if let Err(e) = tcp_proxy::serve(proxied, listener).await {
                        tracing::error!(error = %e, "tcp proxy terminated");
                    }
                });
            }
        }

        apps.insert(name, app);
    }

    let rpc_addr = format!("{}:{}", config.rpc.host, config.rpc.port);
    let rpc_listener = TcpListener::bind(&rpc_addr)
        .await
        .with_context(|| format!("binding rpc socket {rpc_addr}"))?;
    tracing::info!(addr = %rpc_addr, "rpc listener bound");
    tokio::spawn(rpc::serve(rpc_listener, Arc::new(apps)));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
