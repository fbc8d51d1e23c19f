//! CLI for the relevo supervisor daemon.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use relevo_proto::{AppReport, Request, Response, DEFAULT_RPC_HOST, DEFAULT_RPC_PORT};
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(name = "relevoctl", version, about = "Manage the relevod supervisor")]
struct Cli {
    /// Daemon RPC host.
    #[arg(long, global = true, default_value = DEFAULT_RPC_HOST)]
    host: String,

    /// Daemon RPC port.
    #[arg(long, global = true, default_value_t = DEFAULT_RPC_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Display application status.
    Status {
        /// Application name; omit for all applications.
        app: Option<String>,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Start a new application instance.
    Start {
        /// Application name.
        app: String,
    },
    /// Restart an application (synonym for start: the fresh instance is
    /// swapped in once healthy).
    Restart {
        /// Application name.
        app: String,
    },
    /// Gracefully stop running instances.
    Stop {
        /// Application name.
        app: String,
    },
    /// Kill running instances immediately.
    Kill {
        /// Application name.
        app: String,
    },
    /// Generate shell completion scripts.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for the status command.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("relevoctl: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match &self.command {
            Command::Completion { shell } => {
                clap_complete::generate(
                    *shell,
                    &mut Self::command(),
                    "relevoctl",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
            Command::Status { app, format } => {
                let request = Request::Status {
                    app: app.clone().unwrap_or_default(),
                };
                match self.call(request).await? {
                    Response::Status(apps) => print_status(&apps, *format),
                    Response::Error(message) => bail!(message),
                    Response::Ok => Ok(()),
                }
            }
            Command::Start { app } => self.expect_ok(Request::Start { app: app.clone() }).await,
            Command::Restart { app } => {
                self.expect_ok(Request::Restart { app: app.clone() }).await
            }
            Command::Stop { app } => self.expect_ok(Request::Stop { app: app.clone() }).await,
            Command::Kill { app } => self.expect_ok(Request::Kill { app: app.clone() }).await,
        }
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("connecting to {}:{}", self.host, self.port))?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        relevo_proto::send(&mut writer, &request).await?;
        Ok(relevo_proto::recv(&mut reader).await?)
    }

    async fn expect_ok(&self, request: Request) -> Result<()> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            Response::Error(message) => bail!(message),
            Response::Status(_) => bail!("unexpected status reply"),
        }
    }
}

fn print_status(apps: &[AppReport], format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(apps)?);
        return Ok(());
    }

    for app in apps {
        println!("[{}/{}:{}]", app.name, app.external_host, app.external_port);
        for instance in &app.instances {
            let marker = if instance.active { "*" } else { " " };
            let target = format!("{}/{}:{}", instance.id, instance.host, instance.port);
            let since = format!("{}s", instance.since_change_secs);
            let error = instance.error.as_deref().unwrap_or("");
            println!(
                " {marker} {target:<28} {:<10} {since:>8}  {error}",
                instance.status
            );
        }
    }
    Ok(())
}
