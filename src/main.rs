use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dhcpwarden::{Config, DhcpServer};

#[derive(Parser)]
#[command(name = "dhcpwarden")]
#[command(author, version, about = "A multi-subnet DHCPv4 server with a security gate", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "dhcpwarden.json")]
    config: PathBuf,

    /// Run detached from the controlling terminal (delegated to the
    /// process supervisor; accepted for service-file compatibility)
    #[arg(long)]
    daemon: bool,

    /// Write the server PID to this file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_target = cli.log_file.clone();
    match log_target {
        Some(path) => {
            let file = match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => file,
                Err(io_error) => {
                    eprintln!("cannot open log file {}: {}", path.display(), io_error);
                    return ExitCode::from(1);
                }
            };
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    if cli.daemon {
        info!("--daemon requested; expecting a process supervisor to detach us");
    }

    if let Some(ref pid_file) = cli.pid_file
        && let Err(io_error) = std::fs::write(pid_file, format!("{}\n", std::process::id()))
    {
        error!("Cannot write pid file {}: {}", pid_file.display(), io_error);
        return ExitCode::from(1);
    }

    match serve(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            error!("{}", fatal);
            ExitCode::from(1)
        }
    }
}

async fn serve(cli: &Cli) -> dhcpwarden::Result<()> {
    let config = Config::load(&cli.config).await?;
    info!("Loaded configuration from {}", cli.config.display());

    let server = Arc::new(DhcpServer::new(config).await?);

    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                server.stop();
            }
        });
    }

    server.run().await
}
