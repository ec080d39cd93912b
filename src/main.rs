use clap::Parser;
use ptyrelay::bridge::ProcessBridge;
use ptyrelay::config::{self, Cli, Command};
use ptyrelay::error::{ApiError, ErrorCode, RelayResult};
use ptyrelay::server::{self, Coordinator};
use ptyrelay::session::SessionRegistry;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Config(args) => print_config(args)?,
    }
    Ok(())
}

async fn run_server(args: config::ServeArgs) -> RelayResult<()> {
    let config = config::Config::load(&args)?;
    init_logging(&config.logging);
    tracing::info!(version = ptyrelay::version::VERSION, "Starting ptyrelay");

    let bridge = Arc::new(ProcessBridge::new(&config.exec)?);
    tracing::info!(cwd = %bridge.current_dir_display(), "Process bridge ready");
    let registry = SessionRegistry::new(config.session.clone());
    registry.start_sweeper();

    let coordinator = Coordinator::new(bridge, registry, config.pty.clone());
    server::serve(coordinator, &config.server, shutdown_signal()).await
}

fn print_config(args: config::ServeArgs) -> RelayResult<()> {
    let config = config::Config::load(&args)?;
    let rendered = toml::to_string_pretty(&config).map_err(|err| {
        ApiError::new(ErrorCode::InvalidArgument, "Failed to render config")
            .with_details(err.to_string())
    })?;
    print!("{rendered}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
