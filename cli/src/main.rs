use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use capgrpc_core::config::Config;
use capgrpc_core::{logging, MockGrpcServer};

const EXAMPLE_CONFIG: &str = r#"servers:
  - alias: "Book API"
    sockets:
      - socket: "0.0.0.0:8100"
    reflection_enabled: true
    proto_files: "protos/book.proto"
    mocks:
      book.BookService:
        GetBook:
          messages:
            id: "{{ request.id }}"
            title: "Example Book"
          seconds_delay: 0
        ListBooks:
          proxy:
            socket: "upstream:9000"
            seconds_timeout: 5
general_logging_config:
  console: true
  level: INFO
  format: text
  format_line: "%(levelname)s: %(message)s"
api_logging_config:
  console: true
  level: INFO
  format: yaml
"#;

/// gRPC API mocking tool.
#[derive(Parser, Debug)]
#[command(name = "cap-grpc", about = "gRPC API mocking tool")]
struct Cli {
    /// Configuration .yml file path.
    #[arg(short = 'c', default_value = "cap-grpc.yml", value_name = "config")]
    config: PathBuf,

    /// Print an example configuration file to stdout and exit.
    #[arg(short = 'e', default_value_t = false)]
    example: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.example {
        print!("{EXAMPLE_CONFIG}");
        return ExitCode::SUCCESS;
    }

    let raw = match std::fs::read_to_string(&cli.config) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("Failed to read configuration file '{}': {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::from_yaml(&raw) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let config_file_dir = cli
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    if let Err(e) = run_servers(config, &config_file_dir).await {
        tracing::error!(error = %e, "fatal error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_servers(config: Config, config_file_dir: &Path) -> capgrpc_core::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut handles = Vec::with_capacity(config.servers.len());
    let mut proxy_caches = Vec::with_capacity(config.servers.len());
    for server_config in config.servers {
        let built = MockGrpcServer::build(&server_config, config_file_dir).await?;
        proxy_caches.push(built.proxy_cache());

        let alias = server_config.alias.clone();
        let sockets = server_config.sockets.clone();
        let config_file_dir = config_file_dir.to_path_buf();
        let shutdown_rx = shutdown_rx.clone();

        let sockets_str = sockets
            .iter()
            .map(|s| s.socket.clone())
            .collect::<Vec<_>>()
            .join(", ");

        handles.push(tokio::spawn(async move {
            tracing::info!(alias = %alias, sockets = %sockets_str, "starting gRPC server");
            let result = built.serve(sockets, &config_file_dir, shutdown_rx).await;
            tracing::info!(alias = %alias, sockets = %sockets_str, "stopped gRPC server");
            result
        }));
    }
    tracing::info!("all servers started");

    let handles_fut = futures_join_all(handles);
    tokio::pin!(handles_fut);

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping all servers");
        }
        results = &mut handles_fut => {
            for outcome in results {
                propagate(outcome)?;
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    for outcome in handles_fut.await {
        propagate(outcome)?;
    }
    tracing::info!("all servers stopped");

    for proxy_cache in &proxy_caches {
        proxy_cache.close_channels();
    }
    Ok(())
}

fn propagate(
    outcome: Result<capgrpc_core::Result<()>, tokio::task::JoinError>,
) -> capgrpc_core::Result<()> {
    match outcome {
        Ok(result) => result,
        Err(join_err) => Err(capgrpc_core::MockServerError::Transport(join_err.to_string())),
    }
}

async fn futures_join_all(
    handles: Vec<tokio::task::JoinHandle<capgrpc_core::Result<()>>>,
) -> Vec<Result<capgrpc_core::Result<()>, tokio::task::JoinError>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await);
    }
    results
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
