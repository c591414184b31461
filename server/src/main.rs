mod routes;
mod source;
mod stream;

use camstream_common::assembler::FrameAssembler;
use camstream_common::config::{Config, ConfigError};
use routes::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("HTTP server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() {
    let (config_path, config) = load_config();
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        addr = config.bind_addr(),
        source = ?config.camera.source,
        resolution = config.camera.resolution,
        framerate = config.camera.framerate,
        static_dir = %config.server.static_dir.display(),
        "starting camstream server"
    );

    let assembler = Arc::new(FrameAssembler::new());

    tokio::spawn(source::run_source(
        config.camera.clone(),
        Arc::clone(&assembler),
    ));

    let state = Arc::new(AppState::new(assembler, config.server.static_dir.clone()));
    let addr = config.bind_addr();

    tokio::select! {
        result = run(&addr, state) => {
            if let Err(e) = result {
                error!(error = %e, "server stopped");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping");
        }
    }
}

/// Config path comes from the first argument. Without one, `config.toml` is
/// used if present and built-in defaults otherwise.
fn load_config() -> (PathBuf, Result<Config, ConfigError>) {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path);
            (path, config)
        }
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                let config = Config::load(&path);
                (path, config)
            } else {
                (path, Ok(Config::default()))
            }
        }
    }
}

async fn run(addr: &str, state: Arc<AppState>) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(addr.to_string(), e))?;
    info!(addr, "HTTP server listening");
    routes::serve(listener, state).await.map_err(ServerError::Serve)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
