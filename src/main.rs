use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use thumbd::config::Config;
use thumbd::AppState;

/// On-demand image derivative server.
#[derive(Parser, Debug)]
#[command(name = "thumbd", version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    init_tracing(&config)?;

    let address = config.server_address.clone();
    let app = thumbd::router(AppState::new(config));

    if let Some(socket_path) = address.strip_prefix("unix:") {
        let socket_path = PathBuf::from(socket_path);
        // a previous run may have left the socket file behind
        let _ = tokio::fs::remove_file(&socket_path).await;
        let listener = tokio::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        tracing::info!(socket = %socket_path.display(), "listening on unix socket");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        let _ = std::fs::remove_file(&socket_path);
    } else {
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        tracing::info!(%address, "listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    Ok(())
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "thumbd=info,tower_http=info".into());
    match &config.log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining");
}
