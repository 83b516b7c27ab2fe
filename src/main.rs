mod cli;
mod config;
mod error;
mod http;
mod process;
mod proxy;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use process::manager::ProcessManager;
use proxy::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = config::Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    info!(
        config_path = %cli.config.display(),
        models = config.models.len(),
        groups = config.groups.len(),
        "modelswapd starting"
    );

    let manager = Arc::new(ProcessManager::new(&config));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&manager)));

    for model_name in &config.preload {
        info!(model = %model_name, "preloading");
        if let Err(err) = manager.swap(model_name).await {
            warn!(model = %model_name, error = %err, "preload failed");
        }
    }

    let state = http::AppState {
        manager: Arc::clone(&manager),
        dispatcher,
    };
    let router = http::router(state);

    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(addr = %cli.listen, "listening");

    let server = axum::serve(listener, router);

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = server => {
                if let Err(err) = result {
                    warn!(error = %err, "http server exited with error");
                }
            }
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        server.await?;
    }

    info!("shutting down, draining backends");
    let shutdown = manager.shutdown_all();
    tokio::select! {
        _ = shutdown => {
            info!("shutdown complete");
        }
        _ = wait_for_second_signal() => {
            warn!("second signal received, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_second_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_second_signal() {
    std::future::pending::<()>().await
}
