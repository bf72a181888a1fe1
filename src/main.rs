//! filedrop server binary.
//!
//! Accepts multipart uploads from allowlisted client addresses, stores them
//! under collision-free names and serves them back under `/f/`.

mod access;
mod config;
mod error;
mod etag;
mod files;
mod http;
mod logging;
mod routes;
mod storage;
#[cfg(test)]
mod test_support;
mod upload;

use axum::http::HeaderName;
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::access::AccessPolicy;
use crate::config::Args;
use crate::routes::{RouterSettings, build_router};
use crate::storage::Storage;

shadow!(build);

/// Starts the filedrop server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;

    let proxy_header = HeaderName::from_bytes(args.proxy_header.as_bytes())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let access = Arc::new(AccessPolicy::new(
        PathBuf::from(&args.config_file),
        proxy_header,
    ));

    let app = build_router(RouterSettings {
        storage,
        access,
        upload_max_size: args.upload_max_size,
        cors_origins: args.cors_origins.clone(),
    });

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        storage_dir = args.storage_dir,
        config_file = args.config_file,
        "Starting HTTP server at {}",
        http_addr
    );

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = http_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
