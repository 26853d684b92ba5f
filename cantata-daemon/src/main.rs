// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The daemon binary: open the store, listen on the Unix socket, serve
//! each connection on its own task.

use std::path::PathBuf;
use std::process::ExitCode;

use tokio::net::UnixListener;
use tracing::{error, info};

use cantata_daemon::handler::LocalStoreHandler;
use cantata_daemon::{DaemonConfig, LocalStore};

const DAEMON_VERSION: &str = concat!("cantata-daemon ", env!("CARGO_PKG_VERSION"));

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_file = std::env::args().nth(1).map(PathBuf::from);
    let config = match DaemonConfig::load(config_file.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {err}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("daemon failed: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = config.socket_path.clone();
    let store_dir = config.store_dir.clone();
    let store = LocalStore::open(config)?;
    let handler = LocalStoreHandler::new(store, true);

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))?;
    }
    info!(socket = %socket_path.display(), "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let handler = handler.clone();
                let store_dir = store_dir.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(err) = cantata_store_remote::server::handle_connection(
                        reader,
                        writer,
                        store_dir,
                        DAEMON_VERSION,
                        &handler,
                    )
                    .await
                    {
                        error!("connection error: {err}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }
    Ok(())
}
