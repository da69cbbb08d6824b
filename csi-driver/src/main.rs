//! iSCSI CSI Driver
//!
//! Serves the CSI Identity service plus the Controller and/or Node services
//! on a unix socket or TCP address.

use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use iscsi_csi::csi::controller_server::ControllerServer;
use iscsi_csi::csi::identity_server::IdentityServer;
use iscsi_csi::csi::node_server::NodeServer;
use iscsi_csi::iscsi::{ConnectorStore, IscsiAdm, VolumeAttacher};
use iscsi_csi::platform::{CommandRunner, LinuxMounter, SystemRunner};
use iscsi_csi::{
    ApiClient, CliArgs, ControllerService, CsiEndpoint, DRIVER_VERSION, IdentityService,
    NodeService, metrics,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // RUST_LOG takes precedence over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(args.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.into_config()?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(addr) = config.metrics_addr
        && let Err(e) = metrics::init_metrics(addr)
    {
        return Err(format!("Failed to initialize metrics: {}", e).into());
    }

    info!(
        driver_name = %config.driver_name,
        version = DRIVER_VERSION,
        endpoint = %config.endpoint,
        node_id = %config.node_id,
        controller_mode = config.controller,
        node_mode = config.node,
        "Starting iSCSI CSI Driver"
    );

    let controller = match (&config.api, config.controller) {
        (Some(api), true) => {
            let client = ApiClient::new(api)?;
            info!(api_url = %client.base_url(), initiator_name = %config.initiator_name, "Controller service enabled");
            Some(ControllerServer::new(ControllerService::new(
                client,
                config.initiator_name.clone(),
            )))
        }
        _ => None,
    };

    let node = if config.node {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let sessions = IscsiAdm::new(runner.clone()).with_wait_policy(config.device_wait);
        let attacher = VolumeAttacher::new(
            Arc::new(sessions),
            Arc::new(LinuxMounter::new(runner)),
            ConnectorStore::new(&config.run_dir),
        );
        info!(run_dir = %config.run_dir.display(), "Node service enabled");
        Some(NodeServer::new(NodeService::new(
            config.node_id.clone(),
            Arc::new(attacher),
        )))
    } else {
        None
    };

    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityService::new(
            config.driver_name.clone(),
        )))
        .add_optional_service(controller)
        .add_optional_service(node);

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    match &config.endpoint {
        CsiEndpoint::Unix(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Remove a socket left behind by a previous run
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let listener = UnixListener::bind(path)?;
            info!("gRPC server listening on {}", config.endpoint);
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await?;
            if let Err(e) = std::fs::remove_file(path) {
                error!("Failed to remove socket {}: {}", path.display(), e);
            }
        }
        CsiEndpoint::Tcp(addr) => {
            info!("gRPC server listening on {}", config.endpoint);
            router.serve_with_shutdown(*addr, shutdown).await?;
        }
    }

    info!("iSCSI CSI driver shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use signal::unix::{Signal, SignalKind, signal};

    async fn recv_or_pending(sig: Option<Signal>) {
        match sig {
            Some(mut s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    // Install signal handlers, logging errors but continuing with available handlers
    let sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    tokio::select! {
        _ = recv_or_pending(sigterm) => info!("Received SIGTERM"),
        _ = recv_or_pending(sigint) => info!("Received SIGINT"),
    }
}
