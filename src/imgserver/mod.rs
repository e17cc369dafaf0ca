//! Processing node: upload ingestion, sandboxed processing, downloads.
//!
//! Each node registers itself with the manager at startup, stages uploads
//! on its local volume, launches one sandboxed worker per accepted upload
//! and serves downloads for the results it owns (redirecting callers to
//! the owner otherwise).
//!
//! # Components
//!
//! - [`upload::UploadSink`]: the ingestion state machine (sniff, stage,
//!   reject, abort)
//! - [`watcher::WatcherSet`]: fire-and-forget completion watchers
//! - [`service::ImageServiceImpl`]: the gRPC surface (`UploadImage`,
//!   `DownloadImage`)
//! - [`volume::Volume`]: node-local file layout
//! - [`ImgServerNode`]: process wiring (register, connect store, serve)

pub mod service;
pub mod upload;
pub mod volume;
pub mod watcher;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::ServerConfig;
use crate::error::{ImgflowError, Result};
use crate::proto::image_service_server::ImageServiceServer;
use crate::proto::registry_service_client::RegistryServiceClient;
use crate::proto::RegisterNodeRequest;
use crate::sandbox::DockerRunner;
use crate::store::RedisStore;

pub use service::ImageServiceImpl;
pub use volume::Volume;
pub use watcher::WatcherSet;

/// One processing node process.
pub struct ImgServerNode {
    config: ServerConfig,
}

impl ImgServerNode {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Register with the manager, connect to the metadata store and serve
    /// until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config;

        let volume = Volume::new(&config.volume_base);
        volume.ensure_dirs().await?;

        // Register with the manager; the reply carries the store port, the
        // store host is the manager's host.
        tracing::info!(manager = %config.manager_addr, "Registering with manager");
        let mut registry =
            RegistryServiceClient::connect(format!("http://{}", config.manager_addr)).await?;
        let reply = registry
            .register_node(RegisterNodeRequest {
                address: config.advertise_addr.clone(),
                port: config.port as u32,
            })
            .await?
            .into_inner();

        let store_host = config.manager_host().to_string();
        let store_port = u16::try_from(reply.store_port)
            .map_err(|_| ImgflowError::InvalidConfig("store port out of range".to_string()))?;
        tracing::info!(
            store = %format!("{}:{}", store_host, store_port),
            "Registered with manager"
        );

        let store = RedisStore::connect(&store_host, store_port).await?;

        let service = ImageServiceImpl::new(
            config.advertise_addr.clone(),
            config.port,
            volume.clone(),
            Arc::new(store),
            Arc::new(DockerRunner::new(config.sandbox.mount_point.clone())),
            Arc::new(WatcherSet::new()),
            config.sandbox.clone(),
        );

        let listen_addr: SocketAddr = format!("0.0.0.0:{}", config.port)
            .parse()
            .map_err(|e| ImgflowError::InvalidConfig(format!("listen address: {}", e)))?;

        tracing::info!(
            addr = %listen_addr,
            advertised = %format!("{}:{}", config.advertise_addr, config.port),
            volume = %volume.base().display(),
            "Starting processing node"
        );

        Server::builder()
            .add_service(ImageServiceServer::new(service))
            .serve_with_shutdown(listen_addr, shutdown.cancelled_owned())
            .await?;
        Ok(())
    }
}
