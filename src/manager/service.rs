use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::config::ManagerConfig;
use crate::error::ImgflowError;
use crate::manager::registry::{NodeEndpoint, NodeRegistry};
use crate::proto::registry_service_server::{RegistryService, RegistryServiceServer};
use crate::proto::{
    AssignNodeRequest, AssignNodeResponse, RegisterNodeRequest, RegisterNodeResponse,
};

/// gRPC surface of the node registry.
pub struct RegistryServiceImpl {
    registry: Arc<RwLock<NodeRegistry>>,
    store_port: u16,
}

impl RegistryServiceImpl {
    pub fn new(registry: Arc<RwLock<NodeRegistry>>, store_port: u16) -> Self {
        Self {
            registry,
            store_port,
        }
    }
}

#[tonic::async_trait]
impl RegistryService for RegistryServiceImpl {
    async fn register_node(
        &self,
        request: Request<RegisterNodeRequest>,
    ) -> Result<Response<RegisterNodeResponse>, Status> {
        let req = request.into_inner();

        if req.address.trim().is_empty() {
            return Err(Status::invalid_argument("Node address cannot be empty"));
        }
        let port = u16::try_from(req.port)
            .map_err(|_| Status::invalid_argument("Node port out of range"))?;

        let node = NodeEndpoint {
            address: req.address,
            port,
        };
        self.registry.write().await.register(node);

        Ok(Response::new(RegisterNodeResponse {
            store_port: self.store_port as u32,
            status: "OK".to_string(),
        }))
    }

    async fn assign_node(
        &self,
        _request: Request<AssignNodeRequest>,
    ) -> Result<Response<AssignNodeResponse>, Status> {
        // Length read and cursor advance happen under the same write lock
        let assigned = self.registry.write().await.next();

        match assigned {
            Ok(node) => {
                tracing::info!(node = %node, "Node assigned to client");
                Ok(Response::new(AssignNodeResponse {
                    address: node.address,
                    port: node.port as u32,
                }))
            }
            Err(ImgflowError::NoNodesAvailable) => {
                Err(Status::resource_exhausted("No processing nodes registered"))
            }
            Err(e) => Err(Status::internal(e.to_string())),
        }
    }
}

/// The manager process: registry state plus its gRPC server.
pub struct ManagerNode {
    config: ManagerConfig,
    registry: Arc<RwLock<NodeRegistry>>,
}

impl ManagerNode {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(NodeRegistry::new())),
        }
    }

    pub fn registry(&self) -> Arc<RwLock<NodeRegistry>> {
        self.registry.clone()
    }

    /// Serve the registry until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = RegistryServiceImpl::new(self.registry.clone(), self.config.store_port);

        tracing::info!(
            addr = %self.config.listen_addr,
            store_port = self.config.store_port,
            "Starting manager"
        );

        Server::builder()
            .add_service(RegistryServiceServer::new(service))
            .serve_with_shutdown(self.config.listen_addr, shutdown.cancelled_owned())
            .await
    }
}
