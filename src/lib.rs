pub mod config;
pub mod error;
pub mod imgserver;
pub mod manager;
pub mod sandbox;
pub mod shutdown;
pub mod store;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("imgflow");
}
