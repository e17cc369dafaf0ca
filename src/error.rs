use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImgflowError {
    #[error("No processing nodes available")]
    NoNodesAvailable,

    #[error("Unknown request id: {0}")]
    UnknownRequest(String),

    #[error("Unsupported image format (only PNG/JPEG)")]
    UnsupportedFormat,

    #[error("Request id already exists: {0}")]
    RequestIdCollision(String),

    #[error("Metadata store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

pub type Result<T> = std::result::Result<T, ImgflowError>;
