use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing_subscriber::EnvFilter;

use imgflow::config::{ManagerConfig, SandboxConfig, ServerConfig};
use imgflow::imgserver::ImgServerNode;
use imgflow::manager::ManagerNode;
use imgflow::proto::download_chunk::Payload;
use imgflow::proto::image_service_client::ImageServiceClient;
use imgflow::proto::registry_service_client::RegistryServiceClient;
use imgflow::proto::{
    AssignNodeRequest, DownloadImageRequest, ImageChunk, TransferState, TransferStatus,
};
use imgflow::shutdown::shutdown_token;

/// Upload streams are sent in chunks of this size.
const UPLOAD_CHUNK_SIZE: usize = 8192;

#[derive(Parser, Debug)]
#[command(name = "imgflow")]
#[command(version)]
#[command(about = "Distributed image-resize service")]
#[command(propagate_version = true)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the manager (node registry and load balancer)
    Manager(ManagerArgs),

    /// Run a processing node
    Server(ServerArgs),

    /// Upload images for resizing
    Upload(UploadArgs),

    /// Download resized images
    Download(DownloadArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ManagerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Port of the shared metadata store, handed to nodes on registration
    #[arg(long, default_value = "6379")]
    store_port: u16,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address advertised to the manager (must be reachable by clients)
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50052")]
    port: u16,

    /// Manager endpoint (host:port)
    #[arg(long, default_value = "127.0.0.1:50051")]
    manager: String,

    /// Base directory of the shared volume (defaults to ~/shared_volume)
    #[arg(long)]
    volume_base: Option<PathBuf>,

    /// Container image for the resize worker
    #[arg(long, default_value = "imgflow-worker:latest")]
    image: String,

    /// Resize percentage (0.6 or 60 both mean 60%)
    #[arg(long, default_value = "0.5")]
    resize_pct: f64,
}

// =============================================================================
// Client Arguments (shared by upload and download)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Manager endpoint (host:port) used to get a node assignment
    #[arg(long, short = 'm', default_value = "127.0.0.1:50051")]
    manager: String,

    /// Skip the manager and talk to this node directly (host:port)
    #[arg(long)]
    node: Option<String>,
}

#[derive(Parser, Debug)]
struct UploadArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Image files to upload (PNG or JPEG)
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
struct DownloadArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Request ids to download
    #[arg(required = true)]
    request_ids: Vec<String>,

    /// Directory to write downloaded files into
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolve the node to talk to: the explicit `--node`, or an assignment
/// from the manager.
async fn resolve_node(client: &ClientArgs) -> Result<(String, u16), Box<dyn std::error::Error>> {
    if let Some(node) = &client.node {
        let (host, port) = node
            .rsplit_once(':')
            .ok_or("Invalid --node, expected host:port")?;
        return Ok((host.to_string(), port.parse()?));
    }

    let mut registry = RegistryServiceClient::connect(format!("http://{}", client.manager)).await?;
    let assigned = registry.assign_node(AssignNodeRequest {}).await?.into_inner();
    let port = u16::try_from(assigned.port).map_err(|_| "Assigned port out of range")?;
    println!("Assigned node: {}:{}", assigned.address, port);
    Ok((assigned.address, port))
}

async fn connect_node(
    address: &str,
    port: u16,
) -> Result<ImageServiceClient<tonic::transport::Channel>, Box<dyn std::error::Error>> {
    Ok(ImageServiceClient::connect(format!("http://{}:{}", address, port)).await?)
}

/// Deduce the download file extension from the magic bytes, like the
/// server-side sniffer but with a fallback for unexpected content.
fn guess_extension(data: &[u8]) -> &'static str {
    if data.len() >= 4 && data[..4] == [0x89, 0x50, 0x4E, 0x47] {
        ".png"
    } else if data.len() >= 2 && data[..2] == [0xFF, 0xD8] {
        ".jpg"
    } else {
        ".img"
    }
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_upload(args: UploadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (address, port) = resolve_node(&args.client).await?;
    let mut client = connect_node(&address, port).await?;

    for file in &args.files {
        match upload_file(&mut client, file).await {
            Ok(reply) => {
                if reply.request_id == "ERROR" {
                    eprintln!("Rejected {}: {}", file.display(), reply.message);
                } else {
                    println!("Uploaded {} -> request id {}", file.display(), reply.request_id);
                }
            }
            Err(e) => {
                eprintln!("Error: upload of {} failed: {}", file.display(), e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn upload_file(
    client: &mut ImageServiceClient<tonic::transport::Channel>,
    path: &Path,
) -> Result<imgflow::proto::UploadImageResponse, Box<dyn std::error::Error>> {
    let mut file = tokio::fs::File::open(path).await?;
    let (tx, rx) = mpsc::channel::<ImageChunk>(16);

    // Feed the file while the call is in flight; the reply only arrives
    // after the stream is closed.
    tokio::spawn(async move {
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(ImageChunk { data: buf[..n].to_vec() }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error: read failed: {}", e);
                    break;
                }
            }
        }
    });

    let reply = client.upload_image(ReceiverStream::new(rx)).await?;
    Ok(reply.into_inner())
}

async fn handle_download(args: DownloadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = resolve_node(&args.client).await?;

    for request_id in &args.request_ids {
        if let Err(e) = download_one(endpoint.clone(), request_id, &args.out_dir).await {
            eprintln!("Error: download of {} failed: {}", request_id, e);
            std::process::exit(1);
        }
    }
    Ok(())
}

/// One download with the full protocol loop: keep polling while the job is
/// processing, follow a redirect to the owner node, stop on done or error.
async fn download_one(
    mut endpoint: (String, u16),
    request_id: &str,
    out_dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let mut client = connect_node(&endpoint.0, endpoint.1).await?;
        let mut stream = client
            .download_image(DownloadImageRequest {
                request_id: request_id.to_string(),
            })
            .await?
            .into_inner();

        let mut data: Vec<u8> = Vec::new();
        let mut terminal: Option<TransferStatus> = None;

        while let Some(chunk) = stream.message().await? {
            match chunk.payload {
                Some(Payload::Data(bytes)) => data.extend_from_slice(&bytes),
                Some(Payload::Status(status)) => {
                    terminal = Some(status);
                    break;
                }
                None => {}
            }
        }

        let status = terminal.ok_or("Stream ended without a status frame")?;
        match TransferState::try_from(status.state) {
            Ok(TransferState::Redirect) => {
                let port = u16::try_from(status.redirect_port)
                    .map_err(|_| "Redirect port out of range")?;
                println!(
                    "Redirected to {}:{} for {}",
                    status.redirect_address, port, request_id
                );
                endpoint = (status.redirect_address, port);
            }
            Ok(TransferState::Processing) => {
                println!("Still processing {} ...", request_id);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(TransferState::Done) => {
                let name = format!("download-{}{}", request_id, guess_extension(&data));
                let target = out_dir.join(name);
                tokio::fs::write(&target, &data).await?;
                println!("Downloaded {} -> {}", request_id, target.display());
                return Ok(());
            }
            _ => {
                return Err(status.message.into());
            }
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.debug);

    match args.command {
        Commands::Manager(manager_args) => {
            let config = ManagerConfig {
                listen_addr: format!("0.0.0.0:{}", manager_args.port).parse()?,
                store_port: manager_args.store_port,
            };
            ManagerNode::new(config).run(shutdown_token()).await?;
        }
        Commands::Server(server_args) => {
            let mut config = ServerConfig {
                advertise_addr: server_args.address,
                port: server_args.port,
                manager_addr: server_args.manager,
                sandbox: SandboxConfig {
                    image: server_args.image,
                    resize_pct: server_args.resize_pct,
                    ..SandboxConfig::default()
                },
                ..ServerConfig::default()
            };
            if let Some(volume_base) = server_args.volume_base {
                config.volume_base = volume_base;
            }
            ImgServerNode::new(config).run(shutdown_token()).await?;
        }
        Commands::Upload(upload_args) => handle_upload(upload_args).await?,
        Commands::Download(download_args) => handle_download(download_args).await?,
    }

    Ok(())
}
