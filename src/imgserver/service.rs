use std::pin::Pin;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::Result as ImgflowResult;
use crate::imgserver::upload::{UploadOutcome, UploadSink};
use crate::imgserver::volume::Volume;
use crate::imgserver::watcher::WatcherSet;
use crate::proto::image_service_server::ImageService;
use crate::proto::{
    download_chunk, DownloadChunk, DownloadImageRequest, ImageChunk, TransferState,
    TransferStatus, UploadImageResponse,
};
use crate::sandbox::{LaunchSpec, SandboxRunner};
use crate::store::{JobRecord, JobStatus, MetadataStore};

/// Sentinel request id returned for rejected uploads.
pub const REJECTED_REQUEST_ID: &str = "ERROR";

/// Result files are streamed in chunks of this size.
pub const DOWNLOAD_CHUNK_SIZE: usize = 8192;

type DownloadStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<DownloadChunk, Status>> + Send>>;

/// Per-node gRPC service: streamed uploads in, streamed downloads out.
///
/// One handler task runs per open stream; the only state shared between
/// handlers is the metadata store, the sandbox runner and the watcher set.
pub struct ImageServiceImpl {
    /// Address/port this node advertises; recorded as job owner and compared
    /// against stored owners to decide redirects.
    advertise_addr: String,
    advertise_port: u16,
    volume: Volume,
    store: Arc<dyn MetadataStore>,
    runner: Arc<dyn SandboxRunner>,
    watchers: Arc<WatcherSet>,
    sandbox: SandboxConfig,
}

impl ImageServiceImpl {
    pub fn new(
        advertise_addr: String,
        advertise_port: u16,
        volume: Volume,
        store: Arc<dyn MetadataStore>,
        runner: Arc<dyn SandboxRunner>,
        watchers: Arc<WatcherSet>,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            advertise_addr,
            advertise_port,
            volume,
            store,
            runner,
            watchers,
            sandbox,
        }
    }

    /// Launch the sandboxed worker for an accepted upload and spawn its
    /// completion watcher. Fire-and-forget from the caller's perspective:
    /// the upload reply is not gated on anything that happens here after
    /// the launch itself.
    async fn launch_processing(&self, record: &JobRecord) -> ImgflowResult<()> {
        let factor = self.sandbox.resize_factor()?;
        let spec = LaunchSpec {
            image: self.sandbox.image.clone(),
            volume_base: self.volume.base().to_path_buf(),
            input_rel: record.input_path.clone(),
            output_rel: record.output_path.clone(),
            resize_factor: factor,
        };

        let handle = self.runner.launch(&spec).await?;

        // Read-modify-write; only the owning node mutates a record after
        // creation, so last-write-wins is acceptable here.
        let mut updated = match self.store.get(&record.request_id).await? {
            Some(found) => found,
            None => record.clone(),
        };
        updated.sandbox_handle = Some(handle.clone());
        self.store.put(&updated).await?;

        self.watchers
            .spawn(
                record.request_id.clone(),
                handle,
                self.store.clone(),
                self.runner.clone(),
            )
            .await;
        Ok(())
    }

    /// Rewrite a record to terminal `error`, best-effort.
    async fn mark_error(&self, request_id: &str, message: &str) {
        match self.store.get(request_id).await {
            Ok(Some(mut record)) => {
                record.status = JobStatus::Error;
                record.message = Some(message.to_string());
                if let Err(e) = self.store.put(&record).await {
                    tracing::warn!(request_id, error = %e, "Failed to persist error status");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(request_id, error = %e, "Failed to read record for error update");
            }
        }
    }
}

#[tonic::async_trait]
impl ImageService for ImageServiceImpl {
    async fn upload_image(
        &self,
        request: Request<Streaming<ImageChunk>>,
    ) -> Result<Response<UploadImageResponse>, Status> {
        let request_id = Uuid::new_v4().to_string();
        tracing::info!(request_id = %request_id, "Upload started");

        let mut stream = request.into_inner();
        let mut sink = UploadSink::new(request_id.clone(), self.volume.clone());

        loop {
            match stream.message().await {
                Ok(Some(chunk)) => sink.push(&chunk.data).await,
                Ok(None) => break,
                Err(status) => {
                    tracing::warn!(request_id = %request_id, error = %status, "Upload stream failed");
                    sink.abort().await;
                    return Err(status);
                }
            }
        }

        match sink.finish().await {
            UploadOutcome::Rejected { reason } => {
                tracing::info!(request_id = %request_id, reason = %reason, "Upload rejected");
                Ok(Response::new(UploadImageResponse {
                    request_id: REJECTED_REQUEST_ID.to_string(),
                    message: reason,
                }))
            }
            UploadOutcome::Accepted {
                input_rel,
                output_rel,
                ..
            } => {
                let record = JobRecord::new(
                    request_id.clone(),
                    self.advertise_addr.clone(),
                    self.advertise_port,
                    input_rel,
                    output_rel,
                );

                match self.store.put_new(&record).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!(request_id = %request_id, "Request id collision in store");
                        return Err(Status::already_exists("Request id collision"));
                    }
                    Err(e) => {
                        return Err(Status::unavailable(format!(
                            "Metadata store unavailable: {}",
                            e
                        )));
                    }
                }
                tracing::info!(request_id = %request_id, "Image received, job marked processing");

                let message = match self.launch_processing(&record).await {
                    Ok(()) => "RECEIVED".to_string(),
                    Err(e) => {
                        tracing::error!(request_id = %request_id, error = %e, "Processing launch failed");
                        let message = format!("Processing failed to start: {}", e);
                        self.mark_error(&request_id, &message).await;
                        message
                    }
                };

                Ok(Response::new(UploadImageResponse {
                    request_id,
                    message,
                }))
            }
        }
    }

    type DownloadImageStream = DownloadStream;

    async fn download_image(
        &self,
        request: Request<DownloadImageRequest>,
    ) -> Result<Response<Self::DownloadImageStream>, Status> {
        let request_id = request.into_inner().request_id;

        let record = self
            .store
            .get(&request_id)
            .await
            .map_err(|e| Status::unavailable(format!("Metadata store unavailable: {}", e)))?;

        let Some(record) = record else {
            tracing::info!(request_id = %request_id, "Download rejected (unknown request id)");
            return Ok(single_frame(status_frame(
                TransferState::Error,
                "unknown request id",
            )));
        };

        // Redirect if another node owns the result
        if !record.is_owned_by(&self.advertise_addr, self.advertise_port) {
            tracing::info!(
                request_id = %request_id,
                owner = %format!("{}:{}", record.owner_address, record.owner_port),
                "Redirecting download to owner"
            );
            return Ok(single_frame(redirect_frame(
                &record.owner_address,
                record.owner_port,
            )));
        }

        // Not done yet: echo the current status, designed to be polled
        match record.status {
            JobStatus::Processing => {
                tracing::info!(request_id = %request_id, "Download polled while processing");
                return Ok(single_frame(status_frame(
                    TransferState::Processing,
                    "Not ready yet",
                )));
            }
            JobStatus::Error => {
                let message = record.message.as_deref().unwrap_or("Processing failed");
                return Ok(single_frame(status_frame(TransferState::Error, message)));
            }
            JobStatus::Done => {}
        }

        let path = self.volume.resolve(&record.output_path);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::warn!(request_id = %request_id, path = %path.display(), "Result file missing");
            self.mark_error(&request_id, "Result file not found on volume")
                .await;
            return Ok(single_frame(status_frame(
                TransferState::Error,
                "Result file not found on volume",
            )));
        }

        tracing::info!(request_id = %request_id, "Download started");
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(stream_result(path, request_id, tx));
        let stream: DownloadStream = Box::pin(ReceiverStream::new(rx));
        Ok(Response::new(stream))
    }
}

/// Send the result file in fixed-size data chunks, then exactly one
/// terminal status frame. A read failure mid-stream ends in a terminal
/// `error` frame instead of `done`.
async fn stream_result(
    path: std::path::PathBuf,
    request_id: String,
    tx: mpsc::Sender<Result<DownloadChunk, Status>>,
) {
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            let _ = tx
                .send(Ok(status_frame(TransferState::Error, &e.to_string())))
                .await;
            return;
        }
    };

    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = DownloadChunk {
                    payload: Some(download_chunk::Payload::Data(buf[..n].to_vec())),
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    // Client disconnected
                    tracing::debug!(request_id = %request_id, "Download abandoned by client");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Result read failed");
                let _ = tx
                    .send(Ok(status_frame(TransferState::Error, &e.to_string())))
                    .await;
                return;
            }
        }
    }

    if tx.send(Ok(status_frame(TransferState::Done, "OK"))).await.is_ok() {
        tracing::info!(request_id = %request_id, "Download complete");
    }
}

fn status_frame(state: TransferState, message: &str) -> DownloadChunk {
    DownloadChunk {
        payload: Some(download_chunk::Payload::Status(TransferStatus {
            state: state as i32,
            message: message.to_string(),
            redirect_address: String::new(),
            redirect_port: 0,
        })),
    }
}

fn redirect_frame(address: &str, port: u16) -> DownloadChunk {
    DownloadChunk {
        payload: Some(download_chunk::Payload::Status(TransferStatus {
            state: TransferState::Redirect as i32,
            message: "Result lives on another node".to_string(),
            redirect_address: address.to_string(),
            redirect_port: port as u32,
        })),
    }
}

fn single_frame(chunk: DownloadChunk) -> Response<DownloadStream> {
    let stream: DownloadStream = Box::pin(tokio_stream::once(Ok(chunk)));
    Response::new(stream)
}
