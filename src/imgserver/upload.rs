use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::imgserver::volume::{detect_format, ImageFormat, Volume, SNIFF_LEN};

/// Result of a finished upload stream.
#[derive(Debug)]
pub enum UploadOutcome {
    /// Stream validated and fully staged on disk.
    Accepted {
        format: ImageFormat,
        input_rel: String,
        output_rel: String,
    },
    /// Stream rejected; any partial file has been deleted.
    Rejected { reason: String },
}

enum SinkState {
    /// Buffering the first bytes; nothing committed to disk yet.
    Sniffing { buf: Vec<u8> },
    /// Format accepted, staging file open.
    Writing {
        file: File,
        path: PathBuf,
        format: ImageFormat,
    },
    /// Terminal; all further chunks for this stream are ignored.
    Rejected { reason: String },
}

/// Consumes one upload stream chunk by chunk.
///
/// `Sniffing -> Writing -> finish` on the happy path, `Rejected` on bad
/// magic or local I/O failure, [`UploadSink::abort`] on transport error.
/// The sniff buffer accumulates whole chunks until [`SNIFF_LEN`] bytes are
/// available; on acceptance the entire buffered prefix is written before any
/// later chunk, preserving exact byte order and count.
pub struct UploadSink {
    request_id: String,
    volume: Volume,
    state: SinkState,
}

impl UploadSink {
    pub fn new(request_id: String, volume: Volume) -> Self {
        Self {
            request_id,
            volume,
            state: SinkState::Sniffing { buf: Vec::new() },
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Feed one chunk. Never fails the stream: rejection and I/O problems
    /// move the sink to `Rejected` and are reported at [`UploadSink::finish`].
    pub async fn push(&mut self, data: &[u8]) {
        match &mut self.state {
            SinkState::Sniffing { buf } => {
                buf.extend_from_slice(data);
                if buf.len() < SNIFF_LEN {
                    return;
                }
                match detect_format(buf) {
                    Some(format) => {
                        let prefix = std::mem::take(buf);
                        self.open_and_write(format, &prefix).await;
                    }
                    None => {
                        tracing::info!(
                            request_id = %self.request_id,
                            "Upload rejected (invalid format)"
                        );
                        self.state = SinkState::Rejected {
                            reason: "Invalid format (only PNG/JPEG)".to_string(),
                        };
                    }
                }
            }
            SinkState::Writing { file, .. } => {
                if let Err(e) = file.write_all(data).await {
                    tracing::warn!(request_id = %self.request_id, error = %e, "Staging write failed");
                    self.reject_and_cleanup(format!("Local write failed: {}", e))
                        .await;
                }
            }
            SinkState::Rejected { .. } => {}
        }
    }

    async fn open_and_write(&mut self, format: ImageFormat, prefix: &[u8]) {
        let input_rel = Volume::input_rel(&self.request_id, format);
        let path = self.volume.resolve(&input_rel);

        let mut file = match File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(request_id = %self.request_id, error = %e, "Cannot create staging file");
                self.state = SinkState::Rejected {
                    reason: format!("Cannot create staging file: {}", e),
                };
                return;
            }
        };

        if let Err(e) = file.write_all(prefix).await {
            tracing::warn!(request_id = %self.request_id, error = %e, "Staging write failed");
            drop(file);
            remove_quietly(&path).await;
            self.state = SinkState::Rejected {
                reason: format!("Local write failed: {}", e),
            };
            return;
        }

        tracing::debug!(request_id = %self.request_id, path = %path.display(), "Staging file created");
        self.state = SinkState::Writing { file, path, format };
    }

    async fn reject_and_cleanup(&mut self, reason: String) {
        if let SinkState::Writing { path, .. } =
            std::mem::replace(&mut self.state, SinkState::Rejected { reason })
        {
            remove_quietly(&path).await;
        }
    }

    /// Normal end of stream.
    ///
    /// A stream that never reached the sniff threshold is rejected here
    /// (insufficient data) rather than left unresolved.
    pub async fn finish(self) -> UploadOutcome {
        match self.state {
            SinkState::Sniffing { .. } => UploadOutcome::Rejected {
                reason: "Insufficient data to classify image".to_string(),
            },
            SinkState::Rejected { reason } => UploadOutcome::Rejected { reason },
            SinkState::Writing {
                mut file,
                path,
                format,
            } => {
                if let Err(e) = file.flush().await {
                    tracing::warn!(request_id = %self.request_id, error = %e, "Staging flush failed");
                    drop(file);
                    remove_quietly(&path).await;
                    return UploadOutcome::Rejected {
                        reason: format!("Local write failed: {}", e),
                    };
                }
                tracing::debug!(request_id = %self.request_id, path = %path.display(), "Upload staged");
                UploadOutcome::Accepted {
                    format,
                    input_rel: Volume::input_rel(&self.request_id, format),
                    output_rel: Volume::output_rel(&self.request_id, format),
                }
            }
        }
    }

    /// Transport error mid-stream: delete any partial artifact. No job
    /// record exists yet for this stream, so nothing else to undo.
    pub async fn abort(self) {
        if let SinkState::Writing { file, path, .. } = self.state {
            drop(file);
            remove_quietly(&path).await;
        }
        tracing::info!(request_id = %self.request_id, "Upload aborted");
    }
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete partial upload");
        }
    }
}
