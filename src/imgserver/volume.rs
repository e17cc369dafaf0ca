use std::path::{Path, PathBuf};

/// Supported upload formats, classified from the first bytes of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

/// Bytes that must be buffered before classification runs.
pub const SNIFF_LEN: usize = 8;

const PNG_MAGIC: [u8; 4] = [0x89, 0x50, 0x4E, 0x47];
const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];

/// Classify a buffered prefix of at least [`SNIFF_LEN`] bytes.
pub fn detect_format(head: &[u8]) -> Option<ImageFormat> {
    if head.len() < SNIFF_LEN {
        return None;
    }
    if head[..4] == PNG_MAGIC {
        return Some(ImageFormat::Png);
    }
    if head[..2] == JPEG_MAGIC {
        return Some(ImageFormat::Jpeg);
    }
    None
}

/// Node-local shared volume: `input/` for staged uploads, `output/` for
/// worker results. Files are named by request id plus detected extension.
/// The store holds volume-relative paths; only this node touches the files.
#[derive(Debug, Clone)]
pub struct Volume {
    base: PathBuf,
}

impl Volume {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.base.join("input")).await?;
        tokio::fs::create_dir_all(self.base.join("output")).await?;
        Ok(())
    }

    /// Volume-relative input path, e.g. "input/in-<id>.png"
    pub fn input_rel(request_id: &str, format: ImageFormat) -> String {
        format!("input/in-{}.{}", request_id, format.extension())
    }

    /// Volume-relative output path, e.g. "output/out-<id>.png"
    pub fn output_rel(request_id: &str, format: ImageFormat) -> String {
        format!("output/out-{}.{}", request_id, format.extension())
    }

    /// Absolute path of a volume-relative entry on this node.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }
}
