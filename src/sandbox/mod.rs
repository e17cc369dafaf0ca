//! Sandbox runner: container lifecycle for one resize job.
//!
//! Processing runs in an isolated container per job. The node only needs
//! three operations from the container engine — start a worker, ask whether
//! it is still running, tear it down — so that is the whole seam:
//!
//! - [`SandboxRunner`]: the three-operation trait the node and the
//!   completion watcher are written against
//! - [`DockerRunner`]: production implementation shelling out to the
//!   `docker` CLI (create, start, inspect, rm -f)
//!
//! The worker container receives the shared volume bound at the configured
//! mount point and three arguments: input path, output path, resize factor.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{ImgflowError, Result};

/// Everything needed to launch one resize worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Container image reference
    pub image: String,
    /// Host path of the shared volume to bind into the container
    pub volume_base: PathBuf,
    /// Volume-relative input file, e.g. "input/in-<id>.png"
    pub input_rel: String,
    /// Volume-relative output file, e.g. "output/out-<id>.png"
    pub output_rel: String,
    /// Normalized resize factor in (0, 1]
    pub resize_factor: f64,
}

/// Container-engine seam used by processing launch and the completion
/// watcher. Handles are opaque strings (container ids for Docker).
#[tonic::async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Create and start a worker container; returns its handle.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    /// Whether the container behind `handle` is still running.
    async fn is_running(&self, handle: &str) -> Result<bool>;

    /// Force-remove the container. Callers treat failures as best-effort.
    async fn remove(&self, handle: &str) -> Result<()>;
}

/// Runs workers through the local `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    /// Mount point of the shared volume inside the container
    mount_point: String,
}

impl DockerRunner {
    pub fn new(mount_point: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ImgflowError::Sandbox(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn container_path(&self, rel: &str) -> String {
        format!("{}/{}", self.mount_point, rel)
    }
}

#[tonic::async_trait]
impl SandboxRunner for DockerRunner {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let bind = format!("{}:{}", spec.volume_base.display(), self.mount_point);

        let create_args = vec![
            "create".to_string(),
            "-v".to_string(),
            bind,
            spec.image.clone(),
            self.container_path(&spec.input_rel),
            self.container_path(&spec.output_rel),
            spec.resize_factor.to_string(),
        ];
        let handle = self.docker(&create_args).await?;

        self.docker(&["start".to_string(), handle.clone()]).await?;

        tracing::info!(
            handle = %handle,
            image = %spec.image,
            input = %spec.input_rel,
            output = %spec.output_rel,
            factor = spec.resize_factor,
            "Sandbox launched"
        );
        Ok(handle)
    }

    async fn is_running(&self, handle: &str) -> Result<bool> {
        let state = self
            .docker(&[
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Running}}".to_string(),
                handle.to_string(),
            ])
            .await?;
        Ok(state == "true")
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        self.docker(&["rm".to_string(), "-f".to_string(), handle.to_string()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_paths_join_mount_point() {
        let runner = DockerRunner::new("/images");
        assert_eq!(
            runner.container_path("input/in-x.png"),
            "/images/input/in-x.png"
        );
        assert_eq!(
            runner.container_path("output/out-x.png"),
            "/images/output/out-x.png"
        );
    }
}
