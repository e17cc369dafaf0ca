use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{ImgflowError, Result};

/// Configuration for the sandboxed resize worker.
///
/// Each accepted upload launches one container from `image` with the shared
/// volume bound at [`SandboxConfig::mount_point`]. The worker receives the
/// input path, output path and resize factor as process arguments.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container image reference for the resize worker
    pub image: String,
    /// Resize percentage; values > 1 are read as percentages (60 means 0.6)
    pub resize_pct: f64,
    /// Mount point of the shared volume inside the container
    pub mount_point: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "imgflow-worker:latest".to_string(),
            resize_pct: 0.5,
            mount_point: "/images".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Normalize `resize_pct` into a factor in (0, 1].
    ///
    /// Values above 1 are interpreted as percentages and divided by 100; this
    /// normalization happens here, on the launch path, never client-side.
    pub fn resize_factor(&self) -> Result<f64> {
        let mut pct = self.resize_pct;
        if pct > 1.0 {
            pct /= 100.0;
        }
        if pct <= 0.0 || pct > 1.0 {
            return Err(ImgflowError::InvalidConfig(format!(
                "resize percentage out of range (0 < p <= 1): {}",
                self.resize_pct
            )));
        }
        Ok(pct)
    }
}

/// Configuration for the manager (registry) process.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub listen_addr: SocketAddr,
    /// Port of the shared metadata store, handed to nodes on registration.
    /// The store host is implicitly the manager's own host.
    pub store_port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:50051"
                .parse()
                .expect("default listen address is valid"),
            store_port: 6379,
        }
    }
}

/// Configuration for one processing node.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address advertised to the manager and recorded as job owner.
    /// Must be reachable by clients and by other nodes' redirect targets.
    pub advertise_addr: String,
    pub port: u16,
    /// Manager endpoint in host:port form
    pub manager_addr: String,
    /// Base directory of the node-local shared volume (input/ and output/)
    pub volume_base: PathBuf,
    pub sandbox: SandboxConfig,
}

impl ServerConfig {
    /// host:port pair this node advertises as job owner
    pub fn advertised_endpoint(&self) -> (String, u16) {
        (self.advertise_addr.clone(), self.port)
    }

    /// Host part of the manager address, which is also the metadata store host.
    pub fn manager_host(&self) -> &str {
        self.manager_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.manager_addr.as_str())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            advertise_addr: "127.0.0.1".to_string(),
            port: 50052,
            manager_addr: "127.0.0.1:50051".to_string(),
            volume_base: default_volume_base(),
            sandbox: SandboxConfig::default(),
        }
    }
}

fn default_volume_base() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shared_volume")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.image, "imgflow-worker:latest");
        assert_eq!(cfg.mount_point, "/images");
        assert!((cfg.resize_pct - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn resize_factor_passes_through_fractions() {
        let cfg = SandboxConfig {
            resize_pct: 0.25,
            ..SandboxConfig::default()
        };
        assert!((cfg.resize_factor().unwrap() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn resize_factor_normalizes_percentages() {
        let cfg = SandboxConfig {
            resize_pct: 60.0,
            ..SandboxConfig::default()
        };
        assert!((cfg.resize_factor().unwrap() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn resize_factor_accepts_one() {
        let cfg = SandboxConfig {
            resize_pct: 1.0,
            ..SandboxConfig::default()
        };
        assert!((cfg.resize_factor().unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn resize_factor_rejects_zero_and_negative() {
        for pct in [0.0, -0.5] {
            let cfg = SandboxConfig {
                resize_pct: pct,
                ..SandboxConfig::default()
            };
            assert!(cfg.resize_factor().is_err());
        }
    }

    #[test]
    fn resize_factor_rejects_over_one_hundred() {
        let cfg = SandboxConfig {
            resize_pct: 150.0,
            ..SandboxConfig::default()
        };
        assert!(cfg.resize_factor().is_err());
    }

    #[test]
    fn manager_config_default() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.listen_addr.port(), 50051);
        assert_eq!(cfg.store_port, 6379);
    }

    #[test]
    fn server_config_manager_host() {
        let cfg = ServerConfig {
            manager_addr: "10.0.0.7:50051".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.manager_host(), "10.0.0.7");
    }

    #[test]
    fn server_config_advertised_endpoint() {
        let cfg = ServerConfig {
            advertise_addr: "192.168.1.5".to_string(),
            port: 50099,
            ..ServerConfig::default()
        };
        assert_eq!(
            cfg.advertised_endpoint(),
            ("192.168.1.5".to_string(), 50099)
        );
    }
}
