//! Control-plane collaborators the bootstrapper calls into.
//!
//! Certificate issuance and the backing-store processes themselves belong to
//! the rest of the control plane. The bootstrapper only needs the narrow
//! [`ControlPlaneHooks`] interface; [`ProcessHooks`] implements it by
//! spawning the `etcd` and `kine` binaries.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vcp_core::config::{BackingStoreConfig, Certificates, ControlPlaneConfig, KV_CLUSTER_CLIENT_PORT};
use vcp_core::error::VcpError;
use vcp_core::Result;

/// Operations the bootstrapper delegates to the surrounding control plane.
#[async_trait]
pub trait ControlPlaneHooks: Send + Sync {
    /// Make sure client and server certificates exist. Returns the PKI directory.
    async fn generate_certificates(&self, config: &ControlPlaneConfig) -> Result<PathBuf>;

    /// Start the embedded key/value cluster for this control plane.
    async fn start_embedded_cluster(&self, config: &ControlPlaneConfig) -> Result<()>;

    /// Start the database shim serving `connection_string` on `listen_address`.
    async fn start_embedded_shim(&self, connection_string: &str, listen_address: &str)
        -> Result<()>;

    /// Start the shim in front of the configured external database.
    async fn configure_external_database(
        &self,
        listen_address: &str,
        config: &ControlPlaneConfig,
    ) -> Result<()>;

    /// Run the licence initialisation required by managed database connectors.
    async fn license_init(&self, config: &ControlPlaneConfig) -> Result<()>;
}

/// [`ControlPlaneHooks`] backed by child processes.
///
/// Started processes are killed when the hooks are dropped or
/// [`ProcessHooks::shutdown`] is called.
pub struct ProcessHooks {
    etcd_binary: PathBuf,
    shim_binary: PathBuf,
    license_command: Option<Vec<String>>,
    children: Mutex<Vec<Child>>,
}

impl Default for ProcessHooks {
    fn default() -> Self {
        Self::new("etcd", "kine")
    }
}

impl ProcessHooks {
    /// Hooks running the given key/value cluster and shim binaries.
    pub fn new(etcd_binary: impl Into<PathBuf>, shim_binary: impl Into<PathBuf>) -> Self {
        Self {
            etcd_binary: etcd_binary.into(),
            shim_binary: shim_binary.into(),
            license_command: None,
            children: Mutex::new(Vec::new()),
        }
    }

    /// Command run by [`ControlPlaneHooks::license_init`].
    pub fn with_license_command(mut self, command: Vec<String>) -> Self {
        self.license_command = Some(command);
        self
    }

    /// Kill every process started through these hooks.
    pub async fn shutdown(&self) {
        let mut children = self.children.lock().await;
        for child in children.iter_mut() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to stop backing store process");
            }
        }
        children.clear();
    }

    async fn spawn(&self, step: &str, mut command: Command) -> Result<()> {
        command.kill_on_drop(true);
        debug!(?command, "Spawning {}", step);
        let child = command.spawn().map_err(|e| VcpError::Bootstrap {
            step: step.to_string(),
            message: format!("spawn {:?}", command.as_std().get_program()),
            source: Some(Box::new(e)),
        })?;
        info!(pid = child.id(), "Started {}", step);
        self.children.lock().await.push(child);
        Ok(())
    }
}

#[async_trait]
impl ControlPlaneHooks for ProcessHooks {
    async fn generate_certificates(&self, config: &ControlPlaneConfig) -> Result<PathBuf> {
        let pki_dir = config.pki_dir();
        let certificates = Certificates::from_pki_dir(&pki_dir);
        for file in certificates.files() {
            if !tokio::fs::try_exists(file).await.unwrap_or(false) {
                return Err(VcpError::bootstrap_msg(
                    "generate certificates",
                    format!("missing {}; certificates must be issued before the backing store starts", file.display()),
                ));
            }
        }
        Ok(pki_dir)
    }

    async fn start_embedded_cluster(&self, config: &ControlPlaneConfig) -> Result<()> {
        let data_dir = config.embedded_cluster_data_dir();
        let pki_dir = config.pki_dir();
        let client_url = format!("https://127.0.0.1:{KV_CLUSTER_CLIENT_PORT}");

        let mut command = Command::new(&self.etcd_binary);
        command
            .arg("--name")
            .arg(format!("{}-0", config.name))
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("--listen-client-urls")
            .arg(&client_url)
            .arg("--advertise-client-urls")
            .arg(&client_url)
            .arg("--initial-cluster-state")
            .arg("new")
            .arg("--client-cert-auth")
            .arg("--trusted-ca-file")
            .arg(pki_dir.join("etcd").join("ca.crt"))
            .arg("--cert-file")
            .arg(pki_dir.join("etcd").join("server.crt"))
            .arg("--key-file")
            .arg(pki_dir.join("etcd").join("server.key"));
        self.spawn("start embedded cluster", command).await
    }

    async fn start_embedded_shim(
        &self,
        connection_string: &str,
        listen_address: &str,
    ) -> Result<()> {
        let mut command = Command::new(&self.shim_binary);
        command
            .arg("--endpoint")
            .arg(connection_string)
            .arg("--listen-address")
            .arg(listen_address);
        self.spawn("start embedded shim", command).await
    }

    async fn configure_external_database(
        &self,
        listen_address: &str,
        config: &ControlPlaneConfig,
    ) -> Result<()> {
        let data_source = match &config.backing_store {
            BackingStoreConfig::ExternalDatabase { data_source, .. } if !data_source.is_empty() => {
                data_source.clone()
            }
            _ => {
                return Err(VcpError::bootstrap_msg(
                    "configure external database",
                    "no data source configured",
                ))
            }
        };
        self.start_embedded_shim(&data_source, listen_address).await
    }

    async fn license_init(&self, _config: &ControlPlaneConfig) -> Result<()> {
        let Some((program, args)) = self.license_command.as_ref().and_then(|c| c.split_first())
        else {
            return Err(VcpError::Unsupported {
                message: "database connectors need a licence initialisation command".to_string(),
            });
        };
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| VcpError::Bootstrap {
                step: "licence initialisation".to_string(),
                message: format!("run {program}"),
                source: Some(Box::new(e)),
            })?;
        if !status.success() {
            return Err(VcpError::bootstrap_msg(
                "licence initialisation",
                format!("{program} exited with {status}"),
            ));
        }
        Ok(())
    }
}
