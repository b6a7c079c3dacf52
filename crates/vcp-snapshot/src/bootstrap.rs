//! Backing-store bootstrapper.
//!
//! [`Bootstrapper::resolve_client`] turns a [`ControlPlaneConfig`] into a
//! connected [`KvClient`]. It probes the configured endpoint first. Embedded
//! backends are only ever started for a restore, after the existing state has
//! been protected; a snapshot reads from whatever is already running.
//!
//! Decision table:
//!
//! | backend | unreachable (snapshot) | unreachable (restore) | restore protection |
//! |---|---|---|---|
//! | embedded key/value cluster | address the stable member | start it | data dir → `.backup` |
//! | embedded database | fail | start the shim on the SQLite file | database → `.backup` |
//! | external database | certificates + licence (connector only), start the shim | same | none |
//! | external key/value cluster | fail | fail | `delete_prefix(restore_prefix)` |

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vcp_core::config::{
    BackingStoreConfig, ControlPlaneConfig, Distro, Endpoint, ExternalClusterConfig, SQLITE_PARAMS,
};
use vcp_core::error::VcpError;
use vcp_core::kv::KvClient;
use vcp_core::Result;

use crate::etcd::EtcdConnector;
use crate::hooks::{ControlPlaneHooks, ProcessHooks};
use crate::protect;

/// Delay between readiness probes of a freshly started backend.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Opens client connections to an endpoint.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    /// Connect to `endpoint`, giving up after `timeout`.
    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Arc<dyn KvClient>>;
}

/// Resolves the backing-store client for one control plane.
pub struct Bootstrapper {
    config: ControlPlaneConfig,
    connector: Arc<dyn ClientConnector>,
    hooks: Arc<dyn ControlPlaneHooks>,
}

impl Bootstrapper {
    /// Create a bootstrapper with explicit collaborators.
    pub fn new(
        config: ControlPlaneConfig,
        connector: Arc<dyn ClientConnector>,
        hooks: Arc<dyn ControlPlaneHooks>,
    ) -> Self {
        Self {
            config,
            connector,
            hooks,
        }
    }

    /// Create a bootstrapper using etcd connections and child processes.
    pub fn with_defaults(config: ControlPlaneConfig) -> Self {
        Self::new(
            config,
            Arc::new(EtcdConnector),
            Arc::new(ProcessHooks::default()),
        )
    }

    /// The configuration this bootstrapper resolves.
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Resolve a connected client for the configured backing store.
    ///
    /// With `for_restore` set, existing state is protected first (see the
    /// module docs). Every failure names the sub-step it came from.
    pub async fn resolve_client(&self, for_restore: bool) -> Result<Arc<dyn KvClient>> {
        self.config.validate()?;
        let endpoint = self
            .config
            .endpoint()
            .map_err(|e| VcpError::bootstrap("compute endpoint", e))?;
        info!(
            name = %self.config.name,
            namespace = %self.config.current_namespace(),
            distro = %self.config.distro,
            backing_store = %self.config.store_type(),
            endpoint = %endpoint,
            for_restore,
            "Resolving backing store"
        );

        match &self.config.backing_store {
            BackingStoreConfig::EmbeddedKeyValueCluster => {
                self.resolve_embedded_cluster(endpoint, for_restore).await
            }
            BackingStoreConfig::EmbeddedDatabase => {
                self.resolve_embedded_database(endpoint, for_restore).await
            }
            BackingStoreConfig::ExternalDatabase { connector, .. } => {
                self.resolve_external_database(endpoint, connector.as_deref(), for_restore)
                    .await
            }
            BackingStoreConfig::ExternalKeyValueCluster(external) => {
                self.resolve_external_cluster(endpoint, external, for_restore)
                    .await
            }
        }
    }

    async fn resolve_embedded_cluster(
        &self,
        endpoint: Endpoint,
        for_restore: bool,
    ) -> Result<Arc<dyn KvClient>> {
        if !for_restore {
            if let Some(client) = self.probe(&endpoint).await {
                return Ok(client);
            }
            // Outside the member pod the cluster is reached through its
            // stable headless address.
            return self.connect(&self.config.stable_member_endpoint()).await;
        }

        protect::protect_data_dir(&self.config.embedded_cluster_data_dir())
            .await
            .map_err(|e| VcpError::bootstrap("protect embedded cluster data", e))?;

        if let Some(client) = self.probe(&endpoint).await {
            return Ok(client);
        }

        self.hooks
            .start_embedded_cluster(&self.config)
            .await
            .map_err(|e| VcpError::bootstrap("start embedded cluster", e))?;
        self.wait_ready(&endpoint).await
    }

    async fn resolve_embedded_database(
        &self,
        endpoint: Endpoint,
        for_restore: bool,
    ) -> Result<Arc<dyn KvClient>> {
        let database = self
            .config
            .sqlite_database()
            .map_err(|e| VcpError::bootstrap("locate embedded database", e))?;

        if !for_restore {
            return self.connect(&endpoint).await;
        }

        let protected = match database_state(self.config.distro, &database) {
            StatePath::Dir(db_dir) => protect::protect_data_dir(db_dir).await,
            StatePath::File(file) => protect::protect_database_file(file).await,
        };
        protected.map_err(|e| VcpError::bootstrap("protect embedded database", e))?;

        if let Some(client) = self.probe(&endpoint).await {
            return Ok(client);
        }

        if let Some(db_dir) = database.parent() {
            tokio::fs::create_dir_all(db_dir).await.map_err(|e| VcpError::Bootstrap {
                step: "start embedded shim".to_string(),
                message: format!("create {}", db_dir.display()),
                source: Some(Box::new(e)),
            })?;
        }
        let connection_string = format!("sqlite://{}{SQLITE_PARAMS}", database.display());
        self.hooks
            .start_embedded_shim(&connection_string, &endpoint.address)
            .await
            .map_err(|e| VcpError::bootstrap("start embedded shim", e))?;
        self.wait_ready(&endpoint).await
    }

    async fn resolve_external_database(
        &self,
        endpoint: Endpoint,
        connector: Option<&str>,
        for_restore: bool,
    ) -> Result<Arc<dyn KvClient>> {
        let client = match self.probe(&endpoint).await {
            Some(client) => client,
            None => {
                if let Some(connector) = connector {
                    debug!(connector, "Preparing database connector");
                    self.hooks
                        .generate_certificates(&self.config)
                        .await
                        .map_err(|e| VcpError::bootstrap("generate certificates", e))?;
                    self.hooks
                        .license_init(&self.config)
                        .await
                        .map_err(|e| VcpError::bootstrap("licence initialisation", e))?;
                }
                self.hooks
                    .configure_external_database(&endpoint.address, &self.config)
                    .await
                    .map_err(|e| VcpError::bootstrap("start database shim", e))?;
                self.wait_ready(&endpoint).await?
            }
        };

        if for_restore {
            warn_if_not_empty(client.as_ref()).await;
        }
        Ok(client)
    }

    async fn resolve_external_cluster(
        &self,
        endpoint: Endpoint,
        external: &ExternalClusterConfig,
        for_restore: bool,
    ) -> Result<Arc<dyn KvClient>> {
        // Without a user endpoint this is the cluster deployed next to the
        // control plane, which uses the control plane's own certificates.
        if external.endpoint.is_none() {
            self.hooks
                .generate_certificates(&self.config)
                .await
                .map_err(|e| VcpError::bootstrap("generate certificates", e))?;
        }

        let client = self.connect(&endpoint).await?;

        if for_restore {
            let prefix = external.restore_prefix.as_bytes();
            let deleted = client.delete_prefix(prefix).await.map_err(|e| {
                VcpError::bootstrap(
                    "protect external cluster",
                    VcpError::Protection {
                        path: external.restore_prefix.clone(),
                        message: "delete existing keys".to_string(),
                        source: Some(Box::new(e)),
                    },
                )
            })?;
            info!(prefix = %external.restore_prefix, deleted, "Cleared external cluster before restore");
        }
        Ok(client)
    }

    /// Mark a restore into the resolved backend as complete.
    ///
    /// Until this runs, protection treats the backup of the embedded state as
    /// the original and a retried restore keeps it.
    pub async fn complete_restore(&self) -> Result<()> {
        let state = match &self.config.backing_store {
            BackingStoreConfig::EmbeddedKeyValueCluster => self.config.embedded_cluster_data_dir(),
            BackingStoreConfig::EmbeddedDatabase => {
                let database = self
                    .config
                    .sqlite_database()
                    .map_err(|e| VcpError::bootstrap("locate embedded database", e))?;
                database_state(self.config.distro, &database).path().to_path_buf()
            }
            BackingStoreConfig::ExternalDatabase { .. }
            | BackingStoreConfig::ExternalKeyValueCluster(_) => return Ok(()),
        };
        protect::finish_restore(&state)
            .await
            .map_err(|e| VcpError::bootstrap("finish restore", e))
    }

    /// Connect without starting anything.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn KvClient>> {
        self.connector
            .connect(endpoint, self.config.probe_timeout())
            .await
            .map_err(|e| VcpError::bootstrap("connect", e))
    }

    /// Connect and issue a member list within the probe timeout.
    async fn probe(&self, endpoint: &Endpoint) -> Option<Arc<dyn KvClient>> {
        let timeout = self.config.probe_timeout();
        let attempt = async {
            let client = self.connector.connect(endpoint, timeout).await?;
            client.member_list().await?;
            Ok::<_, VcpError>(client)
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(client)) => {
                debug!(endpoint = %endpoint, "Backing store reachable");
                Some(client)
            }
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, error = %e, "Backing store unreachable");
                None
            }
            Err(_) => {
                debug!(endpoint = %endpoint, "Backing store probe timed out");
                None
            }
        }
    }

    /// Poll a freshly started backend until it answers or `ready_timeout` passes.
    async fn wait_ready(&self, endpoint: &Endpoint) -> Result<Arc<dyn KvClient>> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout();
        loop {
            if let Some(client) = self.probe(endpoint).await {
                info!(endpoint = %endpoint, "Backing store ready");
                return Ok(client);
            }
            if tokio::time::Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(VcpError::bootstrap_msg(
                    "wait for backing store",
                    format!(
                        "{endpoint} not ready after {}s",
                        self.config.ready_timeout().as_secs()
                    ),
                ));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// On-disk state of an embedded database moved aside by a restore.
enum StatePath<'a> {
    Dir(&'a Path),
    File(&'a Path),
}

impl StatePath<'_> {
    fn path(&self) -> &Path {
        match self {
            StatePath::Dir(path) | StatePath::File(path) => path,
        }
    }
}

/// K3s keeps the database in its own directory, which is protected whole.
fn database_state(distro: Distro, database: &Path) -> StatePath<'_> {
    match (distro, database.parent()) {
        (Distro::K3s, Some(db_dir)) => StatePath::Dir(db_dir),
        _ => StatePath::File(database),
    }
}

/// External databases are never wiped; a restore into one overwrites the
/// keys in the snapshot and leaves every other key in place.
async fn warn_if_not_empty(client: &dyn KvClient) {
    let cancel = CancellationToken::new();
    let mut keys = client.list_stream(b"/", cancel.clone());
    if let Some(Ok(record)) = keys.recv().await {
        warn!(
            first_key = %record.key_lossy(),
            "External database is not empty; restored keys will be merged into existing data"
        );
    }
    cancel.cancel();
}
