//! vcp CLI: snapshot and restore a virtual cluster's backing store.
//!
//! - `vcp snapshot --config cp.json s3://bucket/key`: stream every key into object storage
//! - `vcp restore --config cp.json container:///data/snap.tar.gz`: replay a snapshot
//!
//! The snapshot URL may be omitted when `VCP_STORAGE_OPTIONS` carries the options.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vcp_core::options::{RestoreOptions, SnapshotOptions, STORAGE_OPTIONS_ENV};
use vcp_core::{ControlPlaneConfig, ReleaseDescriptor};
use vcp_snapshot::{ops, Bootstrapper, EtcdConnector, ProcessHooks};

#[derive(Parser)]
#[command(name = "vcp", version, about = "Virtual cluster backing-store snapshots")]
struct Cli {
    /// Control plane configuration (JSON).
    #[arg(long, short, global = true, default_value = "/data/vcp.json")]
    config: PathBuf,

    /// Key/value cluster binary started for embedded clusters.
    #[arg(long, global = true, default_value = "etcd")]
    etcd_binary: PathBuf,

    /// Database shim binary started for database backends.
    #[arg(long, global = true, default_value = "kine")]
    shim_binary: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a snapshot of the backing store.
    Snapshot(SnapshotArgs),
    /// Restore the backing store from a snapshot.
    Restore(RestoreArgs),
}

#[derive(Args)]
struct SnapshotArgs {
    /// Snapshot URL: s3://BUCKET/KEY?region=..., container:///PATH or an Azure blob URL.
    url: Option<String>,

    /// Write a plain tar archive.
    #[arg(long)]
    no_compress: bool,

    /// Helm release recorded in the snapshot.
    #[arg(long)]
    release_name: Option<String>,

    #[arg(long, requires = "release_name")]
    release_namespace: Option<String>,

    #[arg(long, requires = "release_name")]
    chart_name: Option<String>,

    #[arg(long, requires = "release_name")]
    chart_version: Option<String>,

    /// Values file of the release.
    #[arg(long, requires = "release_name")]
    values: Option<PathBuf>,
}

#[derive(Args)]
struct RestoreArgs {
    /// Snapshot URL: s3://BUCKET/KEY?region=..., container:///PATH or an Azure blob URL.
    url: String,

    /// Restore even on distros restores are not supported for.
    #[arg(long)]
    skip_distro_check: bool,

    /// Restore into a new virtual cluster, dropping keys bound to the source one.
    #[arg(long)]
    new_cluster: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ControlPlaneConfig::load(&cli.config)
        .await
        .with_context(|| format!("load control plane config {}", cli.config.display()))?;

    let hooks = Arc::new(ProcessHooks::new(&cli.etcd_binary, &cli.shim_binary));
    let bootstrapper = Bootstrapper::new(config, Arc::new(EtcdConnector), hooks.clone());

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    let result = match cli.command {
        Command::Snapshot(args) => run_snapshot(&bootstrapper, args, &cancel).await,
        Command::Restore(args) => run_restore(&bootstrapper, args, &cancel).await,
    };
    hooks.shutdown().await;
    result
}

async fn run_snapshot(
    bootstrapper: &Bootstrapper,
    args: SnapshotArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut options = match &args.url {
        Some(url) => SnapshotOptions::from_url(url).context("parse snapshot url")?,
        None => match SnapshotOptions::from_env()? {
            Some(options) => options,
            None => bail!("either a snapshot URL or {STORAGE_OPTIONS_ENV} is required"),
        },
    };
    if args.no_compress {
        options.compress = false;
    }
    if let Some(release_name) = args.release_name {
        let values = match &args.values {
            Some(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("read values file {}", path.display()))?,
            None => Vec::new(),
        };
        options.release = Some(ReleaseDescriptor {
            release_name,
            release_namespace: args.release_namespace.unwrap_or_default(),
            chart_name: args.chart_name.unwrap_or_default(),
            chart_version: args.chart_version.unwrap_or_default(),
            values,
        });
    }

    let report = ops::snapshot(bootstrapper, &options, cancel)
        .await
        .context("snapshot")?;
    info!(keys = report.keys, target = %report.target, "Successfully wrote snapshot");
    Ok(())
}

async fn run_restore(
    bootstrapper: &Bootstrapper,
    args: RestoreArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut options = RestoreOptions::from_url(&args.url).context("parse snapshot url")?;
    options.require_supported_distro = !args.skip_distro_check;
    options.new_cluster = args.new_cluster;

    let report = ops::restore(bootstrapper, &options, cancel)
        .await
        .context("restore")?;
    info!(restored = report.restored, skipped = report.skipped, target = %options.storage.url(), "Successfully restored snapshot");
    Ok(())
}
