//! vcp snapshot engine: backing-store bootstrap, snapshot and restore.
//!
//! This crate contains the [`Bootstrapper`], which resolves a connected
//! client for whichever backing store the control plane runs on, the
//! [`SnapshotWriter`], which streams every key into object storage as a tar
//! archive, and the [`SnapshotRestorer`], which replays such an archive.

pub mod archive;
pub mod bootstrap;
pub mod etcd;
pub mod hooks;
pub mod memory;
pub mod ops;
pub mod protect;
pub mod restorer;
pub mod writer;

pub use archive::ArchiveEncoder;
pub use bootstrap::{Bootstrapper, ClientConnector};
pub use etcd::{EtcdClient, EtcdConnector};
pub use hooks::{ControlPlaneHooks, ProcessHooks};
pub use memory::MemoryStore;
pub use restorer::{restore_snapshot, RestoreReport, SnapshotRestorer};
pub use writer::{write_snapshot, SnapshotReport, SnapshotWriter};
