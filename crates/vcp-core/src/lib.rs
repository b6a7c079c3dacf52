//! vcp core types, traits, configuration, and errors.
//!
//! This crate provides the building blocks shared by the snapshot engine:
//! the [`KvClient`] trait every backing store is reached through, the
//! [`ObjectStorage`] trait snapshots are written to, control-plane
//! configuration, snapshot options, and the unified error type.

pub mod config;
pub mod error;
pub mod kv;
pub mod options;
pub mod storage;
pub mod types;

pub use config::{BackingStoreConfig, BackingStoreType, ControlPlaneConfig, Distro, Endpoint};
pub use error::VcpError;
pub use kv::{KvClient, ListStream};
pub use options::{RestoreOptions, SnapshotOptions, StorageOptions};
pub use storage::{ObjectReader, ObjectStorage};
pub use types::*;

/// Convenience Result type using [`VcpError`].
pub type Result<T> = std::result::Result<T, VcpError>;
