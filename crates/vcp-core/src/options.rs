//! Snapshot and restore options.
//!
//! Options are usually given as a snapshot URL:
//!
//! - `s3://bucket/key?region=eu-west-1&endpoint=http://minio:9000`
//! - `container:///snapshots/team-a.tar.gz` (or `file:///...`)
//! - `https://account.blob.core.windows.net/container/blob?<sas>` (Azure)
//!
//! Paths and query values are percent-decoded, so credentials containing
//! `+` or `/` must be escaped as `%2B` and `%2F`.
//!
//! The control plane may also receive them pre-parsed through the
//! [`STORAGE_OPTIONS_ENV`] variable as base64-encoded JSON.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ControlPlaneConfig;
use crate::error::VcpError;
use crate::types::ReleaseDescriptor;
use crate::Result;

/// Environment variable carrying base64-encoded JSON [`SnapshotOptions`].
pub const STORAGE_OPTIONS_ENV: &str = "VCP_STORAGE_OPTIONS";

/// Where a snapshot object lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageOptions {
    /// A file on a local or mounted filesystem.
    File(FileOptions),
    /// An object in an S3-compatible bucket.
    S3(S3Options),
    /// A blob in Azure Blob Storage.
    Azure(AzureOptions),
}

/// Options for the file backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOptions {
    /// Absolute path of the snapshot file.
    pub path: PathBuf,
}

/// Options for the S3-compatible backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Options {
    /// Bucket name.
    pub bucket: String,
    /// Object key inside the bucket.
    pub key: String,
    /// Bucket region; falls back to `AWS_REGION`.
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services such as MinIO.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Access key; falls back to `AWS_ACCESS_KEY_ID`.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Secret key; falls back to `AWS_SECRET_ACCESS_KEY`.
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Session token for temporary credentials.
    #[serde(default)]
    pub session_token: Option<String>,
    /// Address the bucket as `endpoint/bucket` instead of `bucket.endpoint`.
    #[serde(default)]
    pub force_path_style: bool,
    /// Accept plain HTTP and invalid certificates on `endpoint`.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// Options for the Azure Blob Storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureOptions {
    /// `https://<account>.blob.<suffix>/<container>/<blob>`, without a query.
    pub blob_url: String,
    /// Shared access signature query string; falls back to
    /// `AZURE_STORAGE_BLOB_SAS`, then to the account key in
    /// `AZURE_STORAGE_KEY`.
    #[serde(default)]
    pub sas: Option<String>,
}

impl AzureOptions {
    /// Split [`AzureOptions::blob_url`] into account host, container and blob name.
    pub fn locate(&self) -> Result<(String, String, String)> {
        let url = Url::parse(&self.blob_url)
            .map_err(|e| VcpError::config(format!("invalid blob URL {}: {e}", self.blob_url)))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let path = decode_path(&url)?;
        let (container, blob) = path.split_once('/').unwrap_or((path.as_str(), ""));
        if host.is_empty() || container.is_empty() || blob.is_empty() {
            return Err(VcpError::config(format!(
                "expected format: https://ACCOUNT.blob.core.windows.net/CONTAINER/BLOB: {}",
                self.blob_url
            )));
        }
        Ok((host, container.to_string(), blob.to_string()))
    }
}

impl StorageOptions {
    /// Parse a snapshot URL.
    pub fn parse(snapshot_url: &str) -> Result<Self> {
        let url = Url::parse(snapshot_url)
            .map_err(|e| VcpError::config(format!("error parsing snapshot URL {snapshot_url}: {e}")))?;

        match url.scheme() {
            "s3" => parse_s3(snapshot_url, &url),
            "container" | "file" => {
                if url.host_str().is_some_and(|host| !host.is_empty()) {
                    return Err(VcpError::config(format!(
                        "relative paths are not supported for file snapshots: {snapshot_url}"
                    )));
                }
                let path = urlencoding::decode(url.path())
                    .map_err(|e| VcpError::config(format!("invalid path in {snapshot_url}: {e}")))?;
                if path.is_empty() || path == "/" {
                    return Err(VcpError::config(format!("couldn't find path for url {snapshot_url}")));
                }
                Ok(StorageOptions::File(FileOptions {
                    path: PathBuf::from(path.into_owned()),
                }))
            }
            "https" => {
                let sas = url.query().filter(|q| !q.is_empty()).map(str::to_string);
                let mut blob_url = url.clone();
                blob_url.set_query(None);
                let options = AzureOptions {
                    blob_url: blob_url.to_string(),
                    sas,
                };
                options.locate()?;
                Ok(StorageOptions::Azure(options))
            }
            other => Err(VcpError::config(format!(
                "unsupported snapshot scheme '{other}', expected one of: s3, container, file, https"
            ))),
        }
    }

    /// Check that all required fields are present.
    pub fn validate(&self) -> Result<()> {
        match self {
            StorageOptions::File(file) => {
                if file.path.as_os_str().is_empty() {
                    return Err(VcpError::config("path must be specified via container:///PATH"));
                }
            }
            StorageOptions::S3(s3) => {
                if s3.bucket.is_empty() {
                    return Err(VcpError::config("bucket must be specified via s3://BUCKET/KEY"));
                }
                if s3.key.is_empty() {
                    return Err(VcpError::config("key must be specified via s3://BUCKET/KEY"));
                }
            }
            StorageOptions::Azure(azure) => {
                if azure.blob_url.is_empty() {
                    return Err(VcpError::config("blob URL must be specified"));
                }
                azure.locate()?;
            }
        }
        Ok(())
    }

    /// Render the options back into a URL (credentials omitted).
    pub fn url(&self) -> String {
        match self {
            StorageOptions::File(file) => format!("container://{}", file.path.display()),
            StorageOptions::S3(s3) => format!("s3://{}/{}", s3.bucket, s3.key),
            StorageOptions::Azure(azure) => azure.blob_url.clone(),
        }
    }
}

/// Options for writing a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOptions {
    /// Where to write the archive.
    pub storage: StorageOptions,
    /// Gzip the archive.
    #[serde(default = "default_compress")]
    pub compress: bool,
    /// Release descriptor written as the first archive entry.
    #[serde(default)]
    pub release: Option<ReleaseDescriptor>,
}

impl SnapshotOptions {
    /// Compressed snapshot options for a snapshot URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self {
            storage: StorageOptions::parse(url)?,
            compress: true,
            release: None,
        })
    }

    /// Read options from [`STORAGE_OPTIONS_ENV`], if it is set.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(STORAGE_OPTIONS_ENV) {
            Ok(encoded) if !encoded.is_empty() => Self::decode(&encoded).map(Some),
            _ => Ok(None),
        }
    }

    /// Decode base64-encoded JSON options.
    pub fn decode(encoded: &str) -> Result<Self> {
        let decoded = STANDARD.decode(encoded.trim()).map_err(|e| {
            VcpError::config(format!("failed to decode storage options from env: {e}"))
        })?;
        serde_json::from_slice(&decoded).map_err(|e| {
            VcpError::config(format!("failed to unmarshal storage options from env: {e}"))
        })
    }

    /// Encode as base64 JSON, the inverse of [`SnapshotOptions::decode`].
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| VcpError::Internal {
            message: format!("encode storage options: {e}"),
        })?;
        Ok(STANDARD.encode(json))
    }

    /// Check the options before a snapshot starts.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()
    }
}

/// Options for restoring a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOptions {
    /// Where to read the archive from.
    pub storage: StorageOptions,
    /// Refuse to run against distros restores are not supported for.
    #[serde(default = "default_require_supported_distro")]
    pub require_supported_distro: bool,
    /// Restore into a new control plane: keys tied to the source control
    /// plane (object mappings, root CA config maps) are skipped.
    #[serde(default)]
    pub new_cluster: bool,
}

impl RestoreOptions {
    /// Restore options for a snapshot URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self {
            storage: StorageOptions::parse(url)?,
            require_supported_distro: true,
            new_cluster: false,
        })
    }

    /// Check the options against the control plane about to be restored.
    pub fn validate(&self, config: &ControlPlaneConfig) -> Result<()> {
        self.storage.validate()?;
        if self.require_supported_distro && !config.distro.supports_restore() {
            return Err(VcpError::Unsupported {
                message: format!("restore is not supported for distro {}", config.distro),
            });
        }
        Ok(())
    }
}

fn parse_s3(snapshot_url: &str, url: &Url) -> Result<StorageOptions> {
    let bucket = url.host_str().unwrap_or_default();
    if bucket.is_empty() {
        return Err(VcpError::config(format!(
            "bucket name is missing from url, expected format: s3://BUCKET/KEY: {snapshot_url}"
        )));
    }
    let key = decode_path(url)?;
    if key.is_empty() {
        return Err(VcpError::config(format!(
            "bucket key is missing from url, expected format: s3://BUCKET/KEY: {snapshot_url}"
        )));
    }

    let mut options = S3Options {
        bucket: bucket.to_string(),
        key,
        ..Default::default()
    };

    for (name, value) in url.query_pairs() {
        let value = value.into_owned();
        match name.as_ref() {
            "region" => options.region = Some(value),
            "endpoint" | "url" => options.endpoint = Some(value),
            "access-key-id" => options.access_key_id = Some(value),
            "secret-access-key" => options.secret_access_key = Some(value),
            "session-token" => options.session_token = Some(value),
            "force-path-style" => options.force_path_style = value == "true",
            "insecure-skip-tls-verify" => options.insecure_skip_tls_verify = value == "true",
            other => {
                return Err(VcpError::config(format!(
                    "unknown s3 option '{other}' in {snapshot_url}"
                )))
            }
        }
    }

    Ok(StorageOptions::S3(options))
}

/// The URL path without its leading `/`, percent-decoded.
fn decode_path(url: &Url) -> Result<String> {
    let path = url.path().trim_start_matches('/');
    urlencoding::decode(path)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| VcpError::config(format!("invalid path in {url}: {e}")))
}

fn default_compress() -> bool {
    true
}

fn default_require_supported_distro() -> bool {
    true
}
