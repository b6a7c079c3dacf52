//! S3-compatible snapshot storage.
//!
//! [`S3Store`] implements [`ObjectStorage`] using the `object_store` crate,
//! supporting any S3-compatible endpoint: AWS S3, MinIO, Ceph, etc.
//!
//! Uploads stream through `object_store`'s buffered writer, which switches to
//! a multipart upload once the archive outgrows a single part. An upload that
//! fails part-way is aborted so no partial object becomes visible.

use std::sync::Arc;

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore};
use tracing::{debug, instrument};

use vcp_core::error::VcpError;
use vcp_core::options::S3Options;
use vcp_core::storage::{ObjectReader, ObjectStorage};
use vcp_core::Result;

use crate::transfer;

/// An [`ObjectStorage`] backed by one object in an S3-compatible bucket.
///
/// Environment variables `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, and
/// `AWS_REGION` are used as fallbacks for credentials and region.
pub struct S3Store {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: ObjectPath,
}

impl S3Store {
    /// Create a new `S3Store` for the object described by `options`.
    pub fn new(options: &S3Options) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&options.bucket);

        if let Some(region) = &options.region {
            builder = builder.with_region(region);
        }
        if let Some(access_key_id) = &options.access_key_id {
            builder = builder.with_access_key_id(access_key_id);
        }
        if let Some(secret_access_key) = &options.secret_access_key {
            builder = builder.with_secret_access_key(secret_access_key);
        }
        if let Some(token) = &options.session_token {
            builder = builder.with_token(token);
        }

        // Custom endpoints (MinIO) are addressed path-style unless told otherwise.
        match &options.endpoint {
            Some(endpoint) => {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"))
                    .with_virtual_hosted_style_request(false);
            }
            None => {
                builder = builder.with_virtual_hosted_style_request(!options.force_path_style);
            }
        }

        if options.insecure_skip_tls_verify {
            builder = builder.with_client_options(
                ClientOptions::new()
                    .with_allow_http(true)
                    .with_allow_invalid_certificates(true),
            );
        }

        let store = builder.build().map_err(|e| {
            VcpError::storage(
                format!("Failed to create S3 client for s3://{}/{}", options.bucket, options.key),
                e,
            )
        })?;

        debug!(bucket = %options.bucket, key = %options.key, "S3Store initialised");

        Ok(Self {
            store: Arc::new(store),
            bucket: options.bucket.clone(),
            key: ObjectPath::from(options.key.as_str()),
        })
    }

    /// Create a store over an existing `ObjectStore`, e.g. an in-memory one.
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, key: &str) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key: ObjectPath::from(key),
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Store {
    fn target(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    #[instrument(skip(self, body), fields(key = %self.key))]
    async fn put_object(&self, body: ObjectReader) -> Result<()> {
        transfer::upload(&self.store, &self.key, &self.target(), body).await
    }

    #[instrument(skip(self), fields(key = %self.key))]
    async fn get_object(&self) -> Result<ObjectReader> {
        transfer::download(&self.store, &self.key, &self.target()).await
    }
}
