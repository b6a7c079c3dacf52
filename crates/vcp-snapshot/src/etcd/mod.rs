//! A minimal etcd v3 client over tonic.
//!
//! Both key/value clusters and the database shim speak the etcd v3 gRPC API,
//! so one client serves every [`BackingStoreType`](vcp_core::BackingStoreType).
//! Only the four calls the snapshot engine needs are implemented.

pub mod proto;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity, Uri};
use tower::service_fn;
use tracing::{debug, instrument};

use vcp_core::config::{Certificates, Endpoint};
use vcp_core::error::VcpError;
use vcp_core::kv::{prefix_range_end, KvClient, ListStream, LIST_STREAM_BUFFER};
use vcp_core::types::{KeyValueRecord, Member};
use vcp_core::Result;

use crate::bootstrap::ClientConnector;

use self::proto::{
    DeleteRangeRequest, DeleteRangeResponse, MemberListRequest, MemberListResponse, PutRequest,
    PutResponse, RangeRequest, RangeResponse,
};

/// Keys fetched per range request while listing.
pub const LIST_PAGE_SIZE: i64 = 1000;

const RANGE: &str = "/etcdserverpb.KV/Range";
const PUT: &str = "/etcdserverpb.KV/Put";
const DELETE_RANGE: &str = "/etcdserverpb.KV/DeleteRange";
const MEMBER_LIST: &str = "/etcdserverpb.Cluster/MemberList";

/// An etcd v3 client bound to one endpoint.
///
/// Cheap to clone; clones share the underlying HTTP/2 connection.
#[derive(Clone)]
pub struct EtcdClient {
    channel: Channel,
    address: String,
}

impl EtcdClient {
    /// Connect to `endpoint`, failing if no connection is made within `timeout`.
    ///
    /// `unix://` addresses are dialled as Unix sockets (the database shim);
    /// anything else is treated as an HTTP/2 URL, with TLS when the endpoint
    /// carries certificates.
    #[instrument(skip(endpoint), fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let connecting = async {
            match endpoint.address.strip_prefix("unix://") {
                Some(path) => connect_unix(path.to_string(), timeout).await,
                None => connect_http(endpoint, timeout).await,
            }
        };
        let channel = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| {
                VcpError::backing_store_msg(format!(
                    "connect to {endpoint}: timed out after {}s",
                    timeout.as_secs()
                ))
            })??;
        debug!("Connected to {}", endpoint);
        Ok(Self {
            channel,
            address: endpoint.address.clone(),
        })
    }

    /// The address this client is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn unary<Req, Resp>(&self, request: Req, path: &'static str) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| {
            VcpError::backing_store_msg(format!("{path}: service not ready: {e}"))
        })?;
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                ProstCodec::<Req, Resp>::default(),
            )
            .await
            .map_err(|status| VcpError::backing_store(format!("{path} on {}", self.address), status))?;
        Ok(response.into_inner())
    }

    async fn range(&self, request: RangeRequest) -> Result<RangeResponse> {
        self.unary(request, RANGE).await
    }
}

#[async_trait]
impl KvClient for EtcdClient {
    #[instrument(skip(self, key), fields(key = %String::from_utf8_lossy(key)))]
    async fn get(&self, key: &[u8]) -> Result<Option<KeyValueRecord>> {
        let response = self
            .range(RangeRequest {
                key: key.to_vec(),
                limit: 1,
                ..Default::default()
            })
            .await?;
        Ok(response
            .kvs
            .into_iter()
            .next()
            .map(|kv| KeyValueRecord::new(kv.key, kv.value)))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _: PutResponse = self
            .unary(
                PutRequest {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    ..Default::default()
                },
                PUT,
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, prefix), fields(prefix = %String::from_utf8_lossy(prefix)))]
    async fn delete_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let response: DeleteRangeResponse = self
            .unary(
                DeleteRangeRequest {
                    key: range_start(prefix),
                    range_end: prefix_range_end(prefix),
                    prev_kv: false,
                },
                DELETE_RANGE,
            )
            .await?;
        debug!("Deleted {} keys", response.deleted);
        Ok(response.deleted.max(0) as u64)
    }

    fn list_stream(&self, prefix: &[u8], cancel: CancellationToken) -> ListStream {
        let (tx, rx) = mpsc::channel(LIST_STREAM_BUFFER);
        let client = self.clone();
        let prefix = prefix.to_vec();
        tokio::spawn(async move {
            let range = |request| client.range(request);
            if let Err(e) = list_pages(&prefix, &tx, &cancel, range).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    async fn member_list(&self) -> Result<Vec<Member>> {
        let response: MemberListResponse = self
            .unary(MemberListRequest { linearizable: false }, MEMBER_LIST)
            .await?;
        Ok(response
            .members
            .into_iter()
            .map(|m| Member {
                id: m.id,
                name: m.name,
                client_urls: m.client_urls,
            })
            .collect())
    }
}

/// Connects [`EtcdClient`]s for the bootstrapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdConnector;

#[async_trait]
impl ClientConnector for EtcdConnector {
    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Arc<dyn KvClient>> {
        let client = EtcdClient::connect(endpoint, timeout).await?;
        Ok(Arc::new(client))
    }
}

/// Page through `prefix` with `range`, sending each record to `tx`.
///
/// The revision of the first page is pinned for every later page so
/// keys written during the scan are never included.
async fn list_pages<F, Fut>(
    prefix: &[u8],
    tx: &mpsc::Sender<Result<KeyValueRecord>>,
    cancel: &CancellationToken,
    mut range: F,
) -> Result<()>
where
    F: FnMut(RangeRequest) -> Fut,
    Fut: Future<Output = Result<RangeResponse>>,
{
    let range_end = prefix_range_end(prefix);
    let mut key = range_start(prefix);
    let mut revision = 0;

    loop {
        let request = RangeRequest {
            key: key.clone(),
            range_end: range_end.clone(),
            limit: LIST_PAGE_SIZE,
            revision,
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(VcpError::Cancelled),
            response = range(request) => response.map_err(|e| list_error(prefix, e))?,
        };
        if revision == 0 {
            revision = response.header.as_ref().map_or(0, |h| h.revision);
        }

        let more = response.more;
        let last_key = response.kvs.last().map(|kv| kv.key.clone());
        for kv in response.kvs {
            let record = KeyValueRecord::new(kv.key, kv.value);
            tokio::select! {
                _ = cancel.cancelled() => return Err(VcpError::Cancelled),
                sent = tx.send(Ok(record)) => {
                    if sent.is_err() {
                        // consumer went away
                        return Ok(());
                    }
                }
            }
        }

        match last_key {
            Some(mut last) if more => {
                last.push(0);
                key = last;
            }
            _ => return Ok(()),
        }
    }
}

/// etcd reads an empty key with a `\0` range end as "the whole keyspace".
fn range_start(prefix: &[u8]) -> Vec<u8> {
    if prefix.is_empty() {
        vec![0]
    } else {
        prefix.to_vec()
    }
}

fn list_error(prefix: &[u8], source: VcpError) -> VcpError {
    VcpError::BackingStore {
        message: format!("list keys under {}", String::from_utf8_lossy(prefix)),
        source: Some(Box::new(source)),
    }
}

async fn connect_unix(path: String, timeout: Duration) -> Result<Channel> {
    // The URI is ignored by the connector; tonic only needs a valid one.
    let endpoint = tonic::transport::Endpoint::try_from("http://[::]:50051")
        .map_err(|e| VcpError::backing_store("build unix endpoint", e))?
        .connect_timeout(timeout);
    let socket = path.clone();
    endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?)) }
        }))
        .await
        .map_err(|e| VcpError::backing_store(format!("connect to unix://{path}"), e))
}

async fn connect_http(endpoint: &Endpoint, timeout: Duration) -> Result<Channel> {
    let mut channel = Channel::from_shared(endpoint.address.clone())
        .map_err(|e| VcpError::backing_store(format!("invalid endpoint {endpoint}"), e))?
        .connect_timeout(timeout);

    if let Some(certificates) = &endpoint.certificates {
        let tls = tls_config(certificates).await?;
        channel = channel
            .tls_config(tls)
            .map_err(|e| VcpError::backing_store(format!("configure TLS for {endpoint}"), e))?;
    }

    channel
        .connect()
        .await
        .map_err(|e| VcpError::backing_store(format!("connect to {endpoint}"), e))
}

async fn tls_config(certificates: &Certificates) -> Result<ClientTlsConfig> {
    let read = |path: std::path::PathBuf| async move {
        tokio::fs::read(&path).await.map_err(|e| {
            VcpError::backing_store(format!("read certificate {}", path.display()), e)
        })
    };
    let ca = read(certificates.ca_cert.clone()).await?;
    let cert = read(certificates.client_cert.clone()).await?;
    let key = read(certificates.client_key.clone()).await?;
    Ok(ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key)))
}
