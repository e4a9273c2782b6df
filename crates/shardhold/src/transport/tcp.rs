//! TCP transport between nodes.
//!
//! Frames are length-delimited MessagePack. Each request carries an id that
//! the response echoes, so one connection carries many concurrent calls.
//! [`TcpServer`] exposes a region and/or a coordinator; [`TcpTransport`] is
//! the pooled client side and [`RemoteCoordinatorClient`] wraps it for
//! regions whose coordinator lives on another node.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{AssignmentTable, ShardLocation};
use crate::envelope::{decode, encode, CommandEnvelope, InboundCommand};
use crate::error::ClusterError;
use crate::reply::{Failure, Reply};
use crate::transport::{CoordinatorClient, RegionEndpoint, RegionTransport};
use crate::types::{RegionAddress, ShardId};

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;
const OUTBOUND_QUEUE: usize = 256;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRequest {
    id: u64,
    body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RequestBody {
    Forward(CommandEnvelope),
    Handoff(ShardId),
    Ping,
    Inbound(InboundCommand),
    Allocate {
        shard: ShardId,
        requester: RegionAddress,
    },
    Lookup(ShardId),
    Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResponse {
    id: u64,
    body: Result<WireValue, Failure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireValue {
    Bytes(Vec<u8>),
    Count(usize),
    Pong,
    Reply(Reply),
    Region(RegionAddress),
    Location(Option<ShardLocation>),
    Table(AssignmentTable),
}

fn unavailable(
    address: &RegionAddress,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
) -> ClusterError {
    ClusterError::RegionUnavailable {
        address: address.clone(),
        source,
    }
}

fn unexpected(value: WireValue) -> ClusterError {
    ClusterError::MalformedMessage {
        reason: format!("unexpected response {value:?}"),
        source: None,
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Serves a region endpoint and/or a coordinator over TCP.
#[derive(Default)]
pub struct TcpServer {
    region: Option<Arc<dyn RegionEndpoint>>,
    coordinator: Option<Arc<dyn CoordinatorClient>>,
}

impl TcpServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: Arc<dyn RegionEndpoint>) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<dyn CoordinatorClient>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Accept connections until cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(local) = listener.local_addr() {
            info!(address = %local, "tcp server listening");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            server.serve_connection(stream, cancel).await;
                            debug!(peer = %peer, "connection closed");
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, cancel: CancellationToken) {
        let _ = stream.set_nodelay(true);
        let (mut sink, mut frames) = Framed::new(stream, codec()).split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "failed to write response");
                    break;
                }
            }
        });

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(error = %e, "failed to read request");
                    break;
                }
                None => break,
            };
            let request: WireRequest = match decode(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "dropping connection after undecodable request");
                    break;
                }
            };

            let server = Arc::clone(&self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let body = server.dispatch(request.body).await;
                let response = WireResponse {
                    id: request.id,
                    body,
                };
                match encode(&response) {
                    Ok(bytes) => {
                        let _ = tx.send(Bytes::from(bytes)).await;
                    }
                    Err(e) => warn!(error = %e, "failed to encode response"),
                }
            });
        }

        drop(tx);
        let _ = writer.await;
    }

    async fn dispatch(&self, body: RequestBody) -> Result<WireValue, Failure> {
        let result = match body {
            RequestBody::Ping => Ok(WireValue::Pong),
            RequestBody::Forward(envelope) => match &self.region {
                Some(region) => region.deliver_local(envelope).await.map(WireValue::Bytes),
                None => Err(ClusterError::Rejected {
                    reason: "node hosts no region".into(),
                }),
            },
            RequestBody::Handoff(shard) => match &self.region {
                Some(region) => region.handoff_shard(shard).await.map(WireValue::Count),
                // Nothing hosted, nothing to hand off.
                None => Ok(WireValue::Count(0)),
            },
            RequestBody::Inbound(command) => match &self.region {
                Some(region) => Ok(WireValue::Reply(region.handle_inbound(command).await)),
                None => Err(ClusterError::Rejected {
                    reason: "node hosts no region".into(),
                }),
            },
            RequestBody::Allocate { shard, requester } => match &self.coordinator {
                Some(c) => c.allocate(shard, &requester).await.map(WireValue::Region),
                None => Err(no_coordinator()),
            },
            RequestBody::Lookup(shard) => match &self.coordinator {
                Some(c) => c.lookup(shard).await.map(WireValue::Location),
                None => Err(no_coordinator()),
            },
            RequestBody::Table => match &self.coordinator {
                Some(c) => c.table().await.map(WireValue::Table),
                None => Err(no_coordinator()),
            },
        };
        result.map_err(|e| Failure::from(&e))
    }
}

fn no_coordinator() -> ClusterError {
    ClusterError::Rejected {
        reason: "node hosts no coordinator".into(),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

type Pending = DashMap<u64, oneshot::Sender<Result<WireValue, Failure>>>;

/// One multiplexed connection to a remote node.
struct Connection {
    outbound: mpsc::Sender<Bytes>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

/// Removes a pending call when the caller gives up.
struct PendingCall<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Connection {
    async fn open(address: &RegionAddress, connect_timeout: Duration) -> Result<Self, ClusterError> {
        let target = format!("{}:{}", address.host, address.port);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| unavailable(address, None))?
            .map_err(|e| unavailable(address, Some(Box::new(e))))?;
        let _ = stream.set_nodelay(true);

        let (mut sink, mut frames) = Framed::new(stream, codec()).split();
        let (outbound, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "failed to write request");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let peer = address.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "connection read failed");
                        break;
                    }
                };
                match decode::<WireResponse>(&frame) {
                    Ok(response) => {
                        if let Some((_, waiter)) = reader_pending.remove(&response.id) {
                            let _ = waiter.send(response.body);
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "undecodable response; closing connection");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every outstanding call.
            reader_pending.clear();
        });

        Ok(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closed,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    async fn call(
        &self,
        address: &RegionAddress,
        body: RequestBody,
    ) -> Result<WireValue, ClusterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode(&WireRequest { id, body })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingCall {
            pending: &self.pending,
            id,
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(unavailable(address, None));
        }
        if self.outbound.send(Bytes::from(frame)).await.is_err() {
            return Err(unavailable(address, None));
        }
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(unavailable(address, None)),
        }
    }
}

/// Pooled TCP client: one connection per remote node.
pub struct TcpTransport {
    connections: DashMap<RegionAddress, Arc<Connection>>,
    /// Per-address locks so concurrent callers open one connection, not many.
    connect_locks: DashMap<RegionAddress, Arc<Mutex<()>>>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            connect_locks: DashMap::new(),
            connect_timeout,
        }
    }

    async fn connection_for(&self, address: &RegionAddress) -> Result<Arc<Connection>, ClusterError> {
        if let Some(conn) = self.live_connection(address) {
            return Ok(conn);
        }

        let lock = self
            .connect_locks
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(conn) = self.live_connection(address) {
            return Ok(conn);
        }

        let conn = Arc::new(Connection::open(address, self.connect_timeout).await?);
        debug!(peer = %address, "connection opened");
        self.connections.insert(address.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    fn live_connection(&self, address: &RegionAddress) -> Option<Arc<Connection>> {
        let conn = self.connections.get(address)?.clone();
        if conn.is_closed() {
            self.connections.remove(address);
            return None;
        }
        Some(conn)
    }

    async fn call(
        &self,
        address: &RegionAddress,
        body: RequestBody,
    ) -> Result<WireValue, ClusterError> {
        let conn = self.connection_for(address).await?;
        let result = conn.call(address, body).await;
        if conn.is_closed() {
            self.connections.remove(address);
        }
        result
    }

    /// Hand an external command to the region at `address`, which routes it.
    #[instrument(skip(self, command), fields(region = %address, owner_key = %command.owner_key))]
    pub async fn send_inbound(
        &self,
        address: &RegionAddress,
        command: InboundCommand,
    ) -> Result<Reply, ClusterError> {
        match self.call(address, RequestBody::Inbound(command)).await? {
            WireValue::Reply(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl RegionTransport for TcpTransport {
    #[instrument(skip(self, envelope), fields(region = %target, request_id = %envelope.request_id))]
    async fn forward(
        &self,
        target: &RegionAddress,
        envelope: CommandEnvelope,
    ) -> Result<Vec<u8>, ClusterError> {
        match self.call(target, RequestBody::Forward(envelope)).await? {
            WireValue::Bytes(bytes) => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    #[instrument(skip(self), fields(region = %target))]
    async fn handoff(&self, target: &RegionAddress, shard: ShardId) -> Result<usize, ClusterError> {
        match self.call(target, RequestBody::Handoff(shard)).await? {
            WireValue::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    async fn ping(&self, target: &RegionAddress) -> Result<(), ClusterError> {
        match self.call(target, RequestBody::Ping).await? {
            WireValue::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Coordinator reached over TCP.
pub struct RemoteCoordinatorClient {
    transport: Arc<TcpTransport>,
    address: RegionAddress,
}

impl RemoteCoordinatorClient {
    pub fn new(transport: Arc<TcpTransport>, address: RegionAddress) -> Self {
        Self { transport, address }
    }
}

#[async_trait]
impl CoordinatorClient for RemoteCoordinatorClient {
    async fn allocate(
        &self,
        shard: ShardId,
        requester: &RegionAddress,
    ) -> Result<RegionAddress, ClusterError> {
        let body = RequestBody::Allocate {
            shard,
            requester: requester.clone(),
        };
        match self.transport.call(&self.address, body).await? {
            WireValue::Region(region) => Ok(region),
            other => Err(unexpected(other)),
        }
    }

    async fn lookup(&self, shard: ShardId) -> Result<Option<ShardLocation>, ClusterError> {
        match self.transport.call(&self.address, RequestBody::Lookup(shard)).await? {
            WireValue::Location(location) => Ok(location),
            other => Err(unexpected(other)),
        }
    }

    async fn table(&self) -> Result<AssignmentTable, ClusterError> {
        match self.transport.call(&self.address, RequestBody::Table).await? {
            WireValue::Table(table) => Ok(table),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_id::RequestId;
    use crate::types::OwnerKey;

    struct Echo;

    #[async_trait]
    impl RegionEndpoint for Echo {
        async fn deliver_local(&self, envelope: CommandEnvelope) -> Result<Vec<u8>, ClusterError> {
            if envelope.command_type == "slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if envelope.command_type == "migrating" {
                return Err(ClusterError::ShardMigrating {
                    shard_id: envelope.shard_id,
                });
            }
            Ok(envelope.payload)
        }

        async fn handoff_shard(&self, _shard: ShardId) -> Result<usize, ClusterError> {
            Ok(3)
        }

        async fn handle_inbound(&self, command: InboundCommand) -> Reply {
            Reply::Success(command.owner_key.as_str().as_bytes().to_vec())
        }
    }

    struct FixedCoordinator;

    #[async_trait]
    impl CoordinatorClient for FixedCoordinator {
        async fn allocate(
            &self,
            _shard: ShardId,
            requester: &RegionAddress,
        ) -> Result<RegionAddress, ClusterError> {
            Ok(requester.clone())
        }

        async fn lookup(&self, _shard: ShardId) -> Result<Option<ShardLocation>, ClusterError> {
            Ok(None)
        }

        async fn table(&self) -> Result<AssignmentTable, ClusterError> {
            Ok(AssignmentTable {
                generation: 4,
                ..Default::default()
            })
        }
    }

    async fn start_server() -> (RegionAddress, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let server = Arc::new(
            TcpServer::new()
                .with_region(Arc::new(Echo))
                .with_coordinator(Arc::new(FixedCoordinator)),
        );
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(listener, cancel.clone()));
        (RegionAddress::new(local.ip().to_string(), local.port()), cancel)
    }

    fn envelope(command_type: &str, payload: Vec<u8>) -> CommandEnvelope {
        CommandEnvelope::new(RequestId(1), OwnerKey::new("k"), command_type, payload, 8)
    }

    #[tokio::test]
    async fn region_calls_roundtrip() {
        let (addr, cancel) = start_server().await;
        let transport = TcpTransport::new(Duration::from_secs(1));

        transport.ping(&addr).await.unwrap();
        assert_eq!(
            transport.forward(&addr, envelope("echo", vec![1, 2])).await.unwrap(),
            vec![1, 2]
        );
        assert_eq!(transport.handoff(&addr, ShardId::new(5)).await.unwrap(), 3);

        let reply = transport
            .send_inbound(
                &addr,
                InboundCommand {
                    owner_key: OwnerKey::new("U1"),
                    command_type: "get".into(),
                    payload: vec![],
                    request_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(reply, Reply::Success(b"U1".to_vec()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn remote_errors_keep_their_kind() {
        let (addr, cancel) = start_server().await;
        let transport = TcpTransport::new(Duration::from_secs(1));
        let err = transport
            .forward(&addr, envelope("migrating", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ShardMigrating { .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_connection() {
        let (addr, cancel) = start_server().await;
        let transport = Arc::new(TcpTransport::new(Duration::from_secs(1)));

        let calls = (0..10u8).map(|i| {
            let transport = Arc::clone(&transport);
            let addr = addr.clone();
            async move {
                let kind = if i % 2 == 0 { "slow" } else { "echo" };
                transport.forward(&addr, envelope(kind, vec![i])).await
            }
        });
        let results = futures::future::join_all(calls).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), vec![i as u8]);
        }
        assert_eq!(transport.connections.len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn remote_coordinator_client() {
        let (addr, cancel) = start_server().await;
        let client = RemoteCoordinatorClient::new(
            Arc::new(TcpTransport::new(Duration::from_secs(1))),
            addr.clone(),
        );
        let requester = RegionAddress::new("node-b", 9);
        assert_eq!(
            client.allocate(ShardId::new(1), &requester).await.unwrap(),
            requester
        );
        assert_eq!(client.lookup(ShardId::new(1)).await.unwrap(), None);
        assert_eq!(client.table().await.unwrap().generation, 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_node_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(Duration::from_millis(200));
        let err = transport
            .ping(&RegionAddress::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::RegionUnavailable { .. }));
    }
}
