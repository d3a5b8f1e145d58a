//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/?doc=<name>&token=<jwt>
//!             ├── AuthGate ── DocumentRegistry ── DocumentHandle ── CrdtSession
//! Client B ──┘                      │                   │
//!                                   │                   ├── AwarenessTracker
//!                                   │                   └── BroadcastGroup ──► A, B, C
//!                                   ▼
//!                          PersistenceScheduler ── ContentStore (memory | RocksDB)
//! ```
//!
//! One task per connection multiplexes inbound frames, the connection's
//! outbound queue and its heartbeat in a single `select!`.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AuthGate, Grant};
use crate::config::{ConfigError, ServerConfig};
use crate::connection::ConnectionHandle;
use crate::persistence::PersistenceScheduler;
use crate::protocol::CloseReason;
use crate::registry::{Connection, DocumentRegistry, RegistryConfig, ShutdownReport};
use crate::storage::{ContentStore, DocumentStore, MemoryStore, StoreConfig, StoreError};

/// How long open connections get to close after shutdown is requested.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open store: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub refused_updates: u64,
    pub heartbeat_timeouts: u64,
}

/// Connection parameters taken from the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub document: Option<String>,
    pub token: Option<String>,
}

impl ConnectParams {
    /// Read `doc` and `token` from the query string. A request without `doc`
    /// falls back to the path (`/doc-42?token=...`), as y-websocket clients
    /// put the room name there.
    pub fn from_uri(path: &str, query: Option<&str>) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            let value = Some(value.into_owned()).filter(|v| !v.is_empty());
            match key.as_ref() {
                "doc" => params.document = value,
                "token" => params.token = value,
                _ => {}
            }
        }
        if params.document.is_none() {
            let name = path.trim_matches('/');
            if !name.is_empty() {
                params.document = Some(name.to_string());
            }
        }
        params
    }

    /// Check the parameters against the auth gate.
    pub fn authorize(&self, auth: &AuthGate) -> Result<Grant, CloseReason> {
        let token = self.token.as_deref().ok_or(CloseReason::MissingToken)?;
        let document = self.document.as_deref().ok_or(CloseReason::MissingDocument)?;
        auth.verify(token, document).map_err(|e| {
            log::warn!("Rejected token for '{}': {}", document, e);
            CloseReason::InvalidToken
        })
    }
}

/// Everything a connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<DocumentRegistry>,
    auth: Arc<AuthGate>,
    stats: Arc<RwLock<ServerStats>>,
    heartbeat_interval: Duration,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: ConnectionContext,
}

impl SyncServer {
    /// Validate `config` and open the configured store: RocksDB when a storage
    /// path is set, in-memory otherwise.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let store: Arc<dyn ContentStore> = match &config.storage_path {
            Some(path) => Arc::new(DocumentStore::open(StoreConfig::at(path))?),
            None => {
                log::warn!("No storage path configured, documents are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store)
    }

    /// Build a server on top of an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn ContentStore>) -> Result<Self, ServerError> {
        config.validate()?;
        let persistence = Arc::new(PersistenceScheduler::new(
            store,
            config.debounce(),
            config.persistence_timeout(),
        ));
        let registry = DocumentRegistry::new(
            persistence,
            RegistryConfig {
                outbound_capacity: config.outbound_capacity,
                eviction_grace: config.eviction_grace(),
            },
        );
        let ctx = ConnectionContext {
            registry,
            auth: Arc::new(AuthGate::new(&config.jwt_secret)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            heartbeat_interval: config.heartbeat_interval(),
        };
        Ok(Self { config, ctx })
    }

    /// Bind to the configured address and serve until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<ShutdownReport, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then close
    /// every connection and flush every document.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<ShutdownReport, ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let ctx = self.ctx.clone();
                    let stop = stop_rx.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx, stop).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => break,
            }
            while connections.try_join_next().is_some() {}
        }

        log::info!("Shutting down, closing {} connections", connections.len());
        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(CLOSE_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("Connections did not close in time, aborting them");
            connections.abort_all();
        }

        Ok(self.ctx.registry.shutdown().await)
    }

    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.ctx.registry
    }

    pub fn auth(&self) -> &AuthGate {
        &self.ctx.auth
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.message().into(),
    }
}

/// Close a socket that never got registered.
async fn reject(mut ws: WebSocketStream<TcpStream>, addr: SocketAddr, reason: CloseReason, ctx: &ConnectionContext) {
    log::warn!("Rejecting {addr}: {}", reason.message());
    ctx.stats.write().await.rejected_connections += 1;
    if let Err(e) = ws.close(Some(close_frame(reason))).await {
        log::debug!("Close to {addr} failed: {e}");
        return;
    }
    // Wait briefly for the peer's close reply.
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let mut params = ConnectParams::default();
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            params = ConnectParams::from_uri(req.uri().path(), req.uri().query());
            Ok(resp)
        },
    )
    .await?;

    let grant = match params.authorize(&ctx.auth) {
        Ok(grant) => grant,
        Err(reason) => {
            reject(ws, addr, reason, &ctx).await;
            return Ok(());
        }
    };

    let handle = ConnectionHandle::new(grant.user, grant.document, grant.role);
    let Connection {
        handle,
        document,
        mut outbound,
    } = match ctx.registry.connect(handle).await {
        Ok(connection) => connection,
        Err(e) => {
            log::error!("Failed to open document for {addr}: {e}");
            reject(ws, addr, CloseReason::ConnectionError, &ctx).await;
            return Ok(());
        }
    };

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!(
        "WebSocket connection {} from {addr}: {} on '{}' as {}",
        handle.id,
        handle.user,
        handle.document,
        handle.role
    );

    let (mut ws_sender, mut ws_receiver) = ws.split();
    let mut heartbeat = tokio::time::interval(ctx.heartbeat_interval);
    heartbeat.reset(); // skip the immediate first tick
    let mut alive = true;

    let close = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        alive = true;
                        {
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let outcome = document.receive(&handle, &data).await;
                        if outcome.refused {
                            ctx.stats.write().await.refused_updates += 1;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        alive = true;
                        if ws_sender.send(Message::Pong(payload)).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => alive = true,
                    Some(Ok(Message::Text(_))) => {
                        alive = true;
                        log::warn!("Ignoring text frame from {}", handle.id);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {} closed by peer", handle.id);
                        break None;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break None;
                    }
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(bytes) => {
                        if let Err(e) = ws_sender.send(Message::Binary(bytes.to_vec().into())).await {
                            log::debug!("Send to {} failed: {e}", handle.id);
                            break None;
                        }
                    }
                    // Detached by the broadcast group: the client fell behind.
                    None => break Some(close_frame(CloseReason::ConnectionError)),
                }
            }

            _ = heartbeat.tick() => {
                if !alive {
                    log::warn!("Connection {} missed its heartbeat", handle.id);
                    ctx.stats.write().await.heartbeat_timeouts += 1;
                    break Some(close_frame(CloseReason::ConnectionError));
                }
                alive = false;
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break None;
                }
            }

            _ = stop.changed() => {
                break Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                });
            }
        }
    };

    if let Some(frame) = close {
        let _ = ws_sender.send(Message::Close(Some(frame))).await;
    }
    let _ = ws_sender.close().await;

    ctx.registry.disconnect(&document, &handle.id).await;
    ctx.stats.write().await.active_connections -= 1;
    log::info!("Connection {} from {addr} finished", handle.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    fn config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            jwt_secret: "secret".to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_params_from_query() {
        let params = ConnectParams::from_uri("/", Some("doc=doc-42&token=abc.def.ghi"));
        assert_eq!(params.document.as_deref(), Some("doc-42"));
        assert_eq!(params.token.as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_params_percent_decoded() {
        let params = ConnectParams::from_uri("/", Some("doc=team%2Fnotes&token=t"));
        assert_eq!(params.document.as_deref(), Some("team/notes"));
    }

    #[test]
    fn test_params_path_fallback() {
        let params = ConnectParams::from_uri("/doc-7", Some("token=t"));
        assert_eq!(params.document.as_deref(), Some("doc-7"));

        let params = ConnectParams::from_uri("/ignored", Some("doc=doc-8"));
        assert_eq!(params.document.as_deref(), Some("doc-8"));
    }

    #[test]
    fn test_params_missing() {
        let params = ConnectParams::from_uri("/", None);
        assert_eq!(params, ConnectParams::default());
        let params = ConnectParams::from_uri("/", Some("doc=&token="));
        assert_eq!(params, ConnectParams::default());
    }

    #[test]
    fn test_authorize_close_reasons() {
        let auth = AuthGate::new("secret");
        let token = auth
            .issue("u1", "doc-42", Role::Editor, Duration::from_secs(60))
            .unwrap();

        let no_token = ConnectParams { document: Some("doc-42".into()), token: None };
        assert_eq!(no_token.authorize(&auth), Err(CloseReason::MissingToken));

        let no_doc = ConnectParams { document: None, token: Some(token.clone()) };
        assert_eq!(no_doc.authorize(&auth), Err(CloseReason::MissingDocument));

        let wrong_doc = ConnectParams { document: Some("doc-43".into()), token: Some(token.clone()) };
        assert_eq!(wrong_doc.authorize(&auth), Err(CloseReason::InvalidToken));

        let ok = ConnectParams { document: Some("doc-42".into()), token: Some(token) };
        assert_eq!(ok.authorize(&auth).unwrap().user, "u1");
    }

    #[test]
    fn test_close_frame_codes() {
        assert_eq!(u16::from(close_frame(CloseReason::MissingToken).code), 4001);
        assert_eq!(u16::from(close_frame(CloseReason::ConnectionError).code), 4000);
    }

    #[tokio::test]
    async fn test_server_requires_secret() {
        let result = SyncServer::new(ServerConfig::default());
        assert!(matches!(result, Err(ServerError::Config(ConfigError::Empty("jwt_secret")))));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(config()).unwrap();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
        assert_eq!(server.registry().document_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..config()
        })
        .unwrap();
        assert!(server.config().storage_path.is_some());
        assert!(dir.path().join("db").exists());
    }
}
