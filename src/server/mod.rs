// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Admin server
//!
//! Accepts operator connections over TCP (mutual TLS when certificates are
//! configured), reads one request per connection, and drives the active
//! [`CommandRegistry`].
//!
//! # Connection handling
//!
//! 1. TLS handshake, bounded by the request timeout
//! 2. Refuse at once if over the connection limit or the client CN is not
//!    accepted; the request is never read
//! 3. Read the request up to the end-of-message byte
//! 4. Parse the envelope and dispatch its command on the blocking pool
//! 5. Send the accumulated reply and close
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fladmin::commands::new_registry_with_builtins;
//! use fladmin::server::{AdminServer, ServerOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Arc::new(new_registry_with_builtins()?);
//! let server = AdminServer::bind(ServerOptions::default(), registry).await?;
//! server.start()?;
//! // ...
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::io::SyncIoBridge;

use crate::config::{
    DEFAULT_ADMIN_HOST, DEFAULT_ADMIN_PORT, DEFAULT_MAX_CONNECTIONS, DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::conn::Connection;
use crate::error::{generate_reference_code, internal_error_message, AdminError, Result};
use crate::proto::{self, ReplyItem, MAX_REQUEST_SIZE};
use crate::registry::CommandRegistry;
use crate::security::locks::{resilient_lock, resilient_read, resilient_write};
use crate::security::tls::{self, CnAllowList};

/// Bound on how long `stop` waits for the accept loop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a refused peer gets to finish its handshake and take the refusal.
const REFUSAL_GRACE: Duration = Duration::from_secs(1);

/// Bytes read and discarded from a refused peer before closing.
const REFUSAL_DRAIN_LIMIT: usize = 64 * 1024;

const SERVER_BUSY: &str = "server busy";

/// Certificate files enabling mutual TLS.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub root_cert: PathBuf,
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    /// Plaintext when `None`.
    pub tls: Option<TlsFiles>,
    /// Empty accepts any verified client.
    pub accepted_client_cns: Vec<String>,
    /// Connections beyond this are answered with `server busy`.
    pub max_connections: usize,
    pub request_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_ADMIN_HOST.to_string(),
            port: DEFAULT_ADMIN_PORT,
            tls: None,
            accepted_client_cns: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// State shared by the accept loop and connection workers.
struct Shared {
    registry: RwLock<Arc<CommandRegistry>>,
    acceptor: Option<TlsAcceptor>,
    allowed_cns: CnAllowList,
    limiter: Arc<Semaphore>,
    request_timeout: Duration,
}

impl Shared {
    fn registry(&self) -> Arc<CommandRegistry> {
        Arc::clone(&resilient_read(&self.registry))
    }
}

/// The admin command server.
pub struct AdminServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown: watch::Sender<bool>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl AdminServer {
    /// Bind the listener. The registry is finalized if it is not already.
    pub async fn bind(options: ServerOptions, registry: Arc<CommandRegistry>) -> Result<Self> {
        if !registry.is_finalized() {
            registry.finalize()?;
        }

        let acceptor = match &options.tls {
            Some(files) => Some(TlsAcceptor::from(tls::server_config(
                &files.cert,
                &files.key,
                &files.root_cert,
            )?)),
            None => None,
        };

        let max_connections = if options.max_connections == 0 {
            tracing::warn!("max_connections must be positive; using 1");
            1
        } else {
            options.max_connections
        };

        let addr = format!("{}:{}", options.host, options.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                AdminError::Config(format!(
                    "admin port {} is already in use; is another server running?",
                    options.port
                ))
            } else {
                AdminError::Config(format!("failed to bind to {}: {}", addr, e))
            }
        })?;
        let local_addr = listener.local_addr()?;

        if acceptor.is_none() {
            tracing::warn!(addr = %local_addr, "admin server is running without TLS");
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(registry),
                acceptor,
                allowed_cns: CnAllowList::new(options.accepted_client_cns),
                limiter: Arc::new(Semaphore::new(max_connections)),
                request_timeout: options.request_timeout,
            }),
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown,
            serve_task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.shared.acceptor.is_some()
    }

    /// The registry currently serving requests.
    pub fn command_registry(&self) -> Arc<CommandRegistry> {
        self.shared.registry()
    }

    /// Start accepting connections on the current runtime.
    pub fn start(&self) -> Result<()> {
        let listener = resilient_lock(&self.listener)
            .take()
            .ok_or_else(|| AdminError::Config("admin server already started".into()))?;

        tracing::info!(addr = %self.local_addr, tls = self.is_tls(), "admin server listening");
        let task = tokio::spawn(serve(
            listener,
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
        ));
        *resilient_lock(&self.serve_task) = Some(task);
        Ok(())
    }

    /// Swap in a new registry.
    ///
    /// The new registry is finalized and active before the old one is closed.
    pub fn set_command_registry(&self, registry: Arc<CommandRegistry>) -> Result<()> {
        if !registry.is_finalized() {
            registry.finalize()?;
        }
        let old = std::mem::replace(&mut *resilient_write(&self.shared.registry), registry);
        if !Arc::ptr_eq(&old, &self.shared.registry()) {
            old.close();
        }
        tracing::info!("command registry replaced");
        Ok(())
    }

    /// Stop accepting, close the registry and wait (bounded) for the accept loop.
    ///
    /// Connections already being served are left to finish on their own.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let task = resilient_lock(&self.serve_task).take();
        if let Some(task) = task {
            match tokio::time::timeout(STOP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("admin accept loop failed: {}", e),
                Err(_) => {
                    tracing::warn!("admin accept loop did not stop within {:?}", STOP_TIMEOUT)
                }
            }
        }
        resilient_lock(&self.listener).take();

        self.shared.registry().close();
        tracing::info!(addr = %self.local_addr, "admin server stopped");
    }
}

// =============================================================================
// ACCEPT LOOP
// =============================================================================

async fn serve(listener: TcpListener, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(Arc::clone(&shared), stream, peer));
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    tracing::debug!("admin accept loop exited");
}

/// What the connection worker decided before dispatch.
enum Inbound {
    Request(Vec<u8>),
    Reject(String),
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let permit = Arc::clone(&shared.limiter).try_acquire_owned().ok();
    let busy = permit.is_none();
    if busy {
        tracing::warn!(peer = %peer, "connection limit reached; rejecting");
    }

    match &shared.acceptor {
        Some(acceptor) => {
            let limit = if busy {
                REFUSAL_GRACE.min(shared.request_timeout)
            } else {
                shared.request_timeout
            };
            let tls_stream = match tokio::time::timeout(limit, acceptor.accept(stream)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    tracing::info!(peer = %peer, "TLS handshake failed: {}", e);
                    return;
                }
                Err(_) => {
                    tracing::info!(peer = %peer, "TLS handshake timed out");
                    return;
                }
            };
            let cn = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|cert| tls::common_name(cert));

            if busy {
                refuse(tls_stream, peer, SERVER_BUSY.to_string()).await;
            } else if !shared.allowed_cns.permits(cn.as_deref()) {
                tracing::warn!(peer = %peer, cn = ?cn, "client common name not accepted");
                let who = cn.unwrap_or_else(|| "<none>".to_string());
                let denied = AdminError::Authentication(format!("client {} is not accepted", who));
                refuse(tls_stream, peer, denied.to_string()).await;
            } else {
                serve_stream(shared, tls_stream, peer, cn).await;
            }
        }
        None if busy => refuse(stream, peer, SERVER_BUSY.to_string()).await,
        None => serve_stream(shared, stream, peer, None).await,
    }
    drop(permit);
}

/// Answer a peer that will not be served, without waiting for its request.
///
/// Whatever the peer already sent is drained (bounded) after the reply so the
/// close does not reset the connection before the reply is read.
async fn refuse<S>(mut stream: S, peer: SocketAddr, message: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = match proto::encode_reply(&[ReplyItem::Error { data: message }]) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(peer = %peer, "failed to encode refusal: {}", e);
            return;
        }
    };
    let sent = tokio::time::timeout(REFUSAL_GRACE, async {
        stream.write_all(&reply).await?;
        stream.shutdown().await
    })
    .await;
    match sent {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(peer = %peer, "failed to send refusal: {}", e);
            return;
        }
        Err(_) => {
            tracing::debug!(peer = %peer, "refusal not sent within {:?}", REFUSAL_GRACE);
            return;
        }
    }

    let _ = tokio::time::timeout(REFUSAL_GRACE, async {
        let mut chunk = [0u8; 4096];
        let mut drained = 0;
        while drained < REFUSAL_DRAIN_LIMIT {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
    })
    .await;
}

/// Read the request and dispatch it on the blocking pool.
///
/// `client_cn` is the verified peer CN on TLS connections.
async fn serve_stream<S>(
    shared: Arc<Shared>,
    stream: S,
    peer: SocketAddr,
    client_cn: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let mut conn = Connection::new(Box::new(SyncIoBridge::new(writer)), Some(peer));
    conn.props.client_cn = client_cn;

    let read = tokio::time::timeout(
        shared.request_timeout,
        proto::read_message(&mut reader, MAX_REQUEST_SIZE),
    )
    .await;
    let inbound = match read {
        Ok(Ok(raw)) => Inbound::Request(raw),
        Ok(Err(e)) => Inbound::Reject(e.to_string()),
        Err(_) => Inbound::Reject(AdminError::Timeout.to_string()),
    };

    let worker = tokio::task::spawn_blocking(move || {
        finish(&shared, &mut conn, inbound);
        drop(reader);
    });
    if let Err(e) = worker.await {
        tracing::error!(peer = %peer, "connection worker failed: {}", e);
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Runs on the blocking pool: dispatch, then send the reply.
fn finish(shared: &Shared, conn: &mut Connection, inbound: Inbound) {
    match inbound {
        Inbound::Reject(msg) => conn.append_error(msg),
        Inbound::Request(raw) => dispatch(shared, conn, &raw),
    }

    if !conn.ended() {
        if let Err(e) = conn.close() {
            tracing::debug!(peer = ?conn.peer(), "failed to send reply: {}", e);
        }
    }
}

fn dispatch(shared: &Shared, conn: &mut Connection, raw: &[u8]) {
    let request = match proto::parse_request(raw) {
        Ok(request) => request,
        Err(e) => {
            conn.append_error(e.to_string());
            return;
        }
    };
    let Some(command) = request.command().map(str::to_string) else {
        conn.append_error(AdminError::Protocol("request has no command".into()).to_string());
        return;
    };
    conn.props.session_token = request.token().map(str::to_string);
    conn.request = serde_json::to_value(&request).ok();

    tracing::debug!(peer = ?conn.peer(), command = %command, "dispatching command");
    let registry = shared.registry();
    let outcome =
        panic::catch_unwind(AssertUnwindSafe(|| registry.process_command(conn, &command)));

    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) if e.is_client_visible() => {
            tracing::info!(peer = ?conn.peer(), command = %command, "command refused: {}", e);
            if !conn.ended() {
                conn.append_error(e.to_string());
            }
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };

    let reference = generate_reference_code();
    tracing::error!(
        peer = ?conn.peer(),
        command = %command,
        reference = %reference,
        "command failed: {}",
        failure
    );
    if !conn.ended() {
        conn.append_error(internal_error_message(&reference));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
