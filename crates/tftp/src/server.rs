//! TFTP Server Implementation
//!
//! The server listens on a well-known port for read and write requests and
//! runs each accepted request as a [`TransferSession`] on its own ephemeral
//! socket. Two dispatch strategies are available:
//!
//! - [`DispatchMode::Threaded`] spawns one task per request, up to
//!   [`TftpServerConfig::max_sessions`] at once.
//! - [`DispatchMode::Serial`] runs one session at a time, to completion,
//!   before looking at the listening socket again.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use crate::error::TransferError;
use crate::locks::{LockPolicy, StoreLocks};
use crate::protocol::{Packet, RequestKind, TftpErrorCode, TransferMode};
use crate::session::{Role, TransferConfig, TransferSession, TransferSummary};
use crate::store::{ByteStore, settle_write};

/// How accepted requests are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DispatchMode {
    /// One task per request, sessions run concurrently
    #[default]
    Threaded,
    /// One session at a time, run inline by the dispatch loop
    Serial,
}

impl DispatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Threaded => "threaded",
            Self::Serial => "serial",
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threaded" | "thread" => Ok(Self::Threaded),
            "serial" | "select" => Ok(Self::Serial),
            _ => Err(format!("Unknown dispatch mode: {}", s)),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct TftpServerConfig {
    pub bind_address: String,
    pub dispatch: DispatchMode,
    pub transfer: TransferConfig,
    /// Ignored by the serial dispatcher, which never locks
    pub lock_policy: LockPolicy,
    /// Concurrent sessions accepted by the threaded dispatcher
    pub max_sessions: usize,
    /// Address transfer sockets are bound to; unspecified when `None`
    pub local_bind: Option<IpAddr>,
}

impl Default for TftpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6969".to_string(),
            dispatch: DispatchMode::default(),
            transfer: TransferConfig::default(),
            lock_policy: LockPolicy::default(),
            max_sessions: 64,
            local_bind: None,
        }
    }
}

/// Client addresses with a session in progress
#[derive(Debug, Default)]
pub struct ActiveSessions {
    clients: Mutex<HashSet<SocketAddr>>,
}

impl ActiveSessions {
    fn clients(&self) -> MutexGuard<'_, HashSet<SocketAddr>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a session for `client`, or `None` if one is already running
    pub fn register(self: &Arc<Self>, client: SocketAddr) -> Option<SessionTicket> {
        if !self.clients().insert(client) {
            return None;
        }
        Some(SessionTicket {
            client,
            sessions: Arc::clone(self),
        })
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    pub fn contains(&self, client: &SocketAddr) -> bool {
        self.clients().contains(client)
    }
}

/// Keeps a client registered in [`ActiveSessions`] until dropped
#[derive(Debug)]
pub struct SessionTicket {
    client: SocketAddr,
    sessions: Arc<ActiveSessions>,
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.sessions.clients().remove(&self.client);
    }
}

/// A read or write request accepted on the listening socket
#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    kind: RequestKind,
    filename: String,
    mode: String,
}

fn parse_request(buf: &[u8], client: SocketAddr) -> Option<Request> {
    match Packet::decode(buf) {
        Ok(Packet::Request { kind, filename, mode }) => Some(Request { kind, filename, mode }),
        Ok(other) => {
            tracing::debug!("Ignoring {} on the listening socket from {}", other.opcode(), client);
            None
        }
        Err(e) => {
            tracing::debug!("Received malformed packet from {}: {}", client, e);
            None
        }
    }
}

/// Bind an unconnected socket for one transfer
///
/// Every session talks through its own port, which identifies the transfer
/// to the client.
pub async fn create_ephemeral_socket(client: SocketAddr, local_bind: Option<IpAddr>) -> io::Result<UdpSocket> {
    let ip = local_bind.unwrap_or(match client {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });

    let sock = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
    tracing::debug!("Transfer socket bound to {}", sock.local_addr()?);
    Ok(sock)
}

/// Build the listening socket with address reuse
fn bind_listener(bind_address: &str) -> Result<UdpSocket> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", bind_address))?;

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("Failed to create TFTP server socket")?;
    socket
        .set_reuse_address(true)
        .context("Failed to enable address reuse")?;
    socket
        .set_nonblocking(true)
        .context("Failed to set TFTP server socket to non-blocking mode")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind TFTP server socket to {}", addr))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("Failed to convert TFTP server socket to Tokio")
}

/// Everything a session needs from the server, shared by all of them
struct SessionContext<S> {
    store: Arc<S>,
    locks: Arc<StoreLocks>,
    transfer: TransferConfig,
    local_bind: Option<IpAddr>,
}

// Not derived: `S` itself need not be `Clone`.
impl<S> Clone for SessionContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            transfer: self.transfer,
            local_bind: self.local_bind,
        }
    }
}

impl<S: ByteStore> SessionContext<S> {
    /// Run one request to completion and log how it ended
    async fn handle(&self, client: SocketAddr, request: Request) {
        tracing::info!(
            "{} for '{}' in {} mode from {}",
            request.kind.opcode(),
            request.filename,
            request.mode,
            client
        );

        match self.serve_request(client, &request).await {
            Ok(summary) => tracing::info!("Transfer of '{}' with {} complete: {}", request.filename, client, summary),
            Err(e) => tracing::warn!("Transfer of '{}' with {} failed: {}", request.filename, client, e),
        }
    }

    async fn serve_request(&self, client: SocketAddr, request: &Request) -> Result<TransferSummary, TransferError> {
        let socket = create_ephemeral_socket(client, self.local_bind)
            .await
            .map_err(TransferError::Transport)?;

        let supported = TransferMode::from_str_opt(&request.mode).is_some_and(TransferMode::is_supported);
        if !supported {
            let message = format!("Unsupported transfer mode: {}", request.mode);
            send_error(&socket, client, TftpErrorCode::IllegalOperation, &message).await;
            return Err(TransferError::Rejected(message));
        }

        // Locks and writer claims key on the store's name, not the spelling in the request
        let resource = match self.store.resource_key(&request.filename) {
            Ok(resource) => resource,
            Err(e) => {
                let code = e.tftp_code();
                send_error(&socket, client, code, code.default_message()).await;
                return Err(TransferError::FileAccess {
                    name: request.filename.clone(),
                    reason: e.to_string(),
                });
            }
        };

        match request.kind {
            RequestKind::Read => self.serve_read(socket, client, &resource).await,
            RequestKind::Write => self.serve_write(socket, client, &resource).await,
        }
    }

    async fn serve_read(
        &self,
        socket: UdpSocket,
        client: SocketAddr,
        filename: &str,
    ) -> Result<TransferSummary, TransferError> {
        let mut reader = match self.store.open_for_read(filename).await {
            Ok(reader) => reader,
            Err(e) => {
                let code = e.tftp_code();
                send_error(&socket, client, code, code.default_message()).await;
                return Err(match code {
                    TftpErrorCode::FileNotFound => TransferError::FileNotFound(filename.to_string()),
                    _ => TransferError::FileAccess {
                        name: filename.to_string(),
                        reason: e.to_string(),
                    },
                });
            }
        };

        let mut session = TransferSession::new(socket, client, Role::Sender, filename, self.transfer)
            .with_locks(Arc::clone(&self.locks));
        session.run_sender(&mut reader).await
    }

    async fn serve_write(
        &self,
        socket: UdpSocket,
        client: SocketAddr,
        filename: &str,
    ) -> Result<TransferSummary, TransferError> {
        let Some(_claim) = self.locks.claim_writer(filename) else {
            send_error(&socket, client, TftpErrorCode::AccessViolation, "File is being written").await;
            return Err(TransferError::FileAccess {
                name: filename.to_string(),
                reason: "already being written".to_string(),
            });
        };

        let mut writer = match self.store.open_for_write(filename).await {
            Ok(writer) => writer,
            Err(e) => {
                let code = e.tftp_code();
                send_error(&socket, client, code, &e.to_string()).await;
                return Err(TransferError::FileAccess {
                    name: filename.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let mut session = TransferSession::new(socket, client, Role::Receiver, filename, self.transfer)
            .with_locks(Arc::clone(&self.locks));
        let result = match session.open(&Packet::Ack { block: 0 }).await {
            Ok(()) => session.run_receiver(&mut writer).await,
            Err(e) => Err(e),
        };
        settle_write(self.store.as_ref(), filename, writer, result).await
    }
}

/// Best-effort error report to a client
async fn send_error(socket: &UdpSocket, client: SocketAddr, code: TftpErrorCode, message: &str) {
    let packet = match Packet::error(code, message).encode() {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!("Cannot encode error packet: {}", e);
            return;
        }
    };
    if let Err(e) = socket.send_to(&packet, client).await {
        tracing::debug!("Failed to send error to {}: {}", client, e);
    }
}

/// Main TFTP server
pub struct TftpServer<S: ByteStore> {
    config: TftpServerConfig,
    socket: UdpSocket,
    sessions: Arc<ActiveSessions>,
    context: SessionContext<S>,
}

impl<S: ByteStore> TftpServer<S> {
    /// Bind the listening socket. Requests are not read until [`serve`](Self::serve) runs.
    pub async fn bind(config: TftpServerConfig, store: S) -> Result<Self> {
        let socket = bind_listener(&config.bind_address)?;

        let policy = match config.dispatch {
            DispatchMode::Threaded => config.lock_policy,
            DispatchMode::Serial => LockPolicy::None,
        };
        let context = SessionContext {
            store: Arc::new(store),
            locks: Arc::new(StoreLocks::new(policy)),
            transfer: config.transfer,
            local_bind: config.local_bind,
        };

        tracing::info!(
            "TFTP server listening on {} ({} dispatch, {} locking)",
            socket.local_addr().context("Failed to get local address")?,
            config.dispatch,
            policy
        );

        Ok(Self {
            config,
            socket,
            sessions: Arc::new(ActiveSessions::default()),
            context,
        })
    }

    /// Get the address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to get local address")
    }

    /// Registry of running sessions, shared with the dispatch loop
    pub fn sessions(&self) -> Arc<ActiveSessions> {
        Arc::clone(&self.sessions)
    }

    /// Run the dispatch loop. Only fails if the listening socket does.
    pub async fn serve(self) -> Result<()> {
        match self.config.dispatch {
            DispatchMode::Threaded => self.serve_threaded().await,
            DispatchMode::Serial => self.serve_serial().await,
        }
    }

    async fn serve_threaded(self) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_sessions));
        let mut buffer = [0u8; 2048];

        loop {
            let (len, client) = self
                .socket
                .recv_from(&mut buffer)
                .await
                .context("Failed to receive on TFTP server socket")?;

            let Some(request) = parse_request(&buffer[..len], client) else {
                continue;
            };

            let Some(ticket) = self.sessions.register(client) else {
                tracing::debug!("Ignoring duplicate {} from {}", request.kind.opcode(), client);
                continue;
            };

            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                tracing::warn!("Rejecting request from {}: {} sessions active", client, self.config.max_sessions);
                reject_busy(client, self.config.local_bind).await;
                continue;
            };

            let context = self.context.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _ticket = ticket;
                context.handle(client, request).await;
            });
        }
    }

    async fn serve_serial(self) -> Result<()> {
        let mut buffer = [0u8; 2048];

        loop {
            self.socket
                .readable()
                .await
                .context("Failed to wait on TFTP server socket")?;

            let (len, client) = match self.socket.try_recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e).context("Failed to receive on TFTP server socket"),
            };

            let Some(request) = parse_request(&buffer[..len], client) else {
                continue;
            };

            let _ticket = self.sessions.register(client);
            self.context.handle(client, request).await;
        }
    }
}

async fn reject_busy(client: SocketAddr, local_bind: Option<IpAddr>) {
    match create_ephemeral_socket(client, local_bind).await {
        Ok(socket) => send_error(&socket, client, TftpErrorCode::NotDefined, "Server busy").await,
        Err(e) => tracing::debug!("Failed to open socket to reject {}: {}", client, e),
    }
}

/// Bind a server on `config.bind_address` and serve `store` until the socket fails
pub async fn run_tftp_server<S: ByteStore>(config: TftpServerConfig, store: S) -> Result<()> {
    TftpServer::bind(config, store).await?.serve().await
}
