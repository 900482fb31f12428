//! TFTP Transfer Session
//!
//! A [`TransferSession`] drives one file transfer to completion over its own
//! UDP endpoint, in lockstep: exactly one block is outstanding at a time.
//!
//! - As [`Role::Sender`] it reads blocks from a store reader, sends each as
//!   DATA and waits for the matching ACK before reading the next one.
//! - As [`Role::Receiver`] it waits for the next DATA block, appends it to a
//!   store writer and acknowledges it.
//!
//! A timeout never advances the session: the last packet sent is retransmitted
//! until [`TransferConfig::max_retries`] consecutive timeouts have elapsed, at
//! which point the session ends in [`SessionState::TimedOut`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

use crate::error::{TransferError, io_error_code};
use crate::locks::StoreLocks;
use crate::protocol::{BLOCK_SIZE, MAX_PACKET_SIZE, Packet, TftpErrorCode};
use crate::store::read_chunk;

const TIMEOUT_SECS: u64 = 5;
const MAX_RETRIES: usize = 5;

/// Retry and timeout policy of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long to wait for the next expected packet before retransmitting
    pub timeout: Duration,
    /// Consecutive timeouts on one block after which the session gives up
    pub max_retries: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends DATA, waits for ACKs
    Sender,
    /// Waits for DATA, sends ACKs
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    /// About to read and send the next block
    Sending,
    /// A DATA block (or a write request) is outstanding
    AwaitAck,
    /// Waiting for the next DATA block
    AwaitData,
    Done,
    TimedOut,
    ProtocolError,
    PeerError,
    /// Transport or store failure
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::TimedOut | Self::ProtocolError | Self::PeerError | Self::Failed
        )
    }
}

/// Statistics of a completed transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub blocks: u64,
    pub bytes: u64,
    pub retransmissions: u64,
    pub elapsed: Duration,
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {} blocks, {} retransmitted, {:.3}s",
            self.bytes,
            self.blocks,
            self.retransmissions,
            self.elapsed.as_secs_f64()
        )
    }
}

/// One lockstep transfer between this endpoint and a single peer
#[derive(Debug)]
pub struct TransferSession {
    socket: UdpSocket,
    peer: SocketAddr,
    peer_fixed: bool,
    role: Role,
    state: SessionState,
    /// Sender: block awaiting its ACK. Receiver: last block written.
    block: u16,
    retries: usize,
    last_sent: Vec<u8>,
    final_block: bool,
    config: TransferConfig,
    resource: String,
    locks: Arc<StoreLocks>,
    summary: TransferSummary,
    started: Instant,
}

impl TransferSession {
    /// Create a session talking to `peer` through `socket`
    pub fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        role: Role,
        resource: impl Into<String>,
        config: TransferConfig,
    ) -> Self {
        Self {
            socket,
            peer,
            peer_fixed: true,
            role,
            state: SessionState::Init,
            block: 0,
            retries: 0,
            last_sent: Vec::new(),
            final_block: false,
            config,
            resource: resource.into(),
            locks: StoreLocks::disabled(),
            summary: TransferSummary::default(),
            started: Instant::now(),
        }
    }

    /// Guard store operations with a shared lock registry
    pub fn with_locks(mut self, locks: Arc<StoreLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Let the first reply fix the peer address.
    ///
    /// A client sends its request to the server's well-known port, but the
    /// transfer itself continues with whichever port answers.
    pub fn learn_peer(mut self) -> Self {
        self.peer_fixed = false;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send the packet that opens the exchange and wait for the first answer to it.
    ///
    /// For a sender this is a write request, answered by ACK(0); for a receiver it
    /// is a read request or the ACK(0) accepting a write request, answered by DATA 1.
    /// Either way the packet is retransmitted on timeout like any other.
    pub async fn open(&mut self, packet: &Packet) -> Result<(), TransferError> {
        let bytes = packet.encode()?;
        tracing::debug!("Opening transfer of '{}' with {} to {}", self.resource, packet, self.peer);
        self.transmit(bytes).await?;

        self.state = match self.role {
            Role::Sender => SessionState::AwaitAck,
            Role::Receiver => SessionState::AwaitData,
        };
        Ok(())
    }

    /// Run the sender side until the last block is acknowledged
    pub async fn run_sender<R>(&mut self, reader: &mut R) -> Result<TransferSummary, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            match self.state {
                SessionState::Init | SessionState::Sending => self.send_next_block(reader).await?,
                SessionState::AwaitAck => {
                    self.await_ack().await?;
                    if self.final_block {
                        self.state = SessionState::Done;
                    } else {
                        self.state = SessionState::Sending;
                    }
                }
                SessionState::Done => return Ok(self.finish()),
                state => {
                    return Err(TransferError::ProtocolViolation(format!(
                        "cannot send from state {:?}",
                        state
                    )));
                }
            }
        }
    }

    /// Run the receiver side until a short DATA block has been written and acknowledged
    pub async fn run_receiver<W>(&mut self, writer: &mut W) -> Result<TransferSummary, TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            match self.state {
                SessionState::Init | SessionState::AwaitData => {
                    self.state = SessionState::AwaitData;
                    let payload = self.await_data().await?;
                    let last = payload.len() < BLOCK_SIZE;
                    self.store_block(writer, payload, last).await?;
                    if last {
                        self.state = SessionState::Done;
                    }
                }
                SessionState::Done => return Ok(self.finish()),
                state => {
                    return Err(TransferError::ProtocolViolation(format!(
                        "cannot receive in state {:?}",
                        state
                    )));
                }
            }
        }
    }

    async fn send_next_block<R>(&mut self, reader: &mut R) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.state = SessionState::Sending;
        let locks = Arc::clone(&self.locks);
        let _guard = locks.acquire(&self.resource).await;

        let chunk = match read_chunk(reader, BLOCK_SIZE).await {
            Ok(chunk) => chunk,
            Err(e) => return Err(self.storage_failure(e).await),
        };

        let block = self.block.wrapping_add(1);
        let len = chunk.len();
        let packet = Packet::Data { block, payload: chunk }.encode()?;
        self.transmit(packet).await?;

        self.block = block;
        self.final_block = len < BLOCK_SIZE;
        self.summary.blocks += 1;
        self.summary.bytes += len as u64;
        self.state = SessionState::AwaitAck;
        tracing::trace!("Sent DATA #{} ({} bytes) to {}", block, len, self.peer);
        Ok(())
    }

    async fn store_block<W>(&mut self, writer: &mut W, payload: Vec<u8>, last: bool) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let locks = Arc::clone(&self.locks);
        let _guard = locks.acquire(&self.resource).await;

        let mut written = writer.write_all(&payload).await;
        if last && written.is_ok() {
            written = writer.flush().await;
        }
        if let Err(e) = written {
            return Err(self.storage_failure(e).await);
        }

        let block = self.block.wrapping_add(1);
        self.block = block;
        self.summary.blocks += 1;
        self.summary.bytes += payload.len() as u64;
        self.transmit(Packet::Ack { block }.encode()?).await?;
        tracing::trace!("Stored DATA #{} ({} bytes) from {}", block, payload.len(), self.peer);
        Ok(())
    }

    async fn await_ack(&mut self) -> Result<(), TransferError> {
        let mut deadline = Instant::now() + self.config.timeout;

        loop {
            match self.recv_packet(deadline).await? {
                None => {
                    self.on_timeout().await?;
                    deadline = Instant::now() + self.config.timeout;
                }
                Some(Packet::Ack { block }) if block == self.block => {
                    tracing::trace!("ACK #{} from {}", block, self.peer);
                    return Ok(());
                }
                Some(Packet::Ack { block }) => {
                    // Stale or duplicate: keep waiting, deadline unchanged.
                    tracing::debug!("Ignoring ACK #{} from {} while waiting for #{}", block, self.peer, self.block);
                }
                Some(Packet::Error { code, message }) => return Err(self.peer_error(code, message)),
                Some(other) => {
                    let reason = format!("unexpected {} while waiting for ACK #{}", other.opcode(), self.block);
                    return Err(self.violation(reason).await);
                }
            }
        }
    }

    async fn await_data(&mut self) -> Result<Vec<u8>, TransferError> {
        let expected = self.block.wrapping_add(1);
        let mut deadline = Instant::now() + self.config.timeout;

        loop {
            match self.recv_packet(deadline).await? {
                None => {
                    self.on_timeout().await?;
                    deadline = Instant::now() + self.config.timeout;
                }
                Some(Packet::Data { block, payload }) if block == expected => return Ok(payload),
                Some(Packet::Data { block, .. }) => {
                    let reason = format!("unexpected DATA #{}, expected #{}", block, expected);
                    return Err(self.violation(reason).await);
                }
                Some(Packet::Error { code, message }) => return Err(self.peer_error(code, message)),
                Some(other) => {
                    let reason = format!("unexpected {} while waiting for DATA #{}", other.opcode(), expected);
                    return Err(self.violation(reason).await);
                }
            }
        }
    }

    /// Receive the next packet from the peer, or `None` once `deadline` passes.
    ///
    /// Datagrams from any other source are answered with an unknown transfer
    /// ID error and dropped.
    async fn recv_packet(&mut self, deadline: Instant) -> Result<Option<Packet>, TransferError> {
        // One spare byte so an oversized datagram is seen as such
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];

        loop {
            let (len, src) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(self.fail(SessionState::Failed, TransferError::Transport(e))),
                Ok(Ok(received)) => received,
            };

            // Until the peer's port is known, only its address is checked
            let known = if self.peer_fixed {
                src == self.peer
            } else {
                src.ip() == self.peer.ip()
            };
            if !known {
                tracing::debug!("Datagram from unknown transfer ID {} (peer is {})", src, self.peer);
                self.send_error_to(src, TftpErrorCode::UnknownTransferId, TftpErrorCode::UnknownTransferId.default_message())
                    .await;
                continue;
            }

            match Packet::decode(&buf[..len]) {
                Ok(packet) => {
                    if !self.peer_fixed {
                        tracing::debug!("Transfer of '{}' continues with {}", self.resource, src);
                        self.peer = src;
                        self.peer_fixed = true;
                    }
                    return Ok(Some(packet));
                }
                Err(e) if self.peer_fixed => return Err(self.violation(e.to_string()).await),
                Err(e) => tracing::debug!("Dropping undecodable datagram from {}: {}", src, e),
            }
        }
    }

    async fn on_timeout(&mut self) -> Result<(), TransferError> {
        self.retries += 1;
        let block = self.pending_block();

        if self.retries >= self.config.max_retries {
            tracing::warn!(
                "Giving up on '{}' with {}: no answer for block {} after {} attempts",
                self.resource,
                self.peer,
                block,
                self.retries
            );
            let err = TransferError::Timeout {
                block,
                attempts: self.retries,
            };
            return Err(self.fail(SessionState::TimedOut, err));
        }

        tracing::debug!(
            "Timeout on block {} with {}, retransmitting (attempt {}/{})",
            block,
            self.peer,
            self.retries + 1,
            self.config.max_retries
        );
        if self.last_sent.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.socket.send_to(&self.last_sent, self.peer).await {
            return Err(self.fail(SessionState::Failed, TransferError::Transport(e)));
        }
        self.summary.retransmissions += 1;
        Ok(())
    }

    /// Send a new packet to the peer; it becomes the one retransmitted on timeout
    async fn transmit(&mut self, bytes: Vec<u8>) -> Result<(), TransferError> {
        if let Err(e) = self.socket.send_to(&bytes, self.peer).await {
            return Err(self.fail(SessionState::Failed, TransferError::Transport(e)));
        }
        self.last_sent = bytes;
        self.retries = 0;
        Ok(())
    }

    /// Block number the session is currently waiting on
    fn pending_block(&self) -> u16 {
        match self.role {
            Role::Sender => self.block,
            Role::Receiver => self.block.wrapping_add(1),
        }
    }

    async fn send_error_to(&self, dest: SocketAddr, code: TftpErrorCode, message: &str) {
        let packet = match Packet::error(code, message).encode() {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Cannot encode error packet: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&packet, dest).await {
            tracing::debug!("Failed to send error to {}: {}", dest, e);
        }
    }

    async fn violation(&mut self, reason: String) -> TransferError {
        tracing::warn!("Protocol violation by {} on '{}': {}", self.peer, self.resource, reason);
        self.send_error_to(self.peer, TftpErrorCode::IllegalOperation, &reason).await;
        self.fail(SessionState::ProtocolError, TransferError::ProtocolViolation(reason))
    }

    async fn storage_failure(&mut self, err: std::io::Error) -> TransferError {
        tracing::warn!("Store failure on '{}': {}", self.resource, err);
        self.send_error_to(self.peer, io_error_code(&err), &err.to_string()).await;
        self.fail(SessionState::Failed, TransferError::Storage(err))
    }

    fn peer_error(&mut self, code: u16, message: String) -> TransferError {
        tracing::info!("{} aborted transfer of '{}': {} {}", self.peer, self.resource, code, message);
        self.fail(SessionState::PeerError, TransferError::PeerError { code, message })
    }

    fn fail(&mut self, state: SessionState, err: TransferError) -> TransferError {
        self.state = state;
        err
    }

    fn finish(&mut self) -> TransferSummary {
        self.summary.elapsed = self.started.elapsed();
        self.summary.clone()
    }
}
