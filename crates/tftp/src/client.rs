//! TFTP Client
//!
//! [`TftpClient`] downloads a resource from a server into a local
//! [`ByteStore`] ([`get`](TftpClient::get)) or uploads one from it
//! ([`put`](TftpClient::put)). Each call runs a single lockstep session.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::AsyncWrite;
use tokio::net::UdpSocket;

use crate::error::{StoreError, TransferError};
use crate::protocol::Packet;
use crate::session::{Role, TransferConfig, TransferSession, TransferSummary};
use crate::store::{ByteStore, settle_write};

#[derive(Debug, Clone)]
pub struct TftpClient {
    server: SocketAddr,
    config: TransferConfig,
}

impl TftpClient {
    pub fn new(server: SocketAddr, config: TransferConfig) -> Self {
        Self { server, config }
    }

    /// Fetch `remote` from the server into `local`
    ///
    /// The download is staged and only replaces `local` once the transfer
    /// completes. A failed download leaves any existing local file as it was.
    pub async fn get<S: ByteStore>(
        &self,
        store: &S,
        remote: &str,
        local: &str,
    ) -> Result<TransferSummary, TransferError> {
        let mut writer = store.open_for_write(local).await.map_err(|e| access_error(local, e))?;
        let result = self.receive_into(&mut writer, remote).await;
        settle_write(store, local, writer, result).await
    }

    async fn receive_into<W>(&self, writer: &mut W, remote: &str) -> Result<TransferSummary, TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut session = self.session(Role::Receiver, remote).await?;
        session.open(&Packet::read_request(remote)).await?;
        let summary = session.run_receiver(writer).await?;
        tracing::info!("Received '{}' from {}: {}", remote, session.peer(), summary);
        Ok(summary)
    }

    /// Send `local` to the server, stored there as `remote`
    pub async fn put<S: ByteStore>(
        &self,
        store: &S,
        local: &str,
        remote: &str,
    ) -> Result<TransferSummary, TransferError> {
        let mut reader = store.open_for_read(local).await.map_err(|e| match e {
            StoreError::NotFound(_) => TransferError::FileNotFound(local.to_string()),
            other => access_error(local, other),
        })?;

        let mut session = self.session(Role::Sender, remote).await?;
        session.open(&Packet::write_request(remote)).await?;
        let summary = session.run_sender(&mut reader).await?;
        tracing::info!("Sent '{}' to {} as '{}': {}", local, session.peer(), remote, summary);
        Ok(summary)
    }

    async fn session(&self, role: Role, remote: &str) -> Result<TransferSession, TransferError> {
        let any: IpAddr = match self.server {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(any, 0))
            .await
            .map_err(TransferError::Transport)?;

        // The server answers from a fresh port; the first reply fixes it.
        Ok(TransferSession::new(socket, self.server, role, remote, self.config).learn_peer())
    }
}

fn access_error(name: &str, err: StoreError) -> TransferError {
    TransferError::FileAccess {
        name: name.to_string(),
        reason: err.to_string(),
    }
}
