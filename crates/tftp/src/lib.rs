//! TFTP (Trivial File Transfer Protocol) Implementation
//!
//! Lockstep file transfer over UDP in octet mode, with:
//! - Read (RRQ) and write (WRQ) requests
//! - A packet codec for the four packet types
//! - Retransmission on timeout with a configurable retry budget
//! - A server with a concurrent (task per request) or a serial dispatcher
//! - A client for downloads and uploads
//! - Pluggable byte stores, on disk below a root directory or in memory
//!
//! # Protocol Organization
//!
//! - [`Packet`] - Request, Data, Ack and Error packets with `encode`/`decode`
//! - [`TftpOpcode`] - Opcodes with their wire values
//! - [`TftpErrorCode`] - Standard error codes with default messages
//! - [`TransferMode`] - Transfer modes (only octet is served)
//! - [`TransferSession`] - The per-transfer state machine used by both sides
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use tftp::{DirStore, TftpServer, TftpServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TftpServerConfig {
//!         bind_address: "0.0.0.0:6969".to_string(),
//!         ..Default::default()
//!     };
//!     let server = TftpServer::bind(config, DirStore::new("./tftp_root")).await?;
//!     server.serve().await
//! }
//! ```
//!
//! # Basic Client Usage
//!
//! ```rust,no_run
//! use tftp::{DirStore, TftpClient, TransferConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = TftpClient::new("127.0.0.1:6969".parse()?, TransferConfig::default());
//!     let store = DirStore::new(".");
//!
//!     let summary = client.get(&store, "boot.img", "boot.img").await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod locks;
mod protocol;
mod server;
mod session;
mod store;

pub use client::*;
pub use error::*;
pub use locks::*;
pub use protocol::*;
pub use server::*;
pub use session::*;
pub use store::*;
