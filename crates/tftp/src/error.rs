//! Error types
//!
//! Every failure a transfer can end with is a [`TransferError`] value returned
//! to the caller. Nothing in this crate terminates the process.

use std::io;

use thiserror::Error;

use crate::protocol::TftpErrorCode;

/// Packet encoding and decoding errors
#[derive(Debug, Error)]
pub enum PacketError {
    /// Datagram too short for its opcode, unknown opcode, or bad field
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// DATA payload larger than one block
    #[error("payload of {0} bytes exceeds the 512 byte block size")]
    PayloadTooLarge(usize),

    /// Text field that cannot be NUL-terminated
    #[error("text field contains a NUL byte: {0:?}")]
    InvalidText(String),
}

/// Byte store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{0}' not found")]
    NotFound(String),

    #[error("access to '{name}' denied: {reason}")]
    AccessDenied { name: String, reason: String },

    /// Name that is empty, absolute or escapes the store root
    #[error("invalid resource name '{0}'")]
    InvalidName(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// The TFTP error code reported to a peer for this failure
    pub fn tftp_code(&self) -> TftpErrorCode {
        match self {
            Self::NotFound(_) => TftpErrorCode::FileNotFound,
            Self::AccessDenied { .. } | Self::InvalidName(_) => TftpErrorCode::AccessViolation,
            Self::Io(e) => io_error_code(e),
        }
    }
}

/// Map an I/O failure on the byte store to the closest TFTP error code
pub fn io_error_code(err: &io::Error) -> TftpErrorCode {
    match err.kind() {
        io::ErrorKind::NotFound => TftpErrorCode::FileNotFound,
        io::ErrorKind::PermissionDenied => TftpErrorCode::AccessViolation,
        io::ErrorKind::StorageFull => TftpErrorCode::DiskFull,
        io::ErrorKind::AlreadyExists => TftpErrorCode::FileAlreadyExists,
        _ => TftpErrorCode::NotDefined,
    }
}

/// Terminal outcome of a failed transfer session
#[derive(Debug, Error)]
pub enum TransferError {
    /// Socket send/receive failure unrelated to a timeout
    #[error("transport failure: {0}")]
    Transport(#[source] io::Error),

    /// No expected packet after the configured number of attempts
    #[error("no response for block {block} after {attempts} attempts")]
    Timeout { block: u16, attempts: usize },

    /// Unexpected opcode, undecodable datagram or out-of-sequence block
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Resource could not be opened
    #[error("cannot access '{name}': {reason}")]
    FileAccess { name: String, reason: String },

    /// The remote side sent an ERROR packet
    #[error("peer reported error {code}: {message}")]
    PeerError { code: u16, message: String },

    /// Store read/write failure in the middle of a transfer
    #[error("storage failure: {0}")]
    Storage(#[source] io::Error),

    /// Request refused before a session was started
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Codec(#[from] PacketError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_codes() {
        assert_eq!(
            StoreError::NotFound("a".to_string()).tftp_code(),
            TftpErrorCode::FileNotFound
        );
        assert_eq!(
            StoreError::InvalidName("../a".to_string()).tftp_code(),
            TftpErrorCode::AccessViolation
        );
        assert_eq!(
            StoreError::Io(io::Error::from(io::ErrorKind::StorageFull)).tftp_code(),
            TftpErrorCode::DiskFull
        );
        assert_eq!(
            StoreError::Io(io::Error::other("boom")).tftp_code(),
            TftpErrorCode::NotDefined
        );
    }

    #[test]
    fn test_transfer_error_display() {
        let err = TransferError::Timeout { block: 3, attempts: 5 };
        assert_eq!(err.to_string(), "no response for block 3 after 5 attempts");

        let err = TransferError::PeerError {
            code: 1,
            message: "File not found".to_string(),
        };
        assert_eq!(err.to_string(), "peer reported error 1: File not found");
    }
}
