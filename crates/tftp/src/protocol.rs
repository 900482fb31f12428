//! TFTP Packet Codec
//!
//! This module contains the wire format of the protocol: opcodes, error
//! codes, transfer modes and the [`Packet`] type with its encoder and decoder.
//!
//! # Wire Format Overview
//!
//! All 16-bit fields are big-endian. A packet never exceeds
//! [`MAX_PACKET_SIZE`] bytes (a 4-byte header plus up to [`BLOCK_SIZE`] bytes
//! of payload).
//!
//! | Packet  | Layout |
//! |---------|--------|
//! | Request | `opcode(2)` · `filename` · `0` · `mode` · `0` |
//! | Data    | `opcode=3(2)` · `block(2)` · `payload(0..512)` |
//! | Ack     | `opcode=4(2)` · `block(2)` |
//! | Error   | `opcode=5(2)` · `code(2)` · `message` · `0` |

use std::fmt;
use std::str::FromStr;

use crate::error::PacketError;

/// Size of a full DATA payload. A shorter payload ends the transfer.
pub const BLOCK_SIZE: usize = 512;

/// Largest datagram the protocol produces or accepts.
pub const MAX_PACKET_SIZE: usize = BLOCK_SIZE + 4;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
/// Each opcode corresponds to a specific packet format as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Client requests to read a file from the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Client requests to write a file to the server. The server answers
    /// with ACK(0) before the first data block is sent.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Contains a block of file data. Blocks are numbered from 1 and carry up
    /// to 512 bytes; the last packet of a transfer carries less.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges receipt of a data packet. ACK with block number 0
    /// accepts a write request.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the current transfer.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(6), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(TftpOpcode::Acknowledgment.name(), "ACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }

    /// Minimum datagram length for a packet carrying this opcode
    fn min_len(self) -> usize {
        match self {
            Self::ReadRequest | Self::WriteRequest => 2,
            Self::Data | Self::Acknowledgment | Self::Error => 4,
        }
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see the error message
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    ///
    /// Includes names that escape the server's root and files that cannot be
    /// created.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    ///
    /// Sent when the peer breaks the lockstep sequence or sends a packet
    /// that makes no sense in the current state.
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    ///
    /// Packet received from a source other than the session's peer.
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(1), Some(TftpErrorCode::FileNotFound));
    /// assert_eq!(TftpErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
///
/// Only binary (octet) transfers are carried out. `netascii` is recognised so
/// that a request for it can be refused with a meaningful error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode: bytes are transferred as-is.
    Octet,

    /// Text mode with CR-LF line endings. Not supported.
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode from a string
    ///
    /// The comparison is case-insensitive.
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!(TransferMode::from_str_opt("OCTET"), Some(TransferMode::Octet));
    /// assert_eq!(TransferMode::from_str_opt("NetASCII"), Some(TransferMode::NetAscii));
    /// assert!(TransferMode::from_str_opt("binary").is_none());
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }

    /// Check if this transfer mode is supported
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Octet)
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of request opening a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    pub fn opcode(self) -> TftpOpcode {
        match self {
            Self::Read => TftpOpcode::ReadRequest,
            Self::Write => TftpOpcode::WriteRequest,
        }
    }
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// RRQ or WRQ
    Request {
        kind: RequestKind,
        filename: String,
        mode: String,
    },
    /// One block of file content
    Data { block: u16, payload: Vec<u8> },
    /// Acknowledgement of a block (0 accepts a write request)
    Ack { block: u16 },
    /// Error report; terminates the transfer
    Error { code: u16, message: String },
}

impl Packet {
    /// Build an octet-mode read request
    ///
    /// # Examples
    /// ```
    /// use tftp::Packet;
    ///
    /// let rrq = Packet::read_request("boot.img");
    /// let bytes = rrq.encode().unwrap();
    /// assert_eq!(bytes, b"\0\x01boot.img\0octet\0");
    /// assert_eq!(Packet::decode(&bytes).unwrap(), rrq);
    /// ```
    pub fn read_request(filename: impl Into<String>) -> Self {
        Self::Request {
            kind: RequestKind::Read,
            filename: filename.into(),
            mode: TransferMode::Octet.as_str().to_string(),
        }
    }

    /// Build an octet-mode write request
    pub fn write_request(filename: impl Into<String>) -> Self {
        Self::Request {
            kind: RequestKind::Write,
            filename: filename.into(),
            mode: TransferMode::Octet.as_str().to_string(),
        }
    }

    /// Build an error packet with a custom message
    pub fn error(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.as_u16(),
            message: message.into(),
        }
    }

    /// Build an error packet carrying the code's default message
    pub fn error_default(code: TftpErrorCode) -> Self {
        Self::error(code, code.default_message())
    }

    /// The opcode this packet is sent with
    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::Request { kind, .. } => kind.opcode(),
            Self::Data { .. } => TftpOpcode::Data,
            Self::Ack { .. } => TftpOpcode::Acknowledgment,
            Self::Error { .. } => TftpOpcode::Error,
        }
    }

    /// Encode the packet into a datagram
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut v = Vec::with_capacity(MAX_PACKET_SIZE);
        v.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Self::Request { filename, mode, .. } => {
                push_text(&mut v, filename)?;
                push_text(&mut v, mode)?;
            }
            Self::Data { block, payload } => {
                if payload.len() > BLOCK_SIZE {
                    return Err(PacketError::PayloadTooLarge(payload.len()));
                }
                v.extend_from_slice(&block.to_be_bytes());
                v.extend_from_slice(payload);
            }
            Self::Ack { block } => v.extend_from_slice(&block.to_be_bytes()),
            Self::Error { code, message } => {
                v.extend_from_slice(&code.to_be_bytes());
                push_text(&mut v, message)?;
            }
        }

        Ok(v)
    }

    /// Decode a datagram
    ///
    /// The payload of a DATA packet is everything after the header; its
    /// length is the datagram length, whatever bytes it contains.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let raw = get_opcode(buf).ok_or_else(|| PacketError::Malformed("shorter than an opcode".to_string()))?;
        let opcode = TftpOpcode::from_u16(raw).ok_or_else(|| PacketError::Malformed(format!("unknown opcode {raw}")))?;

        if buf.len() < opcode.min_len() {
            return Err(PacketError::Malformed(format!(
                "{} needs at least {} bytes, got {}",
                opcode,
                opcode.min_len(),
                buf.len()
            )));
        }

        let packet = match opcode {
            TftpOpcode::ReadRequest | TftpOpcode::WriteRequest => {
                let (filename, next) = read_text(buf, 2);
                if filename.is_empty() {
                    return Err(PacketError::Malformed("empty filename".to_string()));
                }
                let (mode, _) = read_text(buf, next);
                let kind = if opcode == TftpOpcode::ReadRequest {
                    RequestKind::Read
                } else {
                    RequestKind::Write
                };
                Self::Request { kind, filename, mode }
            }
            TftpOpcode::Data => {
                let payload = &buf[4..];
                if payload.len() > BLOCK_SIZE {
                    return Err(PacketError::Malformed(format!("DATA payload of {} bytes", payload.len())));
                }
                Self::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    payload: payload.to_vec(),
                }
            }
            TftpOpcode::Acknowledgment => Self::Ack {
                block: u16::from_be_bytes([buf[2], buf[3]]),
            },
            TftpOpcode::Error => Self::Error {
                code: u16::from_be_bytes([buf[2], buf[3]]),
                message: read_text(buf, 4).0,
            },
        };

        Ok(packet)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request { kind, filename, mode } => write!(f, "{} '{}' ({})", kind.opcode(), filename, mode),
            Self::Data { block, payload } => write!(f, "DATA #{} ({} bytes)", block, payload.len()),
            Self::Ack { block } => write!(f, "ACK #{}", block),
            Self::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
        }
    }
}

fn push_text(v: &mut Vec<u8>, text: &str) -> Result<(), PacketError> {
    if text.as_bytes().contains(&0) {
        return Err(PacketError::InvalidText(text.to_string()));
    }
    v.extend_from_slice(text.as_bytes());
    v.push(0);
    Ok(())
}

/// Read a text field starting at `start`, stopping at the first NUL or the
/// end of the buffer. Returns the text and the offset after the terminator.
fn read_text(buf: &[u8], start: usize) -> (String, usize) {
    if start >= buf.len() {
        return (String::new(), buf.len());
    }
    match find_zero(buf, start) {
        Some(end) => (String::from_utf8_lossy(&buf[start..end]).into_owned(), end + 1),
        None => (String::from_utf8_lossy(&buf[start..]).into_owned(), buf.len()),
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Get the raw opcode from a datagram
pub fn get_opcode(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}
