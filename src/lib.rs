//! Read-only TFTP server library.
//!
//! Implements RFC 1350 read requests with the common option extensions
//! (RFC 2347 negotiation, RFC 2348 `blksize`, RFC 2349 `timeout`/`tsize`).
//! The two load-bearing pieces are the per-transfer [`session::ReadSession`]
//! state machine and the [`dispatcher::TftpServer`] that demultiplexes new
//! read requests onto fresh sessions. Sockets are reached through the
//! [`endpoint::SocketFactory`] trait so tests can run against the in-memory
//! network in [`simnet`].

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod netascii;
pub mod options;
pub mod packet;
pub mod session;
pub mod simnet;

pub use dispatcher::{ServerEvent, ServerHandle, TftpServer};
pub use error::{Result, TftpError};
pub use session::{ReadSession, SessionState, TransferLimits};

// RFC 1350 - The TFTP Protocol (Revision 2)
pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard for compatibility
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348 minimum block size
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum block size
pub const MAX_PACKET_SIZE: usize = 65468; // Max block size + 4 byte header
pub const DEFAULT_RETRANSMIT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Mean ACK round trip above which a transfer is reported as slow, in microseconds.
pub const DEFAULT_SLOW_NETWORK_THRESHOLD_US: u64 = 2000;

// TFTP Opcodes (RFC 1350 + RFC 2347)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read Request
    Wrq = 2,   // Write Request
    Data = 3,  // Data
    Ack = 4,   // Acknowledgment
    Error = 5, // Error
    Oack = 6,  // Option Acknowledgment (RFC 2347)
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Oack),
            _ => None,
        }
    }
}

// TFTP Error Codes (RFC 1350; code 8 from RFC 2347)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileAlreadyExists),
            7 => Some(ErrorCode::NoSuchUser),
            8 => Some(ErrorCode::OptionNegotiationFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

// Transfer Mode (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// NETASCII mode - 8-bit ASCII with network line ending conversion
    Netascii,
    /// OCTET mode - Binary transfer without conversion
    Octet,
    /// MAIL mode - Obsolete, recognized only to be rejected
    Mail,
}

impl TransferMode {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(TftpError::Tftp(format!("Unknown transfer mode: {}", s))),
        }
    }
}
