//! Error types of the programmer.
use thiserror::Error;

use crate::device::ProtocolVariant;
use crate::flashing::State;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Intel-HEX parse failures, tagged with the 1-based line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HexError {
    #[error("line {0}: invalid character")]
    BadChar(usize),
    #[error("line {0}: checksum mismatch")]
    BadChecksum(usize),
    #[error("line {0}: truncated record")]
    Truncated(usize),
    #[error("missing end-of-file record")]
    NoEof,
}

/// Coarse classification of [`Error`], kept by a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Timeout,
    FrameCorrupt,
    NoChip,
    UnknownChip,
    UnsupportedProtocol,
    BaudNegotiationFailed,
    InvalidBaudrate,
    EraseTimeout,
    EraseRejected,
    ProgramRejected,
    VerifyMismatch,
    HexParse,
    ImageTooLarge,
    Cancelled,
    ChipDb,
    Sequence,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("corrupt frame: {0}")]
    FrameCorrupt(&'static str),

    #[error("no MCU answered, check wiring and cycle power")]
    NoChip,

    #[error("unknown chip code 0x{0:04x}")]
    UnknownChip(u16),

    #[error("unsupported protocol {0}")]
    UnsupportedProtocol(ProtocolVariant),

    #[error("failed to switch to {0} baud")]
    BaudNegotiation(u32),

    #[error("unsupported baudrate {0}")]
    InvalidBaudrate(u32),

    #[error("erase timed out")]
    EraseTimeout,

    #[error("erase rejected (response 0x{0:02x})")]
    EraseRejected(u8),

    #[error("program rejected at offset 0x{0:04x}")]
    ProgramRejected(usize),

    #[error("verify failed: expected sum 0x{expected:04x}, MCU reported 0x{actual:04x}")]
    VerifyMismatch { expected: u16, actual: u16 },

    #[error("invalid hex file: {0}")]
    HexParse(#[from] HexError),

    #[error("image of {size} bytes does not fit {capacity} bytes of flash")]
    ImageTooLarge { size: usize, capacity: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("chip database: {0}")]
    ChipDb(#[from] serde_yaml::Error),

    #[error("cannot {operation} in state {state:?}")]
    Sequence { operation: &'static str, state: State },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Serial(_) => ErrorKind::Io,
            Error::Timeout => ErrorKind::Timeout,
            Error::FrameCorrupt(_) => ErrorKind::FrameCorrupt,
            Error::NoChip => ErrorKind::NoChip,
            Error::UnknownChip(_) => ErrorKind::UnknownChip,
            Error::UnsupportedProtocol(_) => ErrorKind::UnsupportedProtocol,
            Error::BaudNegotiation(_) => ErrorKind::BaudNegotiationFailed,
            Error::InvalidBaudrate(_) => ErrorKind::InvalidBaudrate,
            Error::EraseTimeout => ErrorKind::EraseTimeout,
            Error::EraseRejected(_) => ErrorKind::EraseRejected,
            Error::ProgramRejected(_) => ErrorKind::ProgramRejected,
            Error::VerifyMismatch { .. } => ErrorKind::VerifyMismatch,
            Error::HexParse(_) => ErrorKind::HexParse,
            Error::ImageTooLarge { .. } => ErrorKind::ImageTooLarge,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::ChipDb(_) => ErrorKind::ChipDb,
            Error::Sequence { .. } => ErrorKind::Sequence,
        }
    }
}
