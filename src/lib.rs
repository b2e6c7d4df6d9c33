//! STC8 ISP Protocol implementation.

pub mod config;
pub mod constants;
pub mod device;
mod error;
pub mod flashing;
pub mod format;
pub mod protocol;
pub mod transport;

pub use self::config::{Baudrate, Config, Timeouts};
pub use self::device::{Chip, ChipDB, Protocol, ProtocolVariant};
pub use self::error::{Error, ErrorKind, HexError, Result};
pub use self::flashing::{Flashing, Progress, State};
pub use self::format::Image;
pub use self::protocol::{Codec, Command, Packet};
pub use self::transport::Transport;
