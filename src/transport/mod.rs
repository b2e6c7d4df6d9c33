//! Abstract device transport interface.
use std::time::Duration;

pub use serialport::Parity;

use crate::Result;

pub use self::serial::SerialTransport;

mod serial;

/// Abstraction of the byte channel to the MCU.
///
/// Characters are always 8 data bits and 1 stop bit; only the rate and
/// parity are reconfigured during a session.
pub trait Transport {
    fn configure(&mut self, baudrate: u32, parity: Parity) -> Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout` for the first.
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Drop whatever is pending in the receive buffer.
    fn flush_input(&mut self) -> Result<()>;

    fn set_dtr(&mut self, level: bool) -> Result<()>;
    fn set_rts(&mut self, level: bool) -> Result<()>;
}
