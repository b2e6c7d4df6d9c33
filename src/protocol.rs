//! The underlying binary protocol of STC8 ISP
//!
//! Every frame, in wire order:
//!
//! ```text
//! +------+------+-----+--------+-----------------+----------+------+
//! | 0x46 | 0xB9 | dir | length | cmd | payload   | checksum | 0x16 |
//! +------+------+-----+--------+-----------------+----------+------+
//! |  1   |  1   |  1  | 2 (BE) |  1  | variable  |  2 (BE)  |  1   |
//! +------+------+-----+--------+-----------------+----------+------+
//! ```
//!
//! `dir` is 0x6A from host to MCU and 0x68 from MCU to host. `length` counts
//! from `dir` through the end marker. `checksum` is the 16-bit wrapping sum
//! of `dir`, `length`, `cmd` and `payload`.
//!
//! Every frame carries at least the command byte. A well formed frame with
//! `length` 6 has nothing to echo and is reported as an empty frame.

use std::fmt;
use std::time::{Duration, Instant};

use scroll::{Pread, BE};

use crate::config::{Baudrate, Timeouts};
use crate::constants::{
    FRAME_END, FRAME_OVERHEAD, FRAME_START, FUSER, HOST2MCU, ISP_KEY, MAX_FRAME_LEN,
    MAX_PAYLOAD_SIZE, MCU2HOST,
};
use crate::device::Protocol;
use crate::transport::Transport;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    HostToMcu,
    McuToHost,
}

impl Direction {
    pub const fn marker(self) -> u8 {
        match self {
            Direction::HostToMcu => HOST2MCU,
            Direction::McuToHost => MCU2HOST,
        }
    }

    const fn trace_prefix(self) -> char {
        match self {
            Direction::HostToMcu => '>',
            Direction::McuToHost => '<',
        }
    }
}

/// 16-bit wrapping sum, not a CRC.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// UART timer reload value the MCU needs for `baudrate`.
pub fn reload_value(baudrate: Baudrate) -> u16 {
    0x1_0000u32.wrapping_sub(FUSER / 4 / u32::from(baudrate)) as u16
}

pub fn encode(direction: Direction, cmd: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
    let len = FRAME_OVERHEAD + 1 + payload.len();

    let mut buf = Vec::with_capacity(FRAME_START.len() + len);
    buf.extend_from_slice(&FRAME_START);
    buf.push(direction.marker());
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.push(cmd);
    buf.extend_from_slice(payload);
    let sum = checksum(&buf[FRAME_START.len()..]);
    buf.extend_from_slice(&sum.to_be_bytes());
    buf.push(FRAME_END);
    buf
}

/// Validate a complete frame and split it into command and payload.
pub fn decode(direction: Direction, raw: &[u8]) -> Result<Packet> {
    let corrupt = |_| Error::FrameCorrupt("short frame");
    if raw.len() < FRAME_START.len() + FRAME_OVERHEAD {
        return Err(Error::FrameCorrupt("short frame"));
    }
    if raw[..2] != FRAME_START || raw[2] != direction.marker() {
        return Err(Error::FrameCorrupt("bad header"));
    }
    let len = raw.pread_with::<u16>(3, BE).map_err(corrupt)? as usize;
    if len + FRAME_START.len() != raw.len() {
        return Err(Error::FrameCorrupt("length mismatch"));
    }
    if raw[raw.len() - 1] != FRAME_END {
        return Err(Error::FrameCorrupt("bad end marker"));
    }
    let sum_at = raw.len() - 3;
    let expected = raw.pread_with::<u16>(sum_at, BE).map_err(corrupt)?;
    if checksum(&raw[FRAME_START.len()..sum_at]) != expected {
        return Err(Error::FrameCorrupt("checksum mismatch"));
    }
    if sum_at == 5 {
        return Err(Error::FrameCorrupt("empty frame"));
    }
    Ok(Packet {
        cmd: raw[5],
        payload: raw[6..sum_at].to_vec(),
    })
}

/// One line of the debug trace, `> 46 B9 6A ...` or `< 46 B9 68 ...`.
pub fn trace_line(direction: Direction, frame: &[u8]) -> String {
    let mut line = String::with_capacity(2 + frame.len() * 3);
    line.push(direction.trace_prefix());
    for b in frame {
        line.push_str(&format!(" {:02X}", b));
    }
    line
}

/// A decoded frame. `cmd` is the command, or its echo in a response.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    cmd: u8,
    payload: Vec<u8>,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}[{}]", self.cmd, hex::encode(&self.payload))
    }
}

impl Packet {
    pub fn new(cmd: u8, payload: Vec<u8>) -> Self {
        Packet { cmd, payload }
    }

    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// STC8 ISP Command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Load a new UART reload value. Acknowledged at the old rate.
    SwitchBaud { reload: u16 },
    /// Ping at the new rate.
    CheckBaud,
    /// Mass erase the code flash. Returns the chip UID.
    Erase,
    /// Program one chunk. The first chunk of an image opens the write.
    Program {
        address: u16,
        first: bool,
        data: Vec<u8>,
    },
    /// Leave ISP and run the application.
    Terminate,
}

impl Command {
    /// Command byte and payload in the dialect of `protocol`.
    pub fn into_frame(self, protocol: &Protocol) -> (u8, Vec<u8>) {
        match self {
            Command::SwitchBaud { reload } => {
                let mut buf = vec![0x00, 0x00];
                buf.extend_from_slice(&reload.to_be_bytes());
                buf.extend_from_slice(&protocol.trim);
                buf.push(protocol.iap_wait);
                (protocol.cmd_baud_switch, buf)
            }
            Command::CheckBaud => (protocol.cmd_baud_verify, guarded(0)),
            Command::Erase => (protocol.cmd_erase, guarded(0)),
            Command::Program {
                address,
                first,
                data,
            } => {
                let mut buf = guarded(address);
                buf.extend(data);
                let cmd = if first {
                    protocol.cmd_write_begin
                } else {
                    protocol.cmd_write_cont
                };
                (cmd, buf)
            }
            Command::Terminate => (protocol.cmd_terminate, vec![]),
        }
    }
}

/// Address followed by the ISP key.
fn guarded(address: u16) -> Vec<u8> {
    let mut buf = address.to_be_bytes().to_vec();
    buf.extend_from_slice(&ISP_KEY);
    buf
}

/// Frames commands over a [`Transport`] and reads back the responses.
pub struct Codec<T> {
    transport: T,
    timeouts: Timeouts,
    trace: bool,
}

impl<T: Transport> Codec<T> {
    pub fn new(transport: T, timeouts: Timeouts, trace: bool) -> Self {
        Codec {
            transport,
            timeouts,
            trace,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    pub fn send(&mut self, cmd: u8, payload: &[u8]) -> Result<()> {
        let frame = encode(Direction::HostToMcu, cmd, payload);
        self.trace_frame(Direction::HostToMcu, &frame);
        self.transport.write(&frame)
    }

    /// Wait up to `timeout` for a frame to start, then read and validate it.
    ///
    /// Once a header byte shows up the frame deadline applies, so a header
    /// that straddles `timeout` is still picked up.
    pub fn recv(&mut self, timeout: Duration) -> Result<Packet> {
        let mut deadline = Instant::now() + timeout;
        let mut started = false;
        let mut last = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            let byte = self.read_byte(remaining.min(self.timeouts.byte))?;
            if !started && byte.is_some_and(|b| FRAME_START.contains(&b)) {
                started = true;
                deadline = deadline.max(Instant::now() + self.timeouts.frame);
            }
            match byte {
                // silence drops a half seen header
                None => last = None,
                Some(MCU2HOST) if last == Some(FRAME_START[1]) => break,
                Some(b) => last = Some(b),
            }
        }

        let deadline = Instant::now() + self.timeouts.frame;
        let mut raw = Vec::with_capacity(64);
        raw.extend_from_slice(&FRAME_START);
        raw.push(MCU2HOST);
        self.fill(&mut raw, 2, deadline)?;
        let len = u16::from_be_bytes([raw[3], raw[4]]) as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_LEN).contains(&len) {
            self.trace_frame(Direction::McuToHost, &raw);
            return Err(Error::FrameCorrupt("invalid length"));
        }
        let filled = self.fill(&mut raw, len - 3, deadline);
        self.trace_frame(Direction::McuToHost, &raw);
        filled?;
        decode(Direction::McuToHost, &raw)
    }

    pub fn transfer(&mut self, cmd: u8, payload: &[u8], timeout: Duration) -> Result<Packet> {
        self.send(cmd, payload)?;
        let resp = self.recv(timeout)?;
        log::trace!("response to 0x{:02x}: {:?}", cmd, resp);
        Ok(resp)
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let n = self.transport.read(&mut buf, timeout)?;
        Ok((n == 1).then_some(buf[0]))
    }

    fn fill(&mut self, raw: &mut Vec<u8>, count: usize, deadline: Instant) -> Result<()> {
        let mut buf = [0u8; 64];
        let mut remaining = count;
        while remaining > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Error::FrameCorrupt("truncated frame"));
            }
            let want = remaining.min(buf.len());
            let n = self
                .transport
                .read(&mut buf[..want], left.min(self.timeouts.byte))?;
            raw.extend_from_slice(&buf[..n]);
            remaining -= n;
        }
        Ok(())
    }

    fn trace_frame(&self, direction: Direction, frame: &[u8]) {
        if self.trace {
            log::debug!("{}", trace_line(direction, frame));
        }
    }
}
