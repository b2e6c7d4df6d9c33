//! Session configuration.
use std::{fmt, str::FromStr, time::Duration};

use crate::constants::SUPPORTED_BAUDRATES;
use crate::{Error, Result};

const MIN_ERASE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERASE_TIMEOUT: Duration = Duration::from_secs(15);

/// A programming bit rate the boot loader can be switched to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Baudrate(u32);

impl Baudrate {
    pub const DEFAULT: Baudrate = Baudrate(115200);

    pub fn new(rate: u32) -> Result<Self> {
        if SUPPORTED_BAUDRATES.contains(&rate) {
            Ok(Baudrate(rate))
        } else {
            Err(Error::InvalidBaudrate(rate))
        }
    }

    pub fn all() -> impl Iterator<Item = Baudrate> {
        SUPPORTED_BAUDRATES.iter().copied().map(Baudrate)
    }
}

impl Default for Baudrate {
    fn default() -> Self {
        Baudrate::DEFAULT
    }
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        value.0
    }
}

impl fmt::Display for Baudrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accepts `115200`, `1_000_000`, `500k` and `1m` style rates.
impl FromStr for Baudrate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().replace('_', "").to_ascii_lowercase();
        let (digits, scale) = match s.strip_suffix('m') {
            Some(digits) => (digits, 1_000_000),
            None => match s.strip_suffix('k') {
                Some(digits) => (digits, 1_000),
                None => (s.as_str(), 1),
            },
        };
        let rate = digits
            .parse::<u32>()
            .ok()
            .and_then(|n| n.checked_mul(scale))
            .ok_or_else(|| format!("invalid baudrate {:?}", s))?;
        Baudrate::new(rate).map_err(|_| {
            let valid: Vec<String> = Baudrate::all().map(|b| b.to_string()).collect();
            format!("unsupported baudrate {}, choose one of: {}", rate, valid.join(", "))
        })
    }
}

/// Deadlines used while talking to the boot loader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Longest silence within a frame before the scan restarts.
    pub byte: Duration,
    /// Deadline for the body of a frame once its header arrived.
    pub frame: Duration,
    /// Wait for an ordinary command response to start.
    pub response: Duration,
    /// Wait for the status packet after each sync byte.
    pub detect_interval: Duration,
    /// Wait for the mass erase acknowledgment, clamped to 5..=15s.
    pub erase: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            byte: Duration::from_millis(100),
            frame: Duration::from_millis(1000),
            response: Duration::from_millis(1000),
            detect_interval: Duration::from_millis(30),
            erase: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub baudrate: Baudrate,
    /// Mass erase before programming.
    pub erase: bool,
    /// Leave ISP and start the application at the end of the session.
    pub terminate: bool,
    /// Log every frame as a hex trace line.
    pub trace: bool,
    /// DTR level driven before sync, untouched when `None`.
    pub dtr: Option<bool>,
    /// RTS level driven before sync, untouched when `None`.
    pub rts: Option<bool>,
    /// Sync bytes sent before giving up on detection.
    pub detect_cycles: usize,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            baudrate: Baudrate::DEFAULT,
            erase: false,
            terminate: false,
            trace: false,
            dtr: None,
            rts: None,
            detect_cycles: 1000,
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    pub fn erase_timeout(&self) -> Duration {
        self.timeouts.erase.clamp(MIN_ERASE_TIMEOUT, MAX_ERASE_TIMEOUT)
    }
}
