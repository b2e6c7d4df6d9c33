//! MCU Chip definition and the protocol variants of the STC8 boot loaders
use std::fmt;

use serde::{de::Error as _, Deserialize, Serialize};

use crate::constants::{PROGRAM_CHUNK_SIZE, SYNC_BYTE};
use crate::Result;

/// Boot loader dialect spoken by a chip family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    Stc8a,
    Stc8g,
    #[default]
    Stc8h,
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVariant::Stc8a => write!(f, "STC8A"),
            ProtocolVariant::Stc8g => write!(f, "STC8G"),
            ProtocolVariant::Stc8h => write!(f, "STC8H"),
        }
    }
}

/// Command bytes and tuning values of one protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    pub variant: ProtocolVariant,
    pub name: &'static str,
    pub cmd_detect: u8,
    pub cmd_baud_switch: u8,
    pub cmd_baud_verify: u8,
    pub cmd_erase: u8,
    pub cmd_write_begin: u8,
    pub cmd_write_cont: u8,
    pub cmd_terminate: u8,
    /// Bytes carried by a single program command.
    pub chunk_size: usize,
    /// User trim pair sent along with the UART reload value.
    pub trim: [u8; 2],
    /// IAP wait states for the 24MHz reference clock.
    pub iap_wait: u8,
}

const fn stc8(variant: ProtocolVariant, name: &'static str, trim: [u8; 2], iap_wait: u8) -> Protocol {
    Protocol {
        variant,
        name,
        cmd_detect: SYNC_BYTE,
        cmd_baud_switch: 0x01,
        cmd_baud_verify: 0x05,
        cmd_erase: 0x03,
        cmd_write_begin: 0x22,
        cmd_write_cont: 0x02,
        cmd_terminate: 0xff,
        chunk_size: PROGRAM_CHUNK_SIZE,
        trim,
        iap_wait,
    }
}

pub static PROTOCOLS: [Protocol; 3] = [
    stc8(ProtocolVariant::Stc8a, "stc8a8k", [0x9c, 0x00], 0x82),
    stc8(ProtocolVariant::Stc8g, "stc8g", [0x00, 0x80], 0x81),
    stc8(ProtocolVariant::Stc8h, "stc8h", [0x00, 0x80], 0x81),
];

pub fn find_protocol(variant: ProtocolVariant) -> Option<&'static Protocol> {
    PROTOCOLS.iter().find(|p| p.variant == variant)
}

/// MCU Family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub protocol: ProtocolVariant,
    pub description: String,
    pub variants: Vec<Chip>,
}

/// Represents an MCU chip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chip {
    pub name: String,
    /// Magic reported in the ISP status packet.
    #[serde(deserialize_with = "parse_chip_id")]
    pub chip_id: u16,
    /// Filled in from the family.
    #[serde(skip)]
    pub protocol: ProtocolVariant,
    #[serde(deserialize_with = "parse_size")]
    pub flash_size: u32,
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04x})", self.name, self.chip_id)
    }
}

pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/STC8A.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/STC8G.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/STC8H.yaml"))?,
            ],
        })
    }

    /// All chips, with the family protocol applied.
    pub fn chips(&self) -> impl Iterator<Item = Chip> + '_ {
        self.families.iter().flat_map(|family| {
            family.variants.iter().map(move |chip| Chip {
                protocol: family.protocol,
                ..chip.clone()
            })
        })
    }

    pub fn find_chip(&self, chip_id: u16) -> Option<Chip> {
        let chip = self.chips().find(|c| c.chip_id == chip_id)?;
        log::debug!("Find chip family: {}", chip.protocol);
        Some(chip)
    }

    pub fn max_flash_size(&self) -> u32 {
        self.chips().map(|c| c.flash_size).max().unwrap_or(0)
    }
}

fn parse_number(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_chip_id<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_number(&s)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| D::Error::custom(format!("invalid chip id {:?}", s)))
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let kib = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix('K'));
    match kib {
        Some(n) => n.parse::<u32>().ok().and_then(|n| n.checked_mul(1024)),
        None => parse_number(&s),
    }
    .ok_or_else(|| D::Error::custom(format!("error while parsing size {:?}", s)))
}
