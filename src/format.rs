//! Firmware file formats
use std::{fmt, path::Path, str};

use crate::constants::{MAX_IMAGE_SIZE, PADDING_BYTE, PROGRAM_CHUNK_SIZE};
use crate::protocol::checksum;
use crate::{Error, HexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    Binary,
}

/// A flash image starting at address 0, padded with 0xFF to whole program chunks.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    data: Vec<u8>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({} bytes, sum 0x{:04x})", self.len(), self.checksum())
    }
}

impl Image {
    pub fn new(mut data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_IMAGE_SIZE {
            return Err(Error::ImageTooLarge {
                size: data.len(),
                capacity: MAX_IMAGE_SIZE,
            });
        }
        let padded = data.len().div_ceil(PROGRAM_CHUNK_SIZE) * PROGRAM_CHUNK_SIZE;
        data.resize(padded, PADDING_BYTE);
        Ok(Image { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 16-bit wrapping sum the MCU reports after the last chunk.
    pub fn checksum(&self) -> u16 {
        checksum(&self.data)
    }

    pub fn check_capacity(&self, capacity: usize) -> Result<()> {
        if self.len() > capacity {
            return Err(Error::ImageTooLarge {
                size: self.len(),
                capacity,
            });
        }
        Ok(())
    }
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Image> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::IntelHex => {
            let text = str::from_utf8(&raw).map_err(|e| {
                let line = raw[..e.valid_up_to()].iter().filter(|&&c| c == b'\n').count() + 1;
                HexError::BadChar(line)
            })?;
            read_ihex(text)
        }
        FirmwareFormat::Binary => Image::new(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "ihx", "h86", "hex", "a51"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Parse Intel-HEX text into a contiguous image.
///
/// Data records are placed at their absolute address, gaps are filled with
/// 0xFF. Extended segment and linear address records move the base of the
/// records that follow. Start address and unknown records are skipped.
pub fn read_ihex(data: &str) -> Result<Image> {
    use ihex::{ReaderError, Record};

    let mut base_address = 0u32;
    let mut records = vec![];
    let mut eof = false;
    for (index, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lineno = index + 1;
        let record = match Record::from_record_string(line) {
            Ok(record) => record,
            Err(ReaderError::UnsupportedRecordType(kind)) => {
                log::debug!("line {}: skipping record type 0x{:02x}", lineno, kind);
                continue;
            }
            Err(ReaderError::ChecksumMismatch(..)) => {
                return Err(HexError::BadChecksum(lineno).into());
            }
            Err(ReaderError::MissingStartCode | ReaderError::ContainsInvalidCharacters) => {
                return Err(HexError::BadChar(lineno).into());
            }
            Err(e) => {
                log::debug!("line {}: {}", lineno, e);
                return Err(HexError::Truncated(lineno).into());
            }
        };

        use Record::*;
        match record {
            Data { offset, value } => {
                records.push((base_address + u32::from(offset), value));
            }
            EndOfFile => {
                eof = true;
                break;
            }
            ExtendedSegmentAddress(address) => {
                base_address = u32::from(address) * 16;
            }
            ExtendedLinearAddress(address) => {
                base_address = u32::from(address) << 16;
            }
            StartSegmentAddress { .. } | StartLinearAddress(_) => (),
        }
    }
    if !eof {
        return Err(HexError::NoEof.into());
    }
    merge_sections(records)
}

/// Lay sections out from address 0; later sections win on overlap.
fn merge_sections(sections: Vec<(u32, Vec<u8>)>) -> Result<Image> {
    let end = sections
        .iter()
        .map(|(addr, data)| *addr as usize + data.len())
        .max()
        .unwrap_or(0);
    if end > MAX_IMAGE_SIZE {
        return Err(Error::ImageTooLarge {
            size: end,
            capacity: MAX_IMAGE_SIZE,
        });
    }

    let mut binary = vec![PADDING_BYTE; end];
    for (addr, data) in sections {
        binary[addr as usize..][..data.len()].copy_from_slice(&data);
    }
    Image::new(binary)
}

#[cfg(test)]
mod tests {
    use ihex::Record;

    use super::*;

    const S5: &str = ":10010000214601360121470136007EFE09D2190140";

    fn with_eof(lines: &[&str]) -> String {
        let mut text = lines.join("\n");
        text.push_str("\n:00000001FF\n");
        text
    }

    fn to_ihex(bytes: &[u8]) -> String {
        let mut records: Vec<Record> = bytes
            .chunks(16)
            .enumerate()
            .map(|(i, chunk)| Record::Data {
                offset: (i * 16) as u16,
                value: chunk.to_vec(),
            })
            .collect();
        records.push(Record::EndOfFile);
        ihex::create_object_file_representation(&records).unwrap()
    }

    #[test]
    fn parse_single_record() {
        let image = read_ihex(&with_eof(&[S5])).unwrap();
        assert_eq!(image.len(), 0x180);
        assert!(image.as_bytes()[..0x100].iter().all(|&b| b == 0xff));
        assert_eq!(
            image.as_bytes()[0x100..0x110],
            [
                0x21, 0x46, 0x01, 0x36, 0x01, 0x21, 0x47, 0x01, 0x36, 0x00, 0x7e, 0xfe, 0x09, 0xd2,
                0x19, 0x01
            ]
        );
        assert!(image.as_bytes()[0x110..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn bad_checksum() {
        let line = S5.replace("0140", "0141");
        assert!(matches!(
            read_ihex(&with_eof(&[&line])),
            Err(Error::HexParse(HexError::BadChecksum(1)))
        ));
    }

    #[test]
    fn bad_char() {
        let line = S5.replace("7EFE", "7EXE");
        assert!(matches!(
            read_ihex(&with_eof(&[":0100000000FF", &line])),
            Err(Error::HexParse(HexError::BadChar(2)))
        ));
        assert!(matches!(
            read_ihex(&with_eof(&[&S5[1..]])),
            Err(Error::HexParse(HexError::BadChar(1)))
        ));
    }

    #[test]
    fn truncated_record() {
        assert!(matches!(
            read_ihex(&with_eof(&[&S5[..S5.len() - 1]])),
            Err(Error::HexParse(HexError::Truncated(1)))
        ));
        assert!(matches!(
            read_ihex(&with_eof(&[S5, ":0000"])),
            Err(Error::HexParse(HexError::Truncated(2)))
        ));
    }

    #[test]
    fn missing_eof() {
        assert!(matches!(
            read_ihex(S5),
            Err(Error::HexParse(HexError::NoEof))
        ));
    }

    #[test]
    fn gap_is_filled() {
        let text = ihex::create_object_file_representation(&[
            Record::Data {
                offset: 0,
                value: vec![0x02],
            },
            Record::Data {
                offset: 256,
                value: vec![0x12, 0x34],
            },
            Record::EndOfFile,
        ])
        .unwrap();
        let image = read_ihex(&text).unwrap();
        assert_eq!(image.as_bytes()[0], 0x02);
        assert!(image.as_bytes()[1..256].iter().all(|&b| b == 0xff));
        assert_eq!(image.as_bytes()[256..258], [0x12, 0x34]);
        assert_eq!(image.len(), 384);
    }

    #[test]
    fn ihex_round_trip() {
        for len in [1usize, 127, 128, 129, 1000, 0x10000] {
            let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
            let image = read_ihex(&to_ihex(&bytes)).unwrap();
            let mut expected = bytes.clone();
            expected.resize(len.div_ceil(128) * 128, 0xff);
            assert_eq!(image.as_bytes(), &expected[..]);
        }
    }

    #[test]
    fn extended_address_records() {
        let text = ihex::create_object_file_representation(&[
            Record::ExtendedSegmentAddress(0x0010),
            Record::Data {
                offset: 0x0000,
                value: vec![0xaa],
            },
            Record::ExtendedLinearAddress(0x0000),
            Record::Data {
                offset: 0x0000,
                value: vec![0x55],
            },
            Record::StartLinearAddress(0),
            Record::EndOfFile,
        ])
        .unwrap();
        let image = read_ihex(&text).unwrap();
        assert_eq!(image.as_bytes()[0], 0x55);
        assert_eq!(image.as_bytes()[0x100], 0xaa);

        let text = ihex::create_object_file_representation(&[
            Record::ExtendedLinearAddress(0x0001),
            Record::Data {
                offset: 0x0000,
                value: vec![0xaa],
            },
            Record::EndOfFile,
        ])
        .unwrap();
        assert!(matches!(
            read_ihex(&text),
            Err(Error::ImageTooLarge { size: 0x10001, .. })
        ));
    }

    #[test]
    fn unknown_records_are_skipped() {
        let image = read_ihex(&with_eof(&[":00000006FA", S5])).unwrap();
        assert_eq!(image.as_bytes()[0x100], 0x21);
    }

    #[test]
    fn eof_only_is_empty() {
        let image = read_ihex(":00000001FF\n").unwrap();
        assert!(image.is_empty());
    }

    #[test]
    fn capacity() {
        let image = Image::new(vec![0; 300]).unwrap();
        assert_eq!(image.len(), 384);
        assert!(image.check_capacity(4096).is_ok());
        assert!(matches!(
            image.check_capacity(256),
            Err(Error::ImageTooLarge {
                size: 384,
                capacity: 256
            })
        ));
        assert_eq!(image.checksum(), 0xff * 84);
    }

    #[test]
    fn guess_formats() {
        let p = Path::new("blink.ihx");
        assert_eq!(guess_format(p, b""), FirmwareFormat::IntelHex);
        let p = Path::new("blink");
        assert_eq!(guess_format(p, S5.as_bytes()), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(p, &[0x02, 0x00, 0x06]), FirmwareFormat::Binary);
        assert_eq!(guess_format(p, b""), FirmwareFormat::Binary);
    }
}
