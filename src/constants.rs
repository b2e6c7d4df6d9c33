//! Wire-level constants of the STC8 ISP boot loader.

/// Start marker of every frame.
pub const FRAME_START: [u8; 2] = [0x46, 0xb9];
/// End marker of every frame.
pub const FRAME_END: u8 = 0x16;
/// Direction byte of host to MCU frames.
pub const HOST2MCU: u8 = 0x6a;
/// Direction byte of MCU to host frames.
pub const MCU2HOST: u8 = 0x68;

/// Direction byte, length field, checksum and end marker.
pub const FRAME_OVERHEAD: usize = 6;
pub const MAX_PAYLOAD_SIZE: usize = 4096;
/// Largest value the length field may carry, command byte included.
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD_SIZE + FRAME_OVERHEAD + 1;

/// Sent repeatedly while the MCU is power cycled into ISP.
pub const SYNC_BYTE: u8 = 0x7f;
/// The factory ISP speaks 2400 8E1 until told otherwise.
pub const SYNC_BAUDRATE: u32 = 2400;
/// Factory calibrated reference clock of the MCU.
pub const FUSER: u32 = 24_000_000;

pub const SUPPORTED_BAUDRATES: [u32; 19] = [
    4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 500000, 576000, 921600, 1000000,
    1152000, 1500000, 2000000, 2500000, 3000000, 3500000, 4000000,
];

/// Echo byte of the status packet sent in response to sync.
pub const STATUS_PACKET: u8 = 0x50;
/// Index of the MCU magic in the status packet, counting the echo byte.
pub const STATUS_MAGIC_OFFSET: usize = 20;
/// Guard bytes following the address of baud check, erase and program commands.
pub const ISP_KEY: [u8; 2] = [0x5a, 0xa5];
/// Status byte of a successful program acknowledgment.
pub const WRITE_OK: u8 = 0x54;
/// Length of the chip UID trailing the erase acknowledgment.
pub const UID_SIZE: usize = 7;

pub const PROGRAM_CHUNK_SIZE: usize = 128;
pub const PADDING_BYTE: u8 = 0xff;
/// 8051 code space.
pub const MAX_IMAGE_SIZE: usize = 0x10000;
