//! An emulated STC8 boot loader on the far end of a serial line.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use stc8prog::protocol::{self, Direction};
use stc8prog::transport::{Parity, Transport};
use stc8prog::{Baudrate, Config, Result, Timeouts};

pub const STC8H3K64S4: u16 = 0xf147;
pub const UID: [u8; 7] = [0xf1, 0x47, 0xc4, 0x09, 0x31, 0x5a, 0x6e];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Out,
    In,
}

pub struct FakeChip {
    pub chip_id: u16,
    pub flash: Vec<u8>,
    /// Frames seen on the line, in order.
    pub log: Vec<(Dir, Vec<u8>)>,
    pub host_baudrate: u32,
    pub parity: Option<Parity>,
    pub dtr: Option<bool>,
    pub last_reload: Option<u16>,
    pub terminated: bool,

    /// Sync bytes to swallow before the status packet, i.e. the power cycle.
    pub syncs_before_reply: usize,
    /// Never leave reset.
    pub silent: bool,
    pub ignore_baud_switch: bool,
    /// Take the new rate but never answer the check.
    pub ignore_baud_check: bool,
    pub reject_erase: bool,
    /// Erase without ever acknowledging.
    pub silent_erase: bool,
    /// Refuse the program chunk at this address.
    pub reject_write_at: Option<usize>,
    /// Corrupt the payload of this many upcoming replies.
    pub corrupt_replies: usize,
    /// Added to the reported write sum.
    pub sum_error: u16,

    mcu_baudrate: u32,
    syncs: usize,
    synced: bool,
    inbox: Vec<u8>,
    /// Pending output, tagged with the rate it was sent at.
    rx: VecDeque<(u32, u8)>,
    write_sum: u16,
}

impl FakeChip {
    pub fn new(chip_id: u16) -> Self {
        FakeChip {
            chip_id,
            flash: vec![0x00; 64 * 1024],
            log: vec![],
            host_baudrate: 0,
            parity: None,
            dtr: None,
            last_reload: None,
            terminated: false,
            syncs_before_reply: 5,
            silent: false,
            ignore_baud_switch: false,
            ignore_baud_check: false,
            reject_erase: false,
            silent_erase: false,
            reject_write_at: None,
            corrupt_replies: 0,
            sum_error: 0,
            mcu_baudrate: 2400,
            syncs: 0,
            synced: false,
            inbox: vec![],
            rx: VecDeque::new(),
            write_sum: 0,
        }
    }

    pub fn mcu_baudrate(&self) -> u32 {
        self.mcu_baudrate
    }

    pub fn frames(&self, dir: Dir) -> impl Iterator<Item = &Vec<u8>> + '_ {
        self.log.iter().filter(move |(d, _)| *d == dir).map(|(_, f)| f)
    }

    /// Command bytes of the host frames, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.frames(Dir::Out).map(|f| f[5]).collect()
    }

    fn reply(&mut self, cmd: u8, payload: &[u8]) {
        let mut frame = protocol::encode(Direction::McuToHost, cmd, payload);
        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            frame[5] ^= 0x80;
        }
        self.log.push((Dir::In, frame.clone()));
        let baudrate = self.mcu_baudrate;
        self.rx.extend(frame.into_iter().map(|b| (baudrate, b)));
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let start = self.inbox.windows(3).position(|w| w == [0x46, 0xb9, 0x6a])?;
        self.inbox.drain(..start);
        if self.inbox.len() < 5 {
            return None;
        }
        let total = u16::from_be_bytes([self.inbox[3], self.inbox[4]]) as usize + 2;
        if self.inbox.len() < total {
            return None;
        }
        Some(self.inbox.drain(..total).collect())
    }

    fn handle(&mut self, frame: Vec<u8>) {
        let packet = protocol::decode(Direction::HostToMcu, &frame).expect("malformed host frame");
        self.log.push((Dir::Out, frame));
        let payload = packet.payload();
        match packet.cmd() {
            0x01 => {
                let reload = u16::from_be_bytes([payload[2], payload[3]]);
                self.last_reload = Some(reload);
                if self.ignore_baud_switch {
                    return;
                }
                self.reply(0x01, &[]);
                self.mcu_baudrate = 6_000_000 / (0x1_0000 - u32::from(reload));
            }
            0x05 => {
                assert_eq!(payload, [0x00, 0x00, 0x5a, 0xa5]);
                if !self.ignore_baud_check {
                    self.reply(0x05, &[]);
                }
            }
            0x03 => {
                assert_eq!(payload, [0x00, 0x00, 0x5a, 0xa5]);
                if self.silent_erase {
                    self.flash.fill(0xff);
                } else if self.reject_erase {
                    self.reply(0x83, &[]);
                } else {
                    self.flash.fill(0xff);
                    self.reply(0x03, &UID);
                }
            }
            cmd @ (0x22 | 0x02) => {
                assert_eq!(payload[2..4], [0x5a, 0xa5]);
                let address = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                let data = &payload[4..];
                if self.reject_write_at == Some(address) {
                    self.reply(0x02, &[0x00]);
                    return;
                }
                if cmd == 0x22 {
                    self.write_sum = 0;
                }
                self.flash[address..][..data.len()].copy_from_slice(data);
                self.write_sum = self.write_sum.wrapping_add(protocol::checksum(data));
                let sum = self.write_sum.wrapping_add(self.sum_error).to_be_bytes();
                self.reply(0x02, &[0x54, sum[0], sum[1]]);
            }
            0xff => {
                self.terminated = true;
                self.reply(0xff, &[]);
            }
            cmd => panic!("unexpected command 0x{:02x}", cmd),
        }
    }
}

/// Status packet payload, `0x50` echo first and the magic at 20..22.
pub fn status_packet(chip_id: u16) -> Vec<u8> {
    let mut status: Vec<u8> = (0..48).map(|i| i as u8).collect();
    status[0] = 0x50;
    status[20..22].copy_from_slice(&chip_id.to_be_bytes());
    status
}

/// The status packet as it leaves the MCU.
pub fn status_frame(chip_id: u16) -> Vec<u8> {
    let status = status_packet(chip_id);
    protocol::encode(Direction::McuToHost, status[0], &status[1..])
}

/// Whether a UART at `a` decodes characters sent at `b`.
fn same_rate(a: u32, b: u32) -> bool {
    a.abs_diff(b) * 100 <= b * 3
}

impl Transport for FakeChip {
    fn configure(&mut self, baudrate: u32, parity: Parity) -> Result<()> {
        self.host_baudrate = baudrate;
        self.parity = Some(parity);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            let Some((baudrate, byte)) = self.rx.pop_front() else {
                break;
            };
            // garbage on the line at a mismatched rate
            if !same_rate(self.host_baudrate, baudrate) {
                continue;
            }
            buf[n] = byte;
            n += 1;
        }
        if n == 0 {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !same_rate(self.mcu_baudrate, self.host_baudrate) {
            return Ok(());
        }
        if !self.synced {
            self.syncs += buf.iter().filter(|&&b| b == 0x7f).count();
            if self.syncs >= self.syncs_before_reply && !self.silent {
                // a mangled status packet is repeated on the next sync bytes
                self.synced = self.corrupt_replies == 0;
                self.syncs = 0;
                let status = status_packet(self.chip_id);
                self.reply(status[0], &status[1..]);
            }
            return Ok(());
        }
        self.inbox.extend_from_slice(buf);
        while let Some(frame) = self.take_frame() {
            self.handle(frame);
        }
        Ok(())
    }

    fn flush_input(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.dtr = Some(level);
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }
}

/// Short deadlines, the emulator answers immediately.
pub fn config(baudrate: u32) -> Config {
    Config {
        baudrate: Baudrate::new(baudrate).unwrap(),
        detect_cycles: 50,
        timeouts: Timeouts {
            byte: Duration::from_millis(1),
            frame: Duration::from_millis(50),
            response: Duration::from_millis(50),
            detect_interval: Duration::from_millis(2),
            erase: Duration::from_secs(10),
        },
        ..Config::default()
    }
}
