//! Chip flashing logic.
//!
//! A [`Flashing`] session owns the transport and walks the boot loader
//! through detect, baud switch, erase and program, one request and one
//! response at a time.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use scroll::{Pread, BE};

use crate::config::Config;
use crate::constants::{
    PADDING_BYTE, STATUS_MAGIC_OFFSET, STATUS_PACKET, SYNC_BAUDRATE, SYNC_BYTE, UID_SIZE,
    WRITE_OK,
};
use crate::device::{find_protocol, Chip, ChipDB, Protocol, ProtocolVariant};
use crate::error::ErrorKind;
use crate::format::Image;
use crate::protocol::{checksum, reload_value, Codec, Command, Packet};
use crate::transport::{Parity, SerialTransport, Transport};
use crate::{Error, Result};

/// Where a session stands. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Syncing,
    /// The model behind `chip_id` is kept by [`Flashing::chip`].
    Detected {
        chip_id: u16,
        protocol: ProtocolVariant,
    },
    BaudSwitched,
    Ready,
    Erasing,
    /// Offset of the chunk in flight.
    Programming(usize),
    Done,
    Failed(ErrorKind),
}

/// Reported after every acknowledged program chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub written: usize,
    pub total: usize,
}

pub struct Flashing<T: Transport> {
    codec: Codec<T>,
    config: Config,
    state: State,
    chip: Option<Chip>,
    protocol: Option<&'static Protocol>,
    /// Raw status packet payload
    status: Vec<u8>,
    /// Chip unique identifier, known after erase
    chip_uid: Vec<u8>,
    cancel: Arc<AtomicBool>,
}

impl Flashing<SerialTransport> {
    pub fn new_from_serial(port: &str, config: Config) -> Result<Self> {
        let transport = SerialTransport::open(port)?;
        Ok(Flashing::new(transport, config))
    }
}

impl<T: Transport> Flashing<T> {
    pub fn new(transport: T, config: Config) -> Self {
        Flashing {
            codec: Codec::new(transport, config.timeouts.clone(), config.trace),
            config,
            state: State::Idle,
            chip: None,
            protocol: None,
            status: vec![],
            chip_uid: vec![],
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn chip(&self) -> Option<&Chip> {
        self.chip.as_ref()
    }

    pub fn protocol(&self) -> Option<&'static Protocol> {
        self.protocol
    }

    pub fn status_packet(&self) -> &[u8] {
        &self.status
    }

    pub fn chip_uid(&self) -> &[u8] {
        &self.chip_uid
    }

    /// Setting the flag stops the session at the next step boundary. The
    /// MCU stays in ISP and must be power cycled.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn into_transport(self) -> T {
        self.codec.into_inner()
    }

    /// Run a whole session: detect, switch baud, then erase, program and
    /// terminate as configured.
    pub fn run(&mut self, image: Option<&Image>, progress: impl FnMut(Progress)) -> Result<()> {
        self.detect()?;
        if let Some(image) = image {
            self.check_capacity(image)?;
        }
        self.switch_baudrate()?;
        if self.config.erase {
            self.erase()?;
        }
        if let Some(image) = image {
            self.program(image, progress)?;
        }
        if self.config.terminate {
            self.terminate()?;
        }
        Ok(())
    }

    /// Send sync bytes at 2400 8E1 until the MCU answers with its status
    /// packet, then identify the chip.
    pub fn detect(&mut self) -> Result<()> {
        self.step("detect", |s| s == State::Idle, Self::sync)
    }

    /// Move the link to the configured baudrate.
    pub fn switch_baudrate(&mut self) -> Result<()> {
        self.step(
            "switch baudrate",
            |s| matches!(s, State::Detected { .. }),
            Self::negotiate,
        )
    }

    pub fn erase(&mut self) -> Result<()> {
        self.step("erase", |s| s == State::Ready, Self::erase_code)
    }

    pub fn program(&mut self, image: &Image, progress: impl FnMut(Progress)) -> Result<()> {
        self.step("program", |s| s == State::Ready, |this| {
            this.write_code(image, progress)
        })
    }

    /// Leave ISP and start the application.
    pub fn terminate(&mut self) -> Result<()> {
        self.step(
            "terminate",
            |s| matches!(s, State::Ready | State::Done),
            Self::isp_end,
        )
    }

    pub fn check_capacity(&self, image: &Image) -> Result<()> {
        match &self.chip {
            Some(chip) => image.check_capacity(chip.flash_size as usize),
            None => Err(Error::Sequence {
                operation: "check capacity",
                state: self.state,
            }),
        }
    }

    fn step<R>(
        &mut self,
        operation: &'static str,
        allowed: impl FnOnce(State) -> bool,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        if !allowed(self.state) {
            return Err(Error::Sequence {
                operation,
                state: self.state,
            });
        }
        let result = self.check_cancel().and_then(|()| f(self));
        if let Err(e) = &result {
            log::debug!("{} failed in state {:?}: {}", operation, self.state, e);
            self.state = State::Failed(e.kind());
        }
        result
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn current_protocol(&self) -> Result<&'static Protocol> {
        self.protocol.ok_or(Error::Sequence {
            operation: "use protocol",
            state: self.state,
        })
    }

    fn sync(&mut self) -> Result<()> {
        self.state = State::Syncing;
        let transport = self.codec.transport_mut();
        transport.configure(SYNC_BAUDRATE, Parity::Even)?;
        if let Some(level) = self.config.dtr {
            transport.set_dtr(level)?;
        }
        if let Some(level) = self.config.rts {
            transport.set_rts(level)?;
        }
        transport.flush_input()?;

        log::info!("Waiting for MCU, please cycle power");
        let sync = [SYNC_BYTE];
        let mut corrupted = false;
        for _ in 0..self.config.detect_cycles {
            self.check_cancel()?;
            self.codec.transport_mut().write(&sync)?;
            match self.codec.recv(self.config.timeouts.detect_interval) {
                Ok(packet) if packet.cmd() == STATUS_PACKET => return self.identify(packet),
                Ok(packet) => log::debug!("Ignoring {:?} while syncing", packet),
                Err(Error::Timeout) => (),
                Err(Error::FrameCorrupt(reason)) if !corrupted => {
                    log::warn!("Corrupt status packet ({}), retrying", reason);
                    corrupted = true;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoChip)
    }

    fn identify(&mut self, packet: Packet) -> Result<()> {
        // the magic sits at a fixed offset counted from the echo byte
        let chip_id = packet
            .payload()
            .pread_with::<u16>(STATUS_MAGIC_OFFSET - 1, BE)
            .map_err(|_| Error::FrameCorrupt("short status packet"))?;
        log::debug!("status packet: {:?}", packet);

        let chip = ChipDB::load()?
            .find_chip(chip_id)
            .ok_or(Error::UnknownChip(chip_id))?;
        log::info!("Chip model: {} (CodeFlash: {}KiB)", chip, chip.flash_size / 1024);
        let protocol =
            find_protocol(chip.protocol).ok_or(Error::UnsupportedProtocol(chip.protocol))?;
        log::info!("Protocol: {}", protocol.name);

        self.state = State::Detected {
            chip_id,
            protocol: protocol.variant,
        };
        self.status = packet.payload().to_vec();
        self.chip = Some(chip);
        self.protocol = Some(protocol);
        Ok(())
    }

    fn negotiate(&mut self) -> Result<()> {
        let protocol = self.current_protocol()?;
        let reload = reload_value(self.config.baudrate);
        let baudrate = u32::from(self.config.baudrate);
        log::info!("Switching to {} baud (reload 0x{:04x})", baudrate, reload);

        // acknowledged at the old rate
        let (cmd, payload) = Command::SwitchBaud { reload }.into_frame(protocol);
        let resp = self
            .codec
            .transfer(cmd, &payload, self.config.timeouts.response)
            .map_err(|e| negotiation_failed(e, baudrate))?;
        if resp.cmd() != protocol.cmd_baud_switch {
            log::error!("unexpected baud switch response: {:?}", resp);
            return Err(Error::BaudNegotiation(baudrate));
        }
        self.codec
            .transport_mut()
            .configure(baudrate, Parity::Even)?;
        self.state = State::BaudSwitched;

        let (cmd, payload) = Command::CheckBaud.into_frame(protocol);
        let resp = self
            .codec
            .transfer(cmd, &payload, self.config.timeouts.response)
            .map_err(|e| negotiation_failed(e, baudrate))?;
        if resp.cmd() != protocol.cmd_baud_verify {
            log::error!("unexpected baud check response: {:?}", resp);
            return Err(Error::BaudNegotiation(baudrate));
        }
        log::info!("Link running at {} baud", baudrate);
        self.state = State::Ready;
        Ok(())
    }

    fn erase_code(&mut self) -> Result<()> {
        let protocol = self.current_protocol()?;
        self.state = State::Erasing;
        log::info!("Erasing chip");

        let (cmd, payload) = Command::Erase.into_frame(protocol);
        self.codec.send(cmd, &payload)?;
        let resp = match self.codec.recv(self.config.erase_timeout()) {
            Err(Error::Timeout) => return Err(Error::EraseTimeout),
            resp => resp?,
        };
        if resp.cmd() != protocol.cmd_erase {
            return Err(Error::EraseRejected(resp.cmd()));
        }
        if let Some(uid) = resp.payload().get(..UID_SIZE) {
            self.chip_uid = uid.to_vec();
            log::info!("Chip UID: {}", hex::encode(uid));
        }

        log::info!("Code Flash Erased");
        self.state = State::Ready;
        Ok(())
    }

    fn write_code(&mut self, image: &Image, mut progress: impl FnMut(Progress)) -> Result<()> {
        let protocol = self.current_protocol()?;
        self.check_capacity(image)?;
        if image.is_empty() {
            log::warn!("Empty image, nothing to program");
            self.state = State::Done;
            return Ok(());
        }

        let chunk_size = protocol.chunk_size;
        let chunks = image.len().div_ceil(chunk_size);
        let total = chunks * chunk_size;
        log::info!("Writing flash, size {}", total);

        let mut expected = 0u16;
        for (index, chunk) in image.as_bytes().chunks(chunk_size).enumerate() {
            self.check_cancel()?;
            let offset = index * chunk_size;
            self.state = State::Programming(offset);

            let mut data = chunk.to_vec();
            data.resize(chunk_size, PADDING_BYTE);
            expected = expected.wrapping_add(checksum(&data));
            let address = u16::try_from(offset).map_err(|_| Error::ImageTooLarge {
                size: total,
                capacity: usize::from(u16::MAX) + 1,
            })?;

            let (cmd, payload) = Command::Program {
                address,
                first: index == 0,
                data,
            }
            .into_frame(protocol);
            let resp = self
                .codec
                .transfer(cmd, &payload, self.config.timeouts.response)?;
            if resp.cmd() != protocol.cmd_write_cont || resp.payload().first() != Some(&WRITE_OK) {
                log::error!("program response at 0x{:04x}: {:?}", offset, resp);
                return Err(Error::ProgramRejected(offset));
            }
            progress(Progress {
                written: offset + chunk_size,
                total,
            });

            if index + 1 == chunks {
                // the last acknowledgment carries the sum over everything written
                let actual = resp
                    .payload()
                    .pread_with::<u16>(1, BE)
                    .map_err(|_| Error::ProgramRejected(offset))?;
                if actual != expected {
                    return Err(Error::VerifyMismatch { expected, actual });
                }
            }
        }

        log::info!("Programmed {} bytes, sum 0x{:04x}", total, expected);
        self.state = State::Done;
        Ok(())
    }

    fn isp_end(&mut self) -> Result<()> {
        let protocol = self.current_protocol()?;
        let (cmd, payload) = Command::Terminate.into_frame(protocol);
        self.codec.send(cmd, &payload)?;
        // the MCU may reset before its answer is complete
        match self.codec.recv(self.config.timeouts.response) {
            Ok(_) | Err(Error::Timeout) | Err(Error::FrameCorrupt(_)) => (),
            Err(e) => return Err(e),
        }
        log::info!("Device reset, running application");
        Ok(())
    }
}

fn negotiation_failed(e: Error, baudrate: u32) -> Error {
    match e {
        Error::Timeout | Error::FrameCorrupt(_) => Error::BaudNegotiation(baudrate),
        e => e,
    }
}
