//! Serial Transportation.
use std::{
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use super::Transport;
use crate::{constants::SYNC_BAUDRATE, Result};

const SERIAL_TIMEOUT_MS: u64 = 100;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// Open `port` at the sync rate, 8E1.
    pub fn open(port: &str) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, SYNC_BAUDRATE);
        let timeout = Duration::from_millis(SERIAL_TIMEOUT_MS);
        let serial_port = serialport::new(port, SYNC_BAUDRATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()?;
        Ok(SerialTransport {
            serial_port,
            timeout,
        })
    }
}

impl Transport for SerialTransport {
    fn configure(&mut self, baudrate: u32, parity: Parity) -> Result<()> {
        log::debug!("Serial port set to {} baud, parity {:?}", baudrate, parity);
        self.serial_port.set_baud_rate(baudrate)?;
        self.serial_port.set_data_bits(DataBits::Eight)?;
        self.serial_port.set_parity(parity)?;
        self.serial_port.set_stop_bits(StopBits::One)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if timeout != self.timeout {
            self.serial_port.set_timeout(timeout)?;
            self.timeout = timeout;
        }
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.serial_port.write_all(buf)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<()> {
        self.serial_port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.serial_port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.serial_port.write_request_to_send(level)?;
        Ok(())
    }
}
