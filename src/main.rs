use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use stc8prog::{transport::SerialTransport, Baudrate, ChipDB, Config, Flashing};

#[cfg(target_os = "windows")]
const DEFAULT_PORT: &str = "COM1";
#[cfg(target_os = "macos")]
const DEFAULT_PORT: &str = "/dev/tty.usbserial";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

#[derive(clap::Parser)]
#[command(
    name = "stc8prog",
    about = "Command-line ISP programmer for STC8A/STC8G/STC8H MCUs",
    author = "Andelf <andelf@gmail.com>",
    arg_required_else_help = true,
    after_help = "Baudrate options:\n   4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 500000, 576000,\n   921600, 1000000, 1152000, 1500000, 2000000, 2500000, 3000000, 3500000,\n   4000000"
)]
struct Cli {
    /// Serial port the MCU is attached to
    #[arg(short, long, default_value = DEFAULT_PORT)]
    port: String,
    /// Download baudrate
    #[arg(short, long, default_value_t = Baudrate::DEFAULT)]
    speed: Baudrate,
    /// Flash the chip with data from a hex (or raw binary) file
    #[arg(short, long, value_name = "FILE")]
    flash: Option<PathBuf>,
    /// Erase the entire chip
    #[arg(short, long)]
    erase: bool,
    /// Enable debug output, including a trace of every frame
    #[arg(short, long)]
    debug: bool,
    /// Leave ISP and run the application when done
    #[arg(long)]
    run: bool,
    /// Display version information
    #[arg(short, long)]
    version: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("stc8prog {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let level = if cli.debug {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    // reject a bad image before touching the port
    let image = match &cli.flash {
        Some(path) => {
            let image = stc8prog::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", image.len());
            image.check_capacity(ChipDB::load()?.max_flash_size() as usize)?;
            Some(image)
        }
        None => None,
    };

    let config = Config {
        baudrate: cli.speed,
        erase: cli.erase,
        terminate: cli.run,
        trace: cli.debug,
        ..Config::default()
    };
    let mut flashing = match Flashing::new_from_serial(&cli.port, config) {
        Ok(flashing) => flashing,
        Err(e) => {
            if let Ok(ports) = SerialTransport::scan_ports() {
                log::info!("Available ports: {}", ports.join(", "));
            }
            return Err(e.into());
        }
    };

    let bar = match &image {
        Some(image) => {
            let bar = ProgressBar::new(image.len() as u64);
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}",
                )?
                .progress_chars("=> "),
            );
            bar.set_message("Writing");
            bar
        }
        None => ProgressBar::hidden(),
    };
    flashing.run(image.as_ref(), |p| {
        bar.set_length(p.total as u64);
        bar.set_position(p.written as u64);
    })?;
    bar.finish();

    if let Some(chip) = flashing.chip() {
        log::info!("Done with {}", chip);
    }
    Ok(())
}
