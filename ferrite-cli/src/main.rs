//! Host driver for the ferrite emulator: loads guest images, pumps the UART to the terminal, and
//! runs the core in batches until interrupted.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use ferrite_core::board::{Board, Config};
use ferrite_core::InvalidAddress;
use log::{error, info};

/// Instructions retired per run-loop batch; the stop flag is checked between batches.
const BATCH_STEPS: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Raw kernel image, loaded at the reset vector (0x80000000).
    kernel: PathBuf,
    /// Root filesystem image, loaded into flash (0x20000000).
    #[arg(long)]
    rootfs: Option<PathBuf>,
    /// Main RAM size in MiB.
    #[arg(long, default_value_t = 64)]
    ram_mib: usize,
    /// Physical address of a device-tree blob, passed to the guest in x11.
    #[arg(long, value_parser = parse_address)]
    dtb_address: Option<u32>,
}

fn parse_address(input: &str) -> Result<u32, String> {
    let parsed = match input.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|err| err.to_string())
}

fn load_error(err: InvalidAddress) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("image does not fit: {err}"))
}

fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut board = Board::new(Config {
        ram_size: args.ram_mib << 20,
        ..Config::default()
    });

    let kernel = fs::read(&args.kernel)?;
    board.load_kernel(&kernel).map_err(load_error)?;
    info!("loaded kernel: {} bytes", kernel.len());
    if let Some(path) = &args.rootfs {
        let rootfs = fs::read(path)?;
        board.load_rootfs(&rootfs).map_err(load_error)?;
        info!("loaded rootfs: {} bytes", rootfs.len());
    }
    if let Some(address) = args.dtb_address {
        board.set_dtb_address(address);
    }

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;

    let uart = board.uart_host();
    let input = uart.input.clone();
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut byte = [0u8; 1];
        while let Ok(n) = stdin.read(&mut byte) {
            if n == 0 {
                break;
            }
            if input.send(byte[0]).is_err() {
                break;
            }
        }
    });
    let output = uart.output.clone();
    thread::spawn(move || {
        let mut stdout = io::stdout();
        while let Ok(byte) = output.recv() {
            let _ = stdout.write_all(&[byte]);
            let _ = stdout.flush();
        }
    });

    info!("starting emulation");
    while !stop.load(Ordering::Relaxed) {
        if let Err(err) = board.core_mut().run(BATCH_STEPS) {
            error!("emulation stopped: {err}");
            return Err(io::Error::new(io::ErrorKind::Other, err.to_string()));
        }
    }
    info!("stopped");
    Ok(())
}
