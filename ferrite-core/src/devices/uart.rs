//! A minimal 8250-style UART bridged to the host over a pair of bounded byte queues.
//!
//! Only the subset a polling guest driver needs is modeled: the data register and the RX-ready
//! bit of the line status register. The host side of the queues is pumped by I/O threads owned
//! by the driver binary; the device side never blocks.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::address_space::MmioDevice;

/// Offset of the data register (RX read / TX write).
pub const DATA_OFFSET: u32 = 0x00;
/// Offset of the line status register.
pub const LINE_STATUS_OFFSET: u32 = 0x05;

/// Capacity of each direction's byte queue.
const QUEUE_CAPACITY: usize = 10 * 1024;

/// Line status base value: transmitter holding register and transmitter both empty. The TX queue
/// is drained by the host, so the transmitter always reports ready.
const LSR_TX_IDLE: u8 = 0x60;

/// The guest-facing end of the UART.
///
/// Reads and writes are byte-level; wider accesses are handled one byte at a time, matching how
/// an 8-bit peripheral sits on the bus.
#[derive(Debug)]
pub struct Uart {
    rx: Receiver<u8>,
    tx: Sender<u8>,
}

/// The host-facing end of the UART: push bytes for the guest to receive, pull bytes the guest
/// transmitted.
///
/// Both channels use atomic bounded-queue semantics, so the host side may live on a different
/// thread; bytes become visible to the guest on its next MMIO read.
#[derive(Debug, Clone)]
pub struct UartHost {
    /// Bytes pushed here show up in the guest's RX register.
    pub input: Sender<u8>,
    /// Bytes the guest wrote to the TX register end up here.
    pub output: Receiver<u8>,
}

impl Uart {
    /// Create the device/host pair connected by fresh bounded queues.
    pub fn new() -> (Self, UartHost) {
        let (input, rx) = bounded(QUEUE_CAPACITY);
        let (tx, output) = bounded(QUEUE_CAPACITY);
        (Self { rx, tx }, UartHost { input, output })
    }

    fn read_register(&mut self, offset: u32) -> u8 {
        match offset {
            // Next received byte, or 0 when nothing is buffered.
            DATA_OFFSET => self.rx.try_recv().unwrap_or(0),
            LINE_STATUS_OFFSET => LSR_TX_IDLE | u8::from(!self.rx.is_empty()),
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u32, value: u8) {
        if offset == DATA_OFFSET {
            // A full queue drops the byte, like a real transmitter overrun would.
            let _ = self.tx.try_send(value);
        }
    }
}

impl MmioDevice for Uart {
    fn read(&mut self, buf: &mut [u8], offset: u32) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read_register(offset + i as u32);
        }
    }

    fn write(&mut self, offset: u32, buf: &[u8]) {
        for (i, &byte) in buf.iter().enumerate() {
            self.write_register(offset + i as u32, byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_path() {
        let (mut uart, host) = Uart::new();
        let mut buf = [0u8];

        // Empty queue: not ready, data reads 0.
        uart.read(&mut buf, LINE_STATUS_OFFSET);
        assert_eq!(buf[0], 0x60);
        uart.read(&mut buf, DATA_OFFSET);
        assert_eq!(buf[0], 0);

        host.input.send(b'h').unwrap();
        host.input.send(b'i').unwrap();
        uart.read(&mut buf, LINE_STATUS_OFFSET);
        assert_eq!(buf[0], 0x61);
        uart.read(&mut buf, DATA_OFFSET);
        assert_eq!(buf[0], b'h');
        uart.read(&mut buf, DATA_OFFSET);
        assert_eq!(buf[0], b'i');
        uart.read(&mut buf, LINE_STATUS_OFFSET);
        assert_eq!(buf[0], 0x60);
    }

    #[test]
    fn test_tx_path() {
        let (mut uart, host) = Uart::new();
        uart.write(DATA_OFFSET, &[b'o']);
        uart.write(DATA_OFFSET, &[b'k']);
        assert_eq!(host.output.try_recv(), Ok(b'o'));
        assert_eq!(host.output.try_recv(), Ok(b'k'));
        assert!(host.output.try_recv().is_err());
    }

    #[test]
    fn test_other_offsets_inert() {
        let (mut uart, host) = Uart::new();
        let mut buf = [0xFFu8];
        uart.read(&mut buf, 0x03);
        assert_eq!(buf[0], 0);
        uart.write(0x03, &[0xAB]);
        assert!(host.output.try_recv().is_err());
    }
}
