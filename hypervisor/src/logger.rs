//! Serial-port logger backing the `log` facade.
//!
//! The hypervisor has no stdout; a COM port is the one output channel that
//! works identically from the boot phase and from VMX root mode. The boot
//! glue calls [`init`] once, before the first vCPU is constructed.

use core::fmt::{self, Write};

use spin::{Mutex, Once};

use crate::intel::support::{inb, outb};

const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;

const LINE_STATUS_TRANSMITTER_EMPTY: u8 = 1 << 5;

/// Standard COM-port base addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SerialPort {
    Com1 = 0x3f8,
    Com2 = 0x2f8,
}

/// Raw 16550 writer for one COM port.
pub(crate) struct SerialWriter {
    base: u16,
}

impl SerialWriter {
    pub(crate) fn new(port: SerialPort) -> Self {
        let base = port as u16;

        // 115200 8N1, FIFOs on.
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        outb(base + UART_OFFSET_LINE_CONTROL, 0x80); // DLAB
        outb(base + UART_OFFSET_DATA, 0x01); // divisor low
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00); // divisor high
        outb(base + UART_OFFSET_LINE_CONTROL, 0x03);
        outb(base + UART_OFFSET_FIFO_CONTROL, 0xc7);
        outb(base + UART_OFFSET_MODEM_CONTROL, 0x0b);

        Self { base }
    }

    fn write_byte(&mut self, byte: u8) {
        while inb(self.base + UART_OFFSET_LINE_STATUS) & LINE_STATUS_TRANSMITTER_EMPTY == 0 {
            core::hint::spin_loop();
        }
        outb(self.base + UART_OFFSET_DATA, byte);
    }
}

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

struct SerialLogger {
    writer: Mutex<SerialWriter>,
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut writer = self.writer.lock();
        let _ = writeln!(writer, "[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: Once<SerialLogger> = Once::new();

/// Installs the serial logger as the global `log` sink. Idempotent: a second
/// call only updates the level filter.
pub fn init(port: SerialPort, level: log::LevelFilter) {
    let logger = LOGGER.call_once(|| SerialLogger {
        writer: Mutex::new(SerialWriter::new(port)),
    });

    // Err means a logger is already registered (ours, from an earlier call);
    // either way the level update below is what matters.
    let _ = log::set_logger(logger);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::support::sim;

    #[test]
    fn writer_emits_bytes_with_crlf_translation() {
        let mut writer = SerialWriter::new(SerialPort::Com1);
        write!(writer, "vmx up\n").unwrap();

        let data: alloc::vec::Vec<u8> = sim::port_writes(SerialPort::Com1 as u16 + UART_OFFSET_DATA)
            .into_iter()
            // The first byte recorded on the data register is the divisor
            // programmed during init.
            .skip(1)
            .collect();
        assert_eq!(data, b"vmx up\r\n");
    }
}
