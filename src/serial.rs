//! Serial console bridging guest port 0x3F8 to the host's standard streams.
//!
//! The guest sees a bare byte port, not a full UART: one OUT instruction
//! becomes one byte on host stdout, one IN instruction blocks until the
//! host delivers one byte on stdin. End of input is the guest's signal to
//! finish, reported as a clean shutdown rather than an error.

use std::io::{self, Read, Write};

/// I/O port of the first UART, the only port the hypervisor services.
pub const SERIAL_PORT: u16 = 0x3F8;

/// Byte-at-a-time bridge between the guest serial port and a pair of host
/// streams.
pub struct SerialConsole {
    input: Box<dyn Read + Send>,
    output: Box<dyn Write + Send>,
}

impl SerialConsole {
    /// Create a console wired to the process's stdin and stdout.
    pub fn new() -> Self {
        Self::with_streams(Box::new(io::stdin()), Box::new(io::stdout()))
    }

    /// Create a console over custom streams.
    pub fn with_streams(input: Box<dyn Read + Send>, output: Box<dyn Write + Send>) -> Self {
        Self { input, output }
    }

    /// Write one guest byte to the host, flushed immediately so the host
    /// observes bytes in guest execution order.
    pub fn transmit(&mut self, byte: u8) -> io::Result<()> {
        self.output.write_all(&[byte])?;
        self.output.flush()
    }

    /// Read one host byte for the guest, blocking until it arrives.
    /// Returns `None` on end of input.
    pub fn receive(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for SerialConsole {
    fn default() -> Self {
        Self::new()
    }
}
