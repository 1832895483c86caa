//! ELM327 serial tunnel back-end
//!
//! Drives an ELM327-style adapter in its AT-command mode and exchanges CAN
//! frames as ASCII lines of the form `t<3-hex-id><1-hex-dlc><hex-data>`.
//!
//! The inbound side is a line-oriented parser over a persistent byte buffer:
//! a frame may arrive split across several serial reads, and one read may
//! deliver several frames. Lines that do not decode as frames (command
//! echoes, `OK`, the `>` prompt) are discarded.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::adapter::ADAPTER_BAUD;
use crate::channel::{CanFrame, ChannelError, ChannelResult, FrameChannel};

/// AT initialisation sequence: reset, echo off, linefeeds off, spaces off,
/// headers off, auto protocol
const INIT_COMMANDS: [&[u8]; 6] = [b"ATZ\r\n", b"ATE0\r\n", b"ATL0\r\n", b"ATS0\r\n", b"ATH0\r\n", b"ATSP0\r\n"];

/// CAN frame channel tunnelled over an ELM327 serial adapter
pub struct Elm327Channel {
    port: Box<dyn SerialPort>,
    rx_buf: Vec<u8>,
}

impl Debug for Elm327Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Elm327Channel({})", self.port.name().unwrap_or_default())
    }
}

impl Elm327Channel {
    /// Opens the serial port and puts the adapter into raw frame mode.
    ///
    /// Each initialisation command expects `OK` or an `ELM327` banner in
    /// reply; anything else is logged but is not fatal, since clones vary
    /// in which commands they acknowledge.
    pub fn open(port_name: &str) -> ChannelResult<Self> {
        let port = serialport::new(port_name, ADAPTER_BAUD)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(|e| {
                debug!("Could not open {port_name}: {e}");
                ChannelError::OpenFailed(port_name.to_string())
            })?;

        let mut channel = Self {
            port,
            rx_buf: Vec::new(),
        };

        for cmd in INIT_COMMANDS {
            channel.init_command(cmd)?;
        }
        channel.port.clear(ClearBuffer::Input)?;
        Ok(channel)
    }

    fn init_command(&mut self, cmd: &[u8]) -> ChannelResult<()> {
        self.port.write_all(cmd)?;
        let mut buf = [0u8; 100];
        let reply = match self.port.read(&mut buf) {
            Ok(n) => String::from_utf8_lossy(&buf[..n]).into_owned(),
            Err(e) if e.kind() == ErrorKind::TimedOut => String::new(),
            Err(e) => return Err(e.into()),
        };
        if !reply.contains("OK") && !reply.contains("ELM327") {
            warn!(
                "Unexpected response to {:?}: {reply:?}",
                String::from_utf8_lossy(cmd)
            );
        }
        Ok(())
    }

    /// Pops the next complete line out of the receive buffer, if one has
    /// been terminated. Prompt characters and blank lines are skipped.
    fn take_line(&mut self) -> Option<String> {
        while let Some(pos) = self.rx_buf.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let line: Vec<u8> = self.rx_buf.drain(..=pos).take(pos).collect();
            let line = String::from_utf8_lossy(&line)
                .trim_matches(|c: char| c == '>' || c.is_whitespace())
                .to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }
}

/// Decodes one serial line as a CAN frame.
///
/// Returns `Ok(None)` for lines that are not frames (adapter chatter), and
/// an error for lines that look like frames but do not decode.
fn parse_frame_line(line: &str) -> ChannelResult<Option<CanFrame>> {
    if !line.starts_with('t') {
        return Ok(None);
    }
    let malformed = || ChannelError::MalformedLine(line.to_string());
    if line.len() < 5 || !line.is_ascii() {
        return Err(malformed());
    }
    let id = u32::from_str_radix(&line[1..4], 16).map_err(|_| malformed())?;
    let dlc = usize::from_str_radix(&line[4..5], 16).map_err(|_| malformed())?;
    if dlc > 8 || line.len() < 5 + dlc * 2 {
        return Err(malformed());
    }
    let mut data = [0u8; 8];
    for (i, byte) in data.iter_mut().enumerate().take(dlc) {
        *byte = u8::from_str_radix(&line[5 + i * 2..7 + i * 2], 16).map_err(|_| malformed())?;
    }
    Ok(Some(CanFrame::new(id, &data[..dlc], false)))
}

/// Encodes a frame as an ELM327 transmit line, without the terminator.
fn encode_frame_line(frame: &CanFrame) -> String {
    let mut line = format!("t{:03X}{:1X}", frame.get_address() & 0x7FF, frame.get_data().len());
    for b in frame.get_data() {
        line.push_str(&format!("{b:02X}"));
    }
    line
}

impl FrameChannel for Elm327Channel {
    fn open(&mut self) -> ChannelResult<()> {
        // The port is opened and initialised at construction
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.rx_buf.clear();
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        if frame.is_extended() {
            // 29-bit ids are not representable in the 3-digit line format
            return Err(ChannelError::UnsupportedRequest);
        }
        let line = encode_frame_line(frame) + "\r\n";
        self.port.write_all(line.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn read_frame(&mut self, timeout_ms: u32) -> ChannelResult<CanFrame> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            while let Some(line) = self.take_line() {
                match parse_frame_line(&line) {
                    Ok(Some(frame)) => return Ok(frame),
                    Ok(None) => debug!("Discarding non-frame line {line:?}"),
                    Err(e) => warn!("{e}"),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ChannelError::ReadTimeout);
            }
            self.port.set_timeout(deadline - now)?;
            let mut chunk = [0u8; 64];
            match self.port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(ChannelError::ReadTimeout);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.rx_buf.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
