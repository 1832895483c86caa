//! SocketCAN back-end (Linux only)
//!
//! The interface itself carries no bitrate configuration; bring it up at the
//! diagnostic bus speed before use, e.g.
//! `ip link set can0 up type can bitrate 500000`.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use log::debug;
use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};

use crate::channel::{CanFrame, ChannelError, ChannelResult, FrameChannel};

/// Bound on how long a frame write may be retried when the tx queue is full
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// CAN frame channel backed by a SocketCAN network interface
pub struct SocketCanChannel {
    iface: String,
    socket: CanSocket,
}

impl std::fmt::Debug for SocketCanChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SocketCanChannel({})", self.iface)
    }
}

impl SocketCanChannel {
    /// Opens the named SocketCAN interface (e.g. `can0`).
    ///
    /// The socket is switched to non-blocking mode; reads poll until their
    /// deadline.
    pub fn open(iface: &str) -> ChannelResult<Self> {
        let socket = CanSocket::open(iface).map_err(|e| {
            debug!("socketcan open {iface} failed: {e}");
            ChannelError::OpenFailed(iface.to_string())
        })?;
        socket.set_nonblocking(true).map_err(Self::api_err)?;
        Ok(Self {
            iface: iface.to_string(),
            socket,
        })
    }

    fn api_err(e: impl std::fmt::Display) -> ChannelError {
        ChannelError::APIError {
            api: "socketcan",
            desc: e.to_string(),
        }
    }
}

impl FrameChannel for SocketCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        // The socket is bound at construction
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        debug!("Closing socketcan interface {}", self.iface);
        Ok(())
    }

    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        let id: Id = if frame.is_extended() {
            ExtendedId::new(frame.get_address())
                .ok_or(ChannelError::UnsupportedRequest)?
                .into()
        } else {
            u16::try_from(frame.get_address())
                .ok()
                .and_then(StandardId::new)
                .ok_or(ChannelError::UnsupportedRequest)?
                .into()
        };
        let raw = socketcan::CanFrame::new(id, frame.get_data())
            .ok_or(ChannelError::UnsupportedRequest)?;

        let start = Instant::now();
        loop {
            match self.socket.write_frame(&raw) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= WRITE_TIMEOUT {
                        return Err(ChannelError::WriteTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_frame(&mut self, timeout_ms: u32) -> ChannelResult<CanFrame> {
        let timeout = u128::from(std::cmp::max(1, timeout_ms));
        let start = Instant::now();
        loop {
            match self.socket.read_frame() {
                Ok(raw) => {
                    let (id, ext) = match raw.id() {
                        Id::Standard(s) => (u32::from(s.as_raw()), false),
                        Id::Extended(e) => (e.as_raw(), true),
                    };
                    return Ok(CanFrame::new(id, raw.data(), ext));
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if start.elapsed().as_millis() >= timeout {
                        return Err(ChannelError::ReadTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        while self.socket.read_frame().is_ok() {}
        Ok(())
    }
}
