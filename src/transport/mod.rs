//! CAN transport layer
//!
//! Owns the physical interface and exposes frame-level send/receive to the
//! protocol encoders. Two back-end families are tried in order when a
//! connection is opened:
//!
//! 1. Native CAN interfaces (SocketCAN, Linux only)
//! 2. An ELM327-style serial tunnel on the adapter's port
//!
//! The transport also maintains the standard diagnostic CAN id mapping:
//! requests to an ECU that responds on id `R` are transmitted on `R - 0x08`.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::time::Instant;

use log::{debug, info};

use crate::adapter::AdapterInfo;
use crate::channel::{CanFrame, ChannelError, ChannelResult, FrameChannel};

pub mod elm327;
#[cfg(target_os = "linux")]
pub mod socketcan;

/// Fixed bitrate of the diagnostic CAN bus
pub const CAN_BITRATE: u32 = 500_000;

/// Default receive timeout for higher-level callers, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u32 = 2_000;

/// Offset between an ECU's response id and the id requests are sent on
const REQUEST_ID_OFFSET: u32 = 0x08;

#[cfg(target_os = "linux")]
const SOCKETCAN_CANDIDATES: [&str; 3] = ["can0", "can1", "vcan0"];

/// Returns the CAN id a request must be sent on for an ECU responding on
/// `response_id`, per the standard diagnostic id mapping.
pub fn request_id(response_id: u32) -> u32 {
    response_id - REQUEST_ID_OFFSET
}

/// A CAN transport bound to one physical interface.
///
/// The transport exclusively owns the underlying adapter handle. Protocol
/// encoders borrow the transport for the duration of a service call.
pub struct CanTransport {
    channel: Box<dyn FrameChannel>,
}

impl Debug for CanTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "CanTransport")
    }
}

impl CanTransport {
    /// Opens a transport for the given adapter.
    ///
    /// Native CAN interfaces are tried first; if none opens, the adapter's
    /// serial port is driven as an ELM327 tunnel. The bus is assumed to run
    /// at [CAN_BITRATE] (native interfaces must be configured accordingly,
    /// e.g. via `ip link` for SocketCAN).
    pub fn open(adapter: &AdapterInfo) -> ChannelResult<Self> {
        debug!("Expecting CAN bus at {CAN_BITRATE} bps");
        #[cfg(target_os = "linux")]
        for iface in SOCKETCAN_CANDIDATES {
            match socketcan::SocketCanChannel::open(iface) {
                Ok(ch) => {
                    info!("Connected to CAN bus via socketcan:{iface}");
                    return Ok(Self {
                        channel: Box::new(ch),
                    });
                }
                Err(e) => {
                    debug!("Failed to connect via socketcan:{iface} - {e}");
                }
            }
        }

        let ch = elm327::Elm327Channel::open(&adapter.port)?;
        info!("Connected to CAN bus via serial tunnel on {}", adapter.port);
        Ok(Self {
            channel: Box::new(ch),
        })
    }

    /// Creates a transport over an already-open channel.
    ///
    /// This is the injection point for custom hardware back-ends and for the
    /// simulated ECUs used in tests.
    pub fn from_channel(channel: Box<dyn FrameChannel>) -> Self {
        Self { channel }
    }

    /// Sends a single frame.
    pub fn send(&mut self, id: u32, data: &[u8], extended: bool) -> ChannelResult<()> {
        if data.len() > 8 {
            return Err(ChannelError::UnsupportedRequest);
        }
        let frame = CanFrame::new(id, data, extended);
        debug!("Tx frame: ID=0x{id:03X}, Data={:02X?}", frame.get_data());
        self.channel.send_frame(&frame)
    }

    /// Receives a single frame, waiting up to `timeout_ms`.
    pub fn recv(&mut self, timeout_ms: u32) -> ChannelResult<CanFrame> {
        let frame = self.channel.read_frame(timeout_ms)?;
        debug!(
            "Rx frame: ID=0x{:03X}, Data={:02X?}",
            frame.get_address(),
            frame.get_data()
        );
        Ok(frame)
    }

    /// Sends a frame and waits for the next frame on the bus.
    ///
    /// No id filtering is applied; this is the raw-CAN probe primitive.
    pub fn send_and_recv(
        &mut self,
        id: u32,
        data: &[u8],
        timeout_ms: u32,
    ) -> ChannelResult<CanFrame> {
        self.channel.clear_rx_buffer()?;
        self.send(id, data, false)?;
        self.recv(timeout_ms)
    }

    /// Sends a diagnostic request to the ECU responding on `ecu_id` and
    /// waits for its reply.
    ///
    /// The request is transmitted on `ecu_id - 0x08` per the standard
    /// diagnostic id mapping, and received frames are filtered to `ecu_id`;
    /// unrelated traffic within the timeout window is discarded.
    pub fn send_request(
        &mut self,
        ecu_id: u32,
        payload: &[u8],
        timeout_ms: u32,
    ) -> ChannelResult<CanFrame> {
        self.channel.clear_rx_buffer()?;
        self.send(request_id(ecu_id), payload, false)?;

        let start = Instant::now();
        loop {
            let elapsed = start.elapsed().as_millis() as u32;
            if elapsed >= timeout_ms {
                return Err(ChannelError::ReadTimeout);
            }
            let frame = self.recv(timeout_ms - elapsed)?;
            if frame.get_address() == ecu_id {
                return Ok(frame);
            }
            debug!(
                "Discarding frame from 0x{:03X} while awaiting 0x{ecu_id:03X}",
                frame.get_address()
            );
        }
    }

    /// Closes the underlying interface.
    pub fn close(&mut self) -> ChannelResult<()> {
        self.channel.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_id_mapping() {
        assert_eq!(request_id(0x7E8), 0x7E0);
        assert_eq!(request_id(0x7E0), 0x7D8);
        assert_eq!(request_id(0x7EF), 0x7E7);
    }
}
