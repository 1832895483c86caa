//! Module for logical communication channels with a vehicle bus
//!
//! A channel moves raw CAN frames between the host and the vehicle. The
//! [FrameChannel] trait is implemented by every hardware back-end, and by
//! simulated ECUs in the test suite.

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Error produced by a communication channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Underlying IO error with the channel
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// Error reported by the serial port layer
    #[error("serial port error: {0}")]
    SerialError(#[from] serialport::Error),
    /// Could not open the interface
    #[error("failed to open interface '{0}'")]
    OpenFailed(String),
    /// Timeout when writing data to the channel
    #[error("timeout writing to channel")]
    WriteTimeout,
    /// Timeout when reading from the channel
    #[error("timeout reading from channel")]
    ReadTimeout,
    /// A serial line could not be decoded as a CAN frame
    #[error("malformed serial line: '{0}'")]
    MalformedLine(String),
    /// Unsupported channel request
    #[error("unsupported channel request")]
    UnsupportedRequest,
    /// The interface is not open
    #[error("channel's interface is not open")]
    InterfaceNotOpen,
    /// Underlying API error with a native driver
    #[error("underlying {api} API error: {desc}")]
    APIError {
        /// Name of the API, e.g. `socketcan`
        api: &'static str,
        /// Error description from the API
        desc: String,
    },
}

/// A single CAN frame. Frames are plain values with no lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
    ext: bool,
}

impl CanFrame {
    /// Creates a new CAN frame. Data beyond 8 bytes is truncated.
    pub fn new(id: u32, data: &[u8], ext: bool) -> Self {
        let dlc = std::cmp::min(data.len(), 8);
        let mut d = [0u8; 8];
        d[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data: d,
            ext,
        }
    }

    /// Returns the arbitration ID of the frame
    pub fn get_address(&self) -> u32 {
        self.id
    }

    /// Returns the data payload of the frame
    pub fn get_data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Returns true if the frame uses a 29-bit extended arbitration ID
    pub fn is_extended(&self) -> bool {
        self.ext
    }
}

/// Base trait for raw CAN frame interfaces.
///
/// Implementors move single frames on and off the bus. All reads are bounded
/// by a timeout; no call blocks indefinitely.
pub trait FrameChannel: Send {
    /// Opens the interface
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes and destroys the channel
    fn close(&mut self) -> ChannelResult<()>;

    /// Writes a single frame to the bus
    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()>;

    /// Attempts to read a single frame from the bus.
    ///
    /// ## Parameters
    /// * timeout_ms - Maximum time to wait for a frame. On expiry,
    ///   [ChannelError::ReadTimeout] is returned.
    fn read_frame(&mut self, timeout_ms: u32) -> ChannelResult<CanFrame>;

    /// Discards any frames pending in the channel's receive buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_truncates_to_8_bytes() {
        let f = CanFrame::new(0x7E0, &[0u8; 12], false);
        assert_eq!(f.get_data().len(), 8);
    }

    #[test]
    fn frame_accessors() {
        let f = CanFrame::new(0x7E8, &[0x10, 0x01], false);
        assert_eq!(f.get_address(), 0x7E8);
        assert_eq!(f.get_data(), &[0x10, 0x01]);
        assert!(!f.is_extended());
    }
}
