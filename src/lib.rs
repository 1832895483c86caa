#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A crate for extracting binary memory images ("BIN dumps") from vehicle ECUs
//! over an OBD-II adapter.
//!
//! ## Diagnostic protocol support
//!
//! Two peer request/response protocols are implemented on top of a raw CAN
//! framing layer:
//!
//! ### Unified diagnostic services (UDS)
//! ISO14229 - the subset of services needed for session control, security
//! access, identification reads, memory reads/writes and routine control.
//!
//! ### Keyword protocol 2000 (KWP2000)
//! ISO14230 - a parallel service set with its own service IDs and
//! negative-response framing, as found on pre-UDS ECUs.
//!
//! ## Hardware support
//!
//! The transport layer speaks to the vehicle through one of two back-ends,
//! tried in order when a connection is opened:
//!
//! * SocketCAN compatible interfaces (Linux only)
//! * ELM327-style serial adapters, driven through their AT-command tunnel
//!
//! Custom hardware can be plugged in by implementing [channel::FrameChannel]
//! and handing it to [transport::CanTransport::from_channel].
//!
//! ## Typical session
//!
//! [EcuManager] is the single entry point: open an adapter, scan the
//! diagnostic address range for ECUs, select one, then read a memory range
//! into a contiguous byte buffer while observing progress from another
//! thread if desired.

use channel::ChannelError;
use security::SecurityError;

pub mod adapter;
pub mod channel;
pub mod discover;
pub mod helpers;
pub mod kwp2000;
pub mod manager;
pub mod memory;
pub mod response;
pub mod security;
pub mod transport;
pub mod uds;

pub use discover::{EcuInfo, EcuProtocol};
pub use manager::EcuManager;
pub use memory::{CancelToken, ReadProgress, ReadStatus};
pub use response::ServiceResponse;

/// Diagnostic operation result
pub type DiagResult<T> = Result<T, DiagError>;

/// Top level error type for diagnostic operations
#[derive(Debug, thiserror::Error)]
pub enum DiagError {
    /// The request is not supported for the selected ECU or protocol
    #[error("request not supported")]
    NotSupported,
    /// The ECU replied with a negative response code
    #[error("ECU error 0x{code:02X} ({def})")]
    EcuError {
        /// Raw negative response code from the ECU
        code: u8,
        /// Negative response code definition according to protocol
        def: String,
    },
    /// The ECU did not reply within the transport timeout
    #[error("ECU did not respond")]
    NoResponse,
    /// The ECU replied, but with an empty payload where data was expected
    #[error("ECU provided an empty response")]
    EmptyResponse,
    /// A parameter given to the function is invalid
    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),
    /// No adapter connection has been opened yet, or it has been closed
    #[error("no adapter connection is open")]
    NotConnected,
    /// An operation requiring a selected ECU was called before selection
    #[error("no ECU selected")]
    NoEcuSelected,
    /// There is no BIN data to operate on
    #[error("no BIN data available")]
    NoBinData,
    /// The operation was cancelled by the host
    #[error("operation cancelled")]
    Cancelled,
    /// Security access negotiation failed
    #[error("security access failed: {0}")]
    Security(#[from] SecurityError),
    /// Error with the underlying communication channel
    #[error("underlying channel error: {0}")]
    Channel(#[from] ChannelError),
    /// Filesystem error while persisting BIN data
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
