//! Chunked memory-read engine
//!
//! Walks a `[start, end)` address range in blocks through a memory-read
//! service, accumulating payloads into a contiguous BIN buffer and keeping a
//! progress record observable from other threads. The engine performs no
//! retries of its own; identical ECU behaviour yields identical buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};

use crate::response::ServiceResponse;
use crate::{DiagError, DiagResult};

/// Default number of bytes requested per memory-read
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// Largest accepted block size override
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Pause between blocks, to avoid overrunning the ECU
const INTER_BLOCK_DELAY: Duration = Duration::from_millis(10);

/// State of a memory read
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReadStatus {
    /// No read has been started
    Idle,
    /// A read is in progress
    Reading,
    /// The last read finished cleanly
    Complete,
    /// The last read terminated with an error
    Error,
}

/// Progress of a memory read.
///
/// Written only by the read loop; observers take snapshots through
/// [crate::EcuManager::progress].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadProgress {
    /// Bytes successfully transferred so far
    pub bytes_read: usize,
    /// Total bytes requested (`end - start`)
    pub total_bytes: usize,
    /// Next address to be read
    pub current_address: u32,
    /// State of the read
    pub status: ReadStatus,
    /// Failure description when `status == Error`
    pub error_message: Option<String>,
}

impl Default for ReadProgress {
    fn default() -> Self {
        Self {
            bytes_read: 0,
            total_bytes: 0,
            current_address: 0,
            status: ReadStatus::Idle,
            error_message: None,
        }
    }
}

impl ReadProgress {
    /// Progress record for a read about to start on `[start, end)`
    pub(crate) fn begin(start: u32, end: u32) -> Self {
        Self {
            bytes_read: 0,
            total_bytes: (end - start) as usize,
            current_address: start,
            status: ReadStatus::Reading,
            error_message: None,
        }
    }
}

/// Cooperative cancellation flag, checked at every loop iteration of the
/// read engine. Clone it to hand to another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the running read
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns true once [CancelToken::cancel] has been called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Validates a read request before any state is touched.
pub(crate) fn validate(start: u32, end: u32, block_size: u32) -> DiagResult<()> {
    if end < start {
        return Err(DiagError::ParameterInvalid(format!(
            "end address 0x{end:08X} is below start address 0x{start:08X}"
        )));
    }
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(DiagError::ParameterInvalid(format!(
            "block size {block_size} outside 1..={MAX_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

fn fail(progress: &Mutex<ReadProgress>, message: &str) {
    error!("BIN read failed: {message}");
    let mut p = progress.lock().unwrap();
    p.status = ReadStatus::Error;
    p.error_message = Some(message.to_string());
}

/// Runs the chunked read loop.
///
/// `read_block` issues one memory-read of `size` bytes at `address` and
/// returns the ECU's response record; the engine appends positive payloads
/// (clamped to the requested size), advances by the actual returned length,
/// and stops on the first negative or missing reply. The progress record
/// must already be in the [ReadStatus::Reading] state.
pub(crate) fn run_read<F>(
    mut read_block: F,
    start: u32,
    end: u32,
    block_size: u32,
    bin: &mut Vec<u8>,
    progress: &Mutex<ReadProgress>,
    cancel: &CancelToken,
) -> DiagResult<()>
where
    F: FnMut(u32, u32) -> DiagResult<ServiceResponse>,
{
    let mut current = start;
    while current < end {
        if cancel.is_cancelled() {
            fail(progress, "cancelled");
            return Err(DiagError::Cancelled);
        }

        let request_size = std::cmp::min(block_size, end - current);
        let resp = match read_block(current, request_size) {
            Ok(r) => r,
            Err(e) => {
                fail(progress, &e.to_string());
                return Err(e);
            }
        };

        match resp {
            ServiceResponse::Positive { data, .. } => {
                if data.is_empty() {
                    // An empty payload would never advance the loop
                    fail(progress, "ECU returned an empty memory-read payload");
                    return Err(DiagError::EmptyResponse);
                }
                let take = std::cmp::min(data.len(), request_size as usize);
                bin.extend_from_slice(&data[..take]);
                current += take as u32;
                let mut p = progress.lock().unwrap();
                p.bytes_read = bin.len();
                p.current_address = current;
            }
            ServiceResponse::Negative { nrc, description, .. } => {
                fail(progress, &description);
                return Err(DiagError::EcuError {
                    code: nrc,
                    def: description,
                });
            }
            ServiceResponse::NoResponse => {
                fail(progress, "no reply");
                return Err(DiagError::NoResponse);
            }
        }

        std::thread::sleep(INTER_BLOCK_DELAY);
    }

    let mut p = progress.lock().unwrap();
    p.status = ReadStatus::Complete;
    info!("BIN read complete. Size: {} bytes", bin.len());
    Ok(())
}
