//! Module for KWP2000 (Keyword protocol 2000 - ISO14230)
//!
//! The service IDs here follow the vendor numbering found on CAN-attached
//! KWP ECUs rather than the ISO14230 K-line set: StartCommunication is 0x81,
//! memory services live in the 0xA0/0xB0 range and SecurityAccess is 0xE1.
//! Positive responses carry the request SID + 0x40 (so StartCommunication
//! answers with 0xC1); the negative-response introducer is 0xBF.

use log::{info, warn};

use crate::channel::ChannelError;
use crate::helpers;
use crate::response::ServiceResponse;
use crate::transport::{CanTransport, DEFAULT_TIMEOUT_MS};
use crate::{DiagError, DiagResult};

/// First byte of a KWP2000 negative response
pub const NEGATIVE_RESPONSE_INTRODUCER: u8 = 0xBF;

/// KWP2000 command service IDs
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum KwpCommand {
    /// Opens the diagnostic session with the ECU
    StartCommunication = 0x81,
    /// Closes the diagnostic session
    StopCommunication = 0x82,
    /// Resets the ECU
    EcuReset = 0x83,
    /// Reads data using a 1-byte local identifier
    ReadDataByLocalIdentifier = 0xA1,
    /// Reads data using a 2-byte common identifier
    ReadDataByCommonIdentifier = 0xA2,
    /// Reads a region of ECU memory by address
    ReadMemoryByAddress = 0xA3,
    /// Writes data using a 1-byte local identifier
    WriteDataByLocalIdentifier = 0xB1,
    /// Writes a region of ECU memory by address
    WriteMemoryByAddress = 0xB3,
    /// Starts a routine identified by a local identifier
    StartRoutineByLocalIdentifier = 0xC1,
    /// Stops a routine identified by a local identifier
    StopRoutineByLocalIdentifier = 0xC3,
    /// Requests the results of a routine identified by a local identifier
    RequestRoutineResultsByLocalIdentifier = 0xC5,
    /// Seed/key security access
    SecurityAccess = 0xE1,
}

/// Returns the human readable definition of a KWP2000 negative response code
pub fn describe_nrc(nrc: u8) -> String {
    match nrc {
        0x11 => "Service not supported".into(),
        0x12 => "Sub-function not supported".into(),
        0x13 => "Incorrect message length".into(),
        0x22 => "Conditions not correct".into(),
        0x24 => "Request sequence error".into(),
        0x33 => "Security access denied".into(),
        0x35 => "Invalid key".into(),
        0x36 => "Exceeded number of attempts".into(),
        0x37 => "Required time delay not expired".into(),
        x => format!("Unknown NRC: 0x{x:02X}"),
    }
}

/// Encodes a KWP ReadMemoryByAddress request, using the same
/// length-prefixed address/size form as UDS.
pub fn encode_read_memory(address: u32, size: u32) -> Vec<u8> {
    let mut req = vec![KwpCommand::ReadMemoryByAddress as u8];
    req.extend_from_slice(&helpers::encode_scalar(address));
    req.extend_from_slice(&helpers::encode_scalar(size));
    req
}

/// Encodes a KWP WriteMemoryByAddress request.
pub fn encode_write_memory(address: u32, data: &[u8]) -> Vec<u8> {
    let mut req = vec![KwpCommand::WriteMemoryByAddress as u8];
    req.extend_from_slice(&helpers::encode_scalar(address));
    req.extend_from_slice(&helpers::encode_scalar(data.len() as u32));
    req.extend_from_slice(data);
    req
}

/// KWP2000 encoder bound to one ECU address.
///
/// Borrows the transport for its lifetime; stateless otherwise.
#[derive(Debug)]
pub struct Kwp2000Protocol<'a> {
    transport: &'a mut CanTransport,
    address: u32,
}

impl<'a> Kwp2000Protocol<'a> {
    /// Creates an encoder talking to the ECU that responds on `address`.
    pub fn new(transport: &'a mut CanTransport, address: u32) -> Self {
        Self { transport, address }
    }

    /// StartCommunication (0x81)
    pub fn start_communication(&mut self) -> DiagResult<ServiceResponse> {
        let resp = self.request(&[KwpCommand::StartCommunication as u8])?;
        if resp.is_positive() {
            info!("KWP start communication successful");
        } else {
            warn!("KWP start communication failed: {resp:?}");
        }
        Ok(resp)
    }

    /// StopCommunication (0x82)
    pub fn stop_communication(&mut self) -> DiagResult<ServiceResponse> {
        self.request(&[KwpCommand::StopCommunication as u8])
    }

    /// SecurityAccess (0xE1). Odd sub-functions request a seed, even
    /// sub-functions carry the computed key.
    pub fn security_access(
        &mut self,
        sub_function: u8,
        key: Option<&[u8]>,
    ) -> DiagResult<ServiceResponse> {
        let mut req = vec![KwpCommand::SecurityAccess as u8, sub_function];
        if let Some(key) = key {
            req.extend_from_slice(key);
        }
        self.request(&req)
    }

    /// ReadDataByLocalIdentifier (0xA1)
    pub fn read_data_by_local_identifier(&mut self, id: u8) -> DiagResult<ServiceResponse> {
        self.request(&[KwpCommand::ReadDataByLocalIdentifier as u8, id])
    }

    /// ReadDataByCommonIdentifier (0xA2) with a 16-bit big-endian identifier
    pub fn read_data_by_common_identifier(&mut self, id: u16) -> DiagResult<ServiceResponse> {
        self.request(&[
            KwpCommand::ReadDataByCommonIdentifier as u8,
            (id >> 8) as u8,
            id as u8,
        ])
    }

    /// ReadMemoryByAddress (0xA3)
    pub fn read_memory_by_address(&mut self, address: u32, size: u32) -> DiagResult<ServiceResponse> {
        self.request(&encode_read_memory(address, size))
    }

    /// WriteMemoryByAddress (0xB3)
    pub fn write_memory_by_address(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> DiagResult<ServiceResponse> {
        self.request(&encode_write_memory(address, data))
    }

    /// StartRoutineByLocalIdentifier (0xC1)
    pub fn start_routine_by_local_identifier(
        &mut self,
        routine_id: u8,
        data: &[u8],
    ) -> DiagResult<ServiceResponse> {
        let mut req = vec![KwpCommand::StartRoutineByLocalIdentifier as u8, routine_id];
        req.extend_from_slice(data);
        self.request(&req)
    }

    /// StopRoutineByLocalIdentifier (0xC3)
    pub fn stop_routine_by_local_identifier(&mut self, routine_id: u8) -> DiagResult<ServiceResponse> {
        self.request(&[KwpCommand::StopRoutineByLocalIdentifier as u8, routine_id])
    }

    /// RequestRoutineResultsByLocalIdentifier (0xC5)
    pub fn request_routine_results_by_local_identifier(
        &mut self,
        routine_id: u8,
    ) -> DiagResult<ServiceResponse> {
        self.request(&[
            KwpCommand::RequestRoutineResultsByLocalIdentifier as u8,
            routine_id,
        ])
    }

    /// Sends a raw KWP request and parses the reply into a response record.
    ///
    /// A transport timeout becomes [ServiceResponse::NoResponse]; any other
    /// transport error propagates unchanged.
    pub fn request(&mut self, payload: &[u8]) -> DiagResult<ServiceResponse> {
        match self
            .transport
            .send_request(self.address, payload, DEFAULT_TIMEOUT_MS)
        {
            Ok(frame) => Ok(ServiceResponse::parse(
                frame.get_data(),
                NEGATIVE_RESPONSE_INTRODUCER,
                describe_nrc,
            )),
            Err(ChannelError::ReadTimeout) => Ok(ServiceResponse::NoResponse),
            Err(e) => Err(DiagError::Channel(e)),
        }
    }
}
