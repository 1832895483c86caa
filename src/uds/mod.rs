//! Module for UDS (Unified diagnostic services - ISO14229)
//!
//! A stateless encoder/parser bound to one ECU address through a borrowed
//! [CanTransport]. Only the service subset needed for identification,
//! security access and memory extraction is exposed as methods; the command
//! enum carries the remaining IDs for callers composing raw requests.

use log::{info, warn};

use crate::channel::ChannelError;
use crate::helpers;
use crate::response::ServiceResponse;
use crate::transport::{CanTransport, DEFAULT_TIMEOUT_MS};
use crate::{DiagError, DiagResult};

/// First byte of a UDS negative response
pub const NEGATIVE_RESPONSE_INTRODUCER: u8 = 0x7F;

/// UDS command service IDs
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UdsCommand {
    /// Start or change the ECU diagnostic session mode
    DiagnosticSessionControl = 0x10,
    /// Reset the ECU
    EcuReset = 0x11,
    /// Seed/key security access
    SecurityAccess = 0x27,
    /// Controls communication functionality of the ECU
    CommunicationControl = 0x28,
    /// Reads data from the ECU using a 16-bit data identifier
    ReadDataByIdentifier = 0x22,
    /// Reads a region of ECU memory by address
    ReadMemoryByAddress = 0x23,
    /// Writes a region of ECU memory by address
    WriteMemoryByAddress = 0x3D,
    /// Starts, stops or queries an ECU routine
    RoutineControl = 0x31,
    /// Requests the start of a download to the ECU
    RequestDownload = 0x34,
    /// Requests the start of an upload from the ECU
    RequestUpload = 0x35,
    /// Transfers a block during an upload/download
    TransferData = 0x36,
    /// Terminates an upload/download
    RequestTransferExit = 0x37,
}

/// UDS diagnostic session modes, handled by SID 0x10
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UdsSessionType {
    /// Default session mode (the ECU is normally in this mode on startup)
    Default,
    /// Session mode enabling flashing/programming services
    Programming,
    /// Session mode enabling all diagnostic services
    Extended,
    /// Manufacturer or supplier specific session mode
    Other(u8),
}

impl From<UdsSessionType> for u8 {
    fn from(from: UdsSessionType) -> u8 {
        match from {
            UdsSessionType::Default => 0x01,
            UdsSessionType::Programming => 0x02,
            UdsSessionType::Extended => 0x03,
            UdsSessionType::Other(x) => x,
        }
    }
}

/// Routine control operations, handled by SID 0x31
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RoutineOperation {
    /// Start the routine
    Start = 0x01,
    /// Stop the routine
    Stop = 0x02,
    /// Request the routine's results
    RequestResults = 0x03,
}

/// Returns the human readable definition of a UDS negative response code
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
        0x72 => "General programming failure".into(),
        0x73 => "Wrong block sequence counter".into(),
        0x7F => "Request correctly received, response pending".into(),
        x => format!("Unknown NRC: 0x{x:02X}"),
    }
}

/// Encodes a ReadMemoryByAddress request.
///
/// Address and size are each emitted as a length byte (1-4) followed by that
/// many big-endian bytes, using the smallest length that fits.
pub fn encode_read_memory(address: u32, size: u32) -> Vec<u8> {
    let mut req = vec![UdsCommand::ReadMemoryByAddress as u8];
    req.extend_from_slice(&helpers::encode_scalar(address));
    req.extend_from_slice(&helpers::encode_scalar(size));
    req
}

/// Encodes a WriteMemoryByAddress request with the same address/size form
/// as [encode_read_memory], followed by the data to write.
pub fn encode_write_memory(address: u32, data: &[u8]) -> Vec<u8> {
    let mut req = vec![UdsCommand::WriteMemoryByAddress as u8];
    req.extend_from_slice(&helpers::encode_scalar(address));
    req.extend_from_slice(&helpers::encode_scalar(data.len() as u32));
    req.extend_from_slice(data);
    req
}

/// UDS encoder bound to one ECU address.
///
/// The encoder borrows the transport for its lifetime; it holds no other
/// state, and performs no retries of its own.
#[derive(Debug)]
pub struct UdsProtocol<'a> {
    transport: &'a mut CanTransport,
    address: u32,
}

impl<'a> UdsProtocol<'a> {
    /// Creates an encoder talking to the ECU that responds on `address`.
    pub fn new(transport: &'a mut CanTransport, address: u32) -> Self {
        Self { transport, address }
    }

    /// DiagnosticSessionControl (0x10)
    pub fn diagnostic_session_control(
        &mut self,
        session: UdsSessionType,
    ) -> DiagResult<ServiceResponse> {
        let resp = self.request(&[UdsCommand::DiagnosticSessionControl as u8, session.into()])?;
        if resp.is_positive() {
            info!("Diagnostic session control successful: session={session:?}");
        } else {
            warn!("Diagnostic session control failed: {resp:?}");
        }
        Ok(resp)
    }

    /// SecurityAccess (0x27). Odd sub-functions request a seed, even
    /// sub-functions carry the computed key.
    pub fn security_access(
        &mut self,
        sub_function: u8,
        key: Option<&[u8]>,
    ) -> DiagResult<ServiceResponse> {
        let mut req = vec![UdsCommand::SecurityAccess as u8, sub_function];
        if let Some(key) = key {
            req.extend_from_slice(key);
        }
        self.request(&req)
    }

    /// ReadDataByIdentifier (0x22) with a 16-bit big-endian DID
    pub fn read_data_by_identifier(&mut self, did: u16) -> DiagResult<ServiceResponse> {
        self.request(&[
            UdsCommand::ReadDataByIdentifier as u8,
            (did >> 8) as u8,
            did as u8,
        ])
    }

    /// ReadMemoryByAddress (0x23)
    pub fn read_memory_by_address(&mut self, address: u32, size: u32) -> DiagResult<ServiceResponse> {
        self.request(&encode_read_memory(address, size))
    }

    /// WriteMemoryByAddress (0x3D)
    pub fn write_memory_by_address(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> DiagResult<ServiceResponse> {
        self.request(&encode_write_memory(address, data))
    }

    /// RoutineControl (0x31)
    pub fn routine_control(
        &mut self,
        operation: RoutineOperation,
        routine_id: u16,
        data: &[u8],
    ) -> DiagResult<ServiceResponse> {
        let mut req = vec![
            UdsCommand::RoutineControl as u8,
            operation as u8,
            (routine_id >> 8) as u8,
            routine_id as u8,
        ];
        req.extend_from_slice(data);
        self.request(&req)
    }

    /// Sends a raw UDS request and parses the reply into a response record.
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::helpers::decode_scalar;

    #[test]
    fn read_memory_encoding() {
        // addr 0x00012345 needs 3 bytes, size 0x100 needs 2
        assert_eq!(
            encode_read_memory(0x0001_2345, 0x100),
            vec![0x23, 0x03, 0x01, 0x23, 0x45, 0x02, 0x01, 0x00]
        );
    }

    #[test]
    fn read_memory_encoding_round_trips() {
        for (addr, size) in [
            (0x00u32, 0x01u32),
            (0xFF, 0x10),
            (0x1234, 0x100),
            (0x12_3456, 0x1000),
            (0x1234_5678, 0xFFFF),
        ] {
            let enc = encode_read_memory(addr, size);
            assert_eq!(enc[0], 0x23);
            let (a, used) = decode_scalar(&enc[1..]).unwrap();
            let (s, used2) = decode_scalar(&enc[1 + used..]).unwrap();
            assert_eq!((a, s), (addr, size));
            assert_eq!(1 + used + used2, enc.len());
        }
    }

    #[test]
    fn write_memory_encoding() {
        assert_eq!(
            encode_write_memory(0xBEEF, &[0xCA, 0xFE]),
            vec![0x3D, 0x02, 0xBE, 0xEF, 0x01, 0x02, 0xCA, 0xFE]
        );
    }

    #[test]
    fn positive_response_parse() {
        // 0x63 = 0x23 + 0x40
        let resp = ServiceResponse::parse(&[0x63, 0x22, 0xDE, 0xAD], 0x7F, describe_nrc);
        assert_eq!(
            resp,
            ServiceResponse::Positive {
                sid: 0x23,
                data: vec![0x22, 0xDE, 0xAD]
            }
        );
    }

    #[test]
    fn negative_response_parse() {
        let resp = ServiceResponse::parse(&[0x7F, 0x27, 0x33], 0x7F, describe_nrc);
        assert_eq!(
            resp,
            ServiceResponse::Negative {
                sid: 0x27,
                nrc: 0x33,
                description: "Security access denied".into()
            }
        );
    }

    #[test]
    fn unknown_nrc_has_description() {
        assert_eq!(describe_nrc(0xAB), "Unknown NRC: 0xAB");
    }
}
