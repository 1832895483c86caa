//! ECU discovery across the standard diagnostic address range
//!
//! Sweeps the response ids `0x7E0..=0x7EF`, probing each address with UDS
//! first, then KWP2000, then a raw CAN poke. Real ECUs may answer a first
//! contact with a busy NRC rather than a positive response, so any
//! non-timeout reply counts as presence; the protocol is disambiguated by
//! which probe elicited the reply.

use log::{debug, info, warn};

use crate::channel::ChannelError;
use crate::kwp2000::Kwp2000Protocol;
use crate::response::ServiceResponse;
use crate::transport::{request_id, CanTransport, DEFAULT_TIMEOUT_MS};
use crate::uds::{UdsProtocol, UdsSessionType};
use crate::DiagResult;

/// First diagnostic response address of the standard OBD-II range
pub const DIAG_ADDR_FIRST: u16 = 0x7E0;
/// Last diagnostic response address of the standard OBD-II range
pub const DIAG_ADDR_LAST: u16 = 0x7EF;

/// Data identifier of the vehicle identification number
pub const DID_VIN: u16 = 0xF190;
/// Data identifier of the ECU manufacturer string
pub const DID_MANUFACTURER: u16 = 0xF187;

/// Diagnostic protocol spoken by a discovered ECU
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display, strum_macros::EnumString)]
pub enum EcuProtocol {
    /// Unified diagnostic services (ISO14229)
    #[strum(serialize = "UDS")]
    Uds,
    /// Keyword protocol 2000 (ISO14230)
    #[strum(serialize = "KWP")]
    Kwp,
    /// Raw CAN frames with no diagnostic protocol identified
    #[strum(serialize = "CAN")]
    Can,
}

/// A discovered ECU.
///
/// Produced by [scan]; identification fields are populated lazily by
/// [read_identification] once the ECU is selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuInfo {
    /// Stable identifier derived from protocol and address, e.g. `UDS_0x7E0`
    pub ecu_id: String,
    /// Diagnostic protocol the ECU answered to
    pub protocol: EcuProtocol,
    /// 11-bit diagnostic response address
    pub address: u16,
    /// Vehicle identification number, if read
    pub vin: Option<String>,
    /// Manufacturer string, if read
    pub manufacturer: Option<String>,
    /// Model string, if read
    pub model: Option<String>,
    /// Version string, if read
    pub version: Option<String>,
}

impl EcuInfo {
    fn new(protocol: EcuProtocol, address: u16) -> Self {
        Self {
            ecu_id: format!("{protocol}_0x{address:03X}"),
            protocol,
            address,
            vin: None,
            manufacturer: None,
            model: None,
            version: None,
        }
    }
}

/// Sweeps the diagnostic address range for ECUs.
///
/// A single address produces at most one descriptor; the first probe that
/// draws a reply wins. An empty result is not an error.
pub fn scan(transport: &mut CanTransport) -> DiagResult<Vec<EcuInfo>> {
    info!("Starting ECU scan...");
    let mut found = Vec::new();
    for address in DIAG_ADDR_FIRST..=DIAG_ADDR_LAST {
        if let Some(ecu) = probe_address(transport, address)? {
            info!("Found ECU: {} at 0x{address:03X}", ecu.ecu_id);
            found.push(ecu);
        }
    }
    info!("ECU scan complete. Found {} ECUs", found.len());
    Ok(found)
}

/// Probes one diagnostic address, trying UDS, then KWP, then raw CAN.
pub fn probe_address(transport: &mut CanTransport, address: u16) -> DiagResult<Option<EcuInfo>> {
    let addr = u32::from(address);

    let resp = UdsProtocol::new(transport, addr).diagnostic_session_control(UdsSessionType::Default)?;
    if !matches!(resp, ServiceResponse::NoResponse) {
        return Ok(Some(EcuInfo::new(EcuProtocol::Uds, address)));
    }

    let resp = Kwp2000Protocol::new(transport, addr).start_communication()?;
    if !matches!(resp, ServiceResponse::NoResponse) {
        return Ok(Some(EcuInfo::new(EcuProtocol::Kwp, address)));
    }

    match transport.send_and_recv(request_id(addr), &[0x01, 0x00], DEFAULT_TIMEOUT_MS) {
        Ok(frame) if !frame.get_data().is_empty() => {
            Ok(Some(EcuInfo::new(EcuProtocol::Can, address)))
        }
        Ok(_) => Ok(None),
        Err(ChannelError::ReadTimeout) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Populates the identification fields of a selected ECU.
///
/// UDS ECUs are asked for VIN (DID 0xF190) and manufacturer (DID 0xF187);
/// KWP ECUs get the same identifiers through ReadDataByCommonIdentifier.
/// Failures leave the fields empty.
pub fn read_identification(transport: &mut CanTransport, ecu: &mut EcuInfo) {
    let addr = u32::from(ecu.address);
    match ecu.protocol {
        EcuProtocol::Uds => {
            ecu.vin = read_uds_did(transport, addr, DID_VIN);
            ecu.manufacturer = read_uds_did(transport, addr, DID_MANUFACTURER);
        }
        EcuProtocol::Kwp => {
            ecu.vin = read_kwp_did(transport, addr, DID_VIN);
            ecu.manufacturer = read_kwp_did(transport, addr, DID_MANUFACTURER);
        }
        EcuProtocol::Can => {}
    }
}

fn read_uds_did(transport: &mut CanTransport, addr: u32, did: u16) -> Option<String> {
    match UdsProtocol::new(transport, addr).read_data_by_identifier(did) {
        Ok(resp) => decode_did_string(&resp, did),
        Err(e) => {
            warn!("Error reading DID 0x{did:04X}: {e}");
            None
        }
    }
}

fn read_kwp_did(transport: &mut CanTransport, addr: u32, did: u16) -> Option<String> {
    match Kwp2000Protocol::new(transport, addr).read_data_by_common_identifier(did) {
        Ok(resp) => decode_did_string(&resp, did),
        Err(e) => {
            warn!("Error reading identifier 0x{did:04X}: {e}");
            None
        }
    }
}

/// Extracts the string value of an identification read, stripping the
/// echoed identifier bytes.
fn decode_did_string(resp: &ServiceResponse, did: u16) -> Option<String> {
    let data = resp.positive_data()?;
    if data.len() < 2 || data[0] != (did >> 8) as u8 || data[1] != did as u8 {
        debug!("Identifier echo mismatch in {data:02X?}");
        return None;
    }
    let text = String::from_utf8_lossy(&data[2..]).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}
