//! OBD-II adapter enumeration and probing
//!
//! Enumerates serial endpoints on the host and classifies each as a likely
//! OBD-II adapter. Classification is heuristic and intentionally inclusive;
//! [probe_adapter] confirms a candidate by talking to it.

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, error, info, warn};
use serialport::{SerialPortInfo, SerialPortType};

/// Baud rate used by virtually all ELM327-style adapters
pub const ADAPTER_BAUD: u32 = 38_400;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Descriptor substrings that mark a serial port as a likely OBD-II adapter
const OBD2_KEYWORDS: [&str; 9] = [
    "elm327",
    "obd",
    "obd2",
    "diagnostic",
    "scanner",
    "bluetooth",
    "wifi",
    "usb",
    "serial",
];

/// USB vendor IDs of chips commonly found in OBD-II adapters
const KNOWN_VENDOR_IDS: [(u16, &str); 6] = [
    (0x0403, "FTDI"),
    (0x067B, "Prolific"),
    (0x10C4, "Silicon Labs"),
    (0x1A86, "QinHeng Electronics"),
    (0x2341, "Arduino"),
    (0x04D8, "Microchip"),
];

/// Information about a detected OBD-II adapter.
///
/// Immutable after enumeration, except for `is_connected` which is flipped
/// by [probe_adapter] once the adapter has answered an AT command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Serial port identifier (e.g. `/dev/ttyUSB0`, `COM3`)
    pub port: String,
    /// Human readable port description
    pub description: String,
    /// Manufacturer string reported by the host OS
    pub manufacturer: String,
    /// USB vendor ID, if the port is USB backed
    pub vendor_id: Option<u16>,
    /// USB product ID, if the port is USB backed
    pub product_id: Option<u16>,
    /// Device serial number, if reported
    pub serial_number: Option<String>,
    /// Set once the adapter has answered a probe
    pub is_connected: bool,
}

/// Scans the host's serial ports for likely OBD-II adapters.
///
/// Ports are matched against a keyword list and a table of USB vendor IDs of
/// chips commonly used in adapters. False positives are expected; use
/// [probe_adapter] to confirm.
pub fn scan_adapters() -> Vec<AdapterInfo> {
    let ports = match serialport::available_ports() {
        Ok(p) => p,
        Err(e) => {
            error!("Error scanning serial ports: {e}");
            return Vec::new();
        }
    };

    let mut adapters = Vec::new();
    for port in ports {
        if let Some(adapter) = classify_port(&port) {
            info!(
                "Found OBD2 adapter candidate: {} on {}",
                adapter.description, adapter.port
            );
            adapters.push(adapter);
        }
    }
    adapters
}

fn classify_port(port: &SerialPortInfo) -> Option<AdapterInfo> {
    let (description, manufacturer, vid, pid, serial_number) = match &port.port_type {
        SerialPortType::UsbPort(usb) => (
            usb.product.clone().unwrap_or_default(),
            usb.manufacturer.clone().unwrap_or_default(),
            Some(usb.vid),
            Some(usb.pid),
            usb.serial_number.clone(),
        ),
        SerialPortType::BluetoothPort => ("Bluetooth serial".to_string(), String::new(), None, None, None),
        _ => (String::new(), String::new(), None, None, None),
    };

    if !matches_keywords(&description, &manufacturer) && !matches_vendor(vid) {
        return None;
    }

    Some(AdapterInfo {
        port: port.port_name.clone(),
        description,
        manufacturer,
        vendor_id: vid,
        product_id: pid,
        serial_number,
        is_connected: false,
    })
}

fn matches_keywords(description: &str, manufacturer: &str) -> bool {
    let description = description.to_lowercase();
    let manufacturer = manufacturer.to_lowercase();
    OBD2_KEYWORDS
        .iter()
        .any(|k| description.contains(k) || manufacturer.contains(k))
}

fn matches_vendor(vid: Option<u16>) -> bool {
    match vid {
        Some(v) => KNOWN_VENDOR_IDS.iter().any(|(id, _)| *id == v),
        None => false,
    }
}

/// Tests whether an adapter candidate actually answers like an ELM327.
///
/// Opens the port at 38,400 baud with a 1 second read timeout, sends `ATZ`
/// and reads up to 100 bytes. The adapter is considered present if the reply
/// contains `ELM327` or `OK`. On success, `is_connected` is set.
pub fn probe_adapter(adapter: &mut AdapterInfo) -> bool {
    let port = serialport::new(&adapter.port, ADAPTER_BAUD)
        .timeout(PROBE_TIMEOUT)
        .open();

    let mut port = match port {
        Ok(p) => p,
        Err(e) => {
            error!("Error opening adapter {}: {e}", adapter.port);
            return false;
        }
    };

    if let Err(e) = port.write_all(b"ATZ\r\n") {
        error!("Error writing to adapter {}: {e}", adapter.port);
        return false;
    }

    let mut buf = [0u8; 100];
    let n = match port.read(&mut buf) {
        Ok(n) => n,
        Err(e) => {
            warn!("Adapter {} did not answer ATZ: {e}", adapter.port);
            return false;
        }
    };

    let reply = String::from_utf8_lossy(&buf[..n]);
    debug!("Adapter {} ATZ reply: {reply:?}", adapter.port);
    if reply.contains("ELM327") || reply.contains("OK") {
        adapter.is_connected = true;
        info!("Adapter {} is working", adapter.port);
        true
    } else {
        warn!("Adapter {} did not respond correctly", adapter.port);
        false
    }
}
