//! Discovery sweep against simulated ECUs

use std::collections::VecDeque;

use ecu_bin_reader::channel::{CanFrame, ChannelError, ChannelResult, FrameChannel};
use ecu_bin_reader::transport::CanTransport;
use ecu_bin_reader::{EcuManager, EcuProtocol};

/// Simulated bus: every transmitted frame is handed to the callback, which
/// may queue one response frame `(id, data)`.
pub struct SimBus<T: 'static + Send + Fn(u32, &[u8]) -> Option<(u32, Vec<u8>)>> {
    on_frame: T,
    out_queue: VecDeque<CanFrame>,
}

impl<T: 'static + Send + Fn(u32, &[u8]) -> Option<(u32, Vec<u8>)>> SimBus<T> {
    pub fn new(on_frame: T) -> Self {
        Self {
            on_frame,
            out_queue: VecDeque::new(),
        }
    }
}

impl<T: 'static + Send + Fn(u32, &[u8]) -> Option<(u32, Vec<u8>)>> std::fmt::Debug for SimBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimBus")
    }
}

impl<T: 'static + Send + Fn(u32, &[u8]) -> Option<(u32, Vec<u8>)>> FrameChannel for SimBus<T> {
    fn open(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        if let Some((id, data)) = (self.on_frame)(frame.get_address(), frame.get_data()) {
            self.out_queue.push_back(CanFrame::new(id, &data, false));
        }
        Ok(())
    }

    fn read_frame(&mut self, _timeout_ms: u32) -> ChannelResult<CanFrame> {
        self.out_queue.pop_front().ok_or(ChannelError::ReadTimeout)
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.out_queue.clear();
        Ok(())
    }
}

fn manager_over<T: 'static + Send + Fn(u32, &[u8]) -> Option<(u32, Vec<u8>)>>(
    on_frame: T,
) -> EcuManager {
    EcuManager::with_transport(CanTransport::from_channel(Box::new(SimBus::new(on_frame))))
}

#[test]
fn sweep_finds_single_uds_ecu() {
    // One ECU answering UDS DiagnosticSessionControl, responding on 0x7E8
    let mut mgr = manager_over(|id, data| {
        if id == 0x7E0 && data == [0x10, 0x01] {
            Some((0x7E8, vec![0x50, 0x01]))
        } else {
            None
        }
    });

    let ecus = mgr.scan_ecus().unwrap();
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].protocol, EcuProtocol::Uds);
    assert_eq!(ecus[0].address, 0x7E8);
    assert_eq!(ecus[0].ecu_id, "UDS_0x7E8");
}

#[test]
fn sweep_with_no_ecus_is_empty_not_an_error() {
    let mut mgr = manager_over(|_, _| None);
    let ecus = mgr.scan_ecus().unwrap();
    assert!(ecus.is_empty());
}

#[test]
fn busy_nrc_still_counts_as_uds_presence() {
    // A negative (non-timeout) reply to the session probe is still evidence
    // that something at this address speaks UDS
    let mut mgr = manager_over(|id, data| {
        if id == 0x7E3 - 0x08 && data[0] == 0x10 {
            Some((0x7E3, vec![0x7F, 0x10, 0x21]))
        } else {
            None
        }
    });

    let ecus = mgr.scan_ecus().unwrap();
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].protocol, EcuProtocol::Uds);
    assert_eq!(ecus[0].address, 0x7E3);
}

#[test]
fn kwp_ecu_classified_when_uds_probe_is_silent() {
    let mut mgr = manager_over(|id, data| {
        if id == 0x7E1 - 0x08 && data == [0x81] {
            Some((0x7E1, vec![0xC1, 0xEF, 0x8F]))
        } else {
            None
        }
    });

    let ecus = mgr.scan_ecus().unwrap();
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].protocol, EcuProtocol::Kwp);
    assert_eq!(ecus[0].ecu_id, "KWP_0x7E1");
}

#[test]
fn raw_can_fallback_when_no_protocol_answers() {
    let mut mgr = manager_over(|id, data| {
        if id == 0x7EA - 0x08 && data == [0x01, 0x00] {
            Some((0x7EA, vec![0x41, 0x00, 0xBE, 0x1F]))
        } else {
            None
        }
    });

    let ecus = mgr.scan_ecus().unwrap();
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].protocol, EcuProtocol::Can);
    assert_eq!(ecus[0].ecu_id, "CAN_0x7EA");
}

#[test]
fn one_descriptor_per_address_first_probe_wins() {
    // An ECU answering both UDS and KWP probes is recorded once, as UDS
    let mut mgr = manager_over(|id, data| {
        if id != 0x7E0 {
            return None;
        }
        match data {
            [0x10, 0x01] => Some((0x7E8, vec![0x50, 0x01])),
            [0x81] => Some((0x7E8, vec![0xC1, 0xEF, 0x8F])),
            _ => None,
        }
    });

    let ecus = mgr.scan_ecus().unwrap();
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].protocol, EcuProtocol::Uds);
}
