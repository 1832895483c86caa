//! End-to-end BIN extraction from a simulated UDS ECU

use std::collections::VecDeque;

use ecu_bin_reader::channel::{CanFrame, ChannelError, ChannelResult, FrameChannel};
use ecu_bin_reader::helpers::decode_scalar;
use ecu_bin_reader::transport::CanTransport;
use ecu_bin_reader::{DiagError, EcuManager, EcuProtocol, ReadStatus};

const ECU_ADDR: u32 = 0x7E8;
const REQ_ADDR: u32 = ECU_ADDR - 0x08;
const SEED: [u8; 4] = [0x11, 0x22, 0x33, 0x44];
// default algorithm, level 1: seed XOR 0x54
const KEY: [u8; 4] = [0x45, 0x76, 0x67, 0x10];

/// Simulated UDS ECU holding a small memory image.
///
/// Serves at most 4 bytes per memory-read so a dump exercises the
/// advance-by-actual-length path, and refuses reads until unlocked.
#[derive(Debug)]
struct SimUdsEcu {
    image: Vec<u8>,
    unlocked: bool,
    /// Memory reads at or above this address draw a negative response
    fail_at: Option<u32>,
    out_queue: VecDeque<CanFrame>,
}

impl SimUdsEcu {
    fn new(fail_at: Option<u32>) -> Self {
        Self {
            image: (0..64).map(|i| (i as u8).wrapping_mul(3)).collect(),
            unlocked: false,
            fail_at,
            out_queue: VecDeque::new(),
        }
    }

    fn reply(&mut self, data: Vec<u8>) {
        self.out_queue.push_back(CanFrame::new(ECU_ADDR, &data, false));
    }

    fn on_request(&mut self, data: &[u8]) {
        match data {
            [0x10, session] => self.reply(vec![0x50, *session]),
            [0x27, 0x01] => {
                let mut r = vec![0x67, 0x01];
                r.extend_from_slice(&SEED);
                self.reply(r);
            }
            [0x27, 0x02, key @ ..] => {
                if key == KEY {
                    self.unlocked = true;
                    self.reply(vec![0x67, 0x02]);
                } else {
                    self.reply(vec![0x7F, 0x27, 0x35]);
                }
            }
            [0x27, sub, ..] => self.reply(vec![0x7F, 0x27, if *sub % 2 == 1 { 0x12 } else { 0x35 }]),
            [0x22, 0xF1, 0x90] => self.reply(vec![0x62, 0xF1, 0x90, b'V', b'1', b'2']),
            [0x22, 0xF1, 0x87] => self.reply(vec![0x62, 0xF1, 0x87, b'A', b'B']),
            [0x23, rest @ ..] => {
                if !self.unlocked {
                    self.reply(vec![0x7F, 0x23, 0x33]);
                    return;
                }
                let (addr, used) = decode_scalar(rest).unwrap();
                let (size, _) = decode_scalar(&rest[used..]).unwrap();
                if let Some(fail) = self.fail_at {
                    if addr >= fail {
                        self.reply(vec![0x7F, 0x23, 0x22]);
                        return;
                    }
                }
                let start = addr as usize;
                let end = std::cmp::min(start + std::cmp::min(size as usize, 4), self.image.len());
                let mut r = vec![0x63];
                r.extend_from_slice(&self.image[start..end]);
                self.reply(r);
            }
            _ => {}
        }
    }
}

impl FrameChannel for SimUdsEcu {
    fn open(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn send_frame(&mut self, frame: &CanFrame) -> ChannelResult<()> {
        if frame.get_address() == REQ_ADDR {
            let data = frame.get_data().to_vec();
            self.on_request(&data);
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

fn manager(fail_at: Option<u32>) -> EcuManager {
    EcuManager::with_transport(CanTransport::from_channel(Box::new(SimUdsEcu::new(fail_at))))
}

#[test]
fn full_dump_flow() {
    let mut mgr = manager(None);

    let ecus = mgr.scan_ecus().unwrap();
    assert_eq!(ecus.len(), 1);
    assert_eq!(ecus[0].protocol, EcuProtocol::Uds);
    assert_eq!(ecus[0].address, 0x7E8);

    mgr.select_ecu(&ecus[0]).unwrap();
    let selected = mgr.selected_ecu().unwrap();
    assert_eq!(selected.vin.as_deref(), Some("V12"));
    assert_eq!(selected.manufacturer.as_deref(), Some("AB"));

    mgr.read_bin(0, 64).unwrap();

    let progress = mgr.progress();
    assert_eq!(progress.status, ReadStatus::Complete);
    assert_eq!(progress.bytes_read, 64);
    assert_eq!(progress.total_bytes, 64);
    assert_eq!(progress.current_address, 64);

    let expected: Vec<u8> = (0..64).map(|i| (i as u8).wrapping_mul(3)).collect();
    assert_eq!(mgr.bin_data(), expected.as_slice());
    assert_eq!(mgr.unlocked_level(), Some(1));

    assert_eq!(mgr.default_file_name().unwrap(), "V12_UDS_0x7E8.bin");
}

#[test]
fn dump_is_deterministic() {
    let run = || {
        let mut mgr = manager(None);
        let ecus = mgr.scan_ecus().unwrap();
        mgr.select_ecu(&ecus[0]).unwrap();
        mgr.read_bin(0, 32).unwrap();
        mgr.bin_data().to_vec()
    };
    assert_eq!(run(), run());
}

#[test]
fn failed_read_truncates_to_transferred_bytes() {
    let mut mgr = manager(Some(8));
    let ecus = mgr.scan_ecus().unwrap();
    mgr.select_ecu(&ecus[0]).unwrap();

    let res = mgr.read_bin(0, 64);
    assert!(matches!(res, Err(DiagError::EcuError { code: 0x22, .. })));

    let progress = mgr.progress();
    assert_eq!(progress.status, ReadStatus::Error);
    assert_eq!(progress.error_message.as_deref(), Some("Conditions not correct"));
    assert_eq!(progress.bytes_read, 8);
    assert!(progress.bytes_read <= progress.total_bytes);
    // Partial data stays available, ECU stays selected
    assert_eq!(mgr.bin_data().len(), 8);
    assert!(mgr.selected_ecu().is_some());
}

#[test]
fn save_bin_writes_raw_image() {
    let mut mgr = manager(None);
    let ecus = mgr.scan_ecus().unwrap();
    mgr.select_ecu(&ecus[0]).unwrap();
    mgr.read_bin(0, 16).unwrap();

    let path = std::env::temp_dir().join("ecu_bin_reader_test_dump.bin");
    let written = mgr.save_bin(Some(path.as_path())).unwrap();
    let on_disk = std::fs::read(&written).unwrap();
    assert_eq!(on_disk, mgr.bin_data());
    std::fs::remove_file(&written).unwrap();
}

#[test]
fn progress_handle_observes_from_another_thread() {
    let mut mgr = manager(None);
    let ecus = mgr.scan_ecus().unwrap();
    mgr.select_ecu(&ecus[0]).unwrap();

    let handle = mgr.progress_handle();
    mgr.read_bin(0, 16).unwrap();

    let observer = std::thread::spawn(move || handle.snapshot());
    let snapshot = observer.join().unwrap();
    assert_eq!(snapshot.status, ReadStatus::Complete);
    assert_eq!(snapshot.bytes_read, 16);
}
