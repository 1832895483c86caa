//! ECU manager facade
//!
//! Single entry point composing the adapter, transport, protocol encoders,
//! security access and the memory-read engine into one session object. The
//! manager owns the transport and the BIN buffer; protocol encoders are
//! created per operation and borrow the transport only for that call.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::adapter::AdapterInfo;
use crate::discover::{self, EcuInfo, EcuProtocol};
use crate::kwp2000::Kwp2000Protocol;
use crate::memory::{self, CancelToken, ReadProgress, ReadStatus, DEFAULT_BLOCK_SIZE};
use crate::security::SecurityAccess;
use crate::transport::CanTransport;
use crate::uds::UdsProtocol;
use crate::{DiagError, DiagResult};

/// Read-only view of the progress record, safe to hand to another thread
/// while a read is running on this one.
#[derive(Debug, Clone)]
pub struct ProgressHandle(Arc<Mutex<ReadProgress>>);

impl ProgressHandle {
    /// Takes a snapshot of the current progress
    pub fn snapshot(&self) -> ReadProgress {
        self.0.lock().unwrap().clone()
    }
}

/// Orchestrates a diagnostic session against one vehicle.
///
/// All operations are synchronous and blocking; a host that wants a
/// responsive UI runs the manager on a worker thread and watches progress
/// through a [ProgressHandle].
#[derive(Debug)]
pub struct EcuManager {
    adapter: Option<AdapterInfo>,
    transport: Option<CanTransport>,
    security: SecurityAccess,
    security_algorithm: String,
    discovered: Vec<EcuInfo>,
    selected: Option<EcuInfo>,
    unlocked_level: Option<u8>,
    bin_data: Vec<u8>,
    progress: Arc<Mutex<ReadProgress>>,
    cancel: CancelToken,
}

impl EcuManager {
    /// Creates a manager for the given adapter. Call
    /// [EcuManager::init_communication] before anything else.
    pub fn new(adapter: AdapterInfo) -> Self {
        Self {
            adapter: Some(adapter),
            transport: None,
            security: SecurityAccess::new(),
            security_algorithm: "default".to_string(),
            discovered: Vec::new(),
            selected: None,
            unlocked_level: None,
            bin_data: Vec::new(),
            progress: Arc::new(Mutex::new(ReadProgress::default())),
            cancel: CancelToken::new(),
        }
    }

    /// Creates a manager over an already-open transport.
    ///
    /// This bypasses adapter probing and backend selection; it is the entry
    /// point for custom [crate::channel::FrameChannel] implementations and
    /// for the simulated ECUs used in tests.
    pub fn with_transport(transport: CanTransport) -> Self {
        Self {
            adapter: None,
            transport: Some(transport),
            security: SecurityAccess::new(),
            security_algorithm: "default".to_string(),
            discovered: Vec::new(),
            selected: None,
            unlocked_level: None,
            bin_data: Vec::new(),
            progress: Arc::new(Mutex::new(ReadProgress::default())),
            cancel: CancelToken::new(),
        }
    }

    /// Opens the CAN transport for the configured adapter, trying native
    /// interfaces first and falling back to the ELM327 serial tunnel.
    pub fn init_communication(&mut self) -> DiagResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let adapter = self.adapter.as_ref().ok_or(DiagError::NotConnected)?;
        info!("Initializing communication with adapter: {}", adapter.port);
        self.transport = Some(CanTransport::open(adapter)?);
        info!("Communication initialized successfully");
        Ok(())
    }

    /// Selects the seed/key algorithm used for security access.
    /// The registry ships `default` plus the vendor placeholders.
    pub fn set_security_algorithm(&mut self, name: &str) {
        self.security_algorithm = name.to_string();
    }

    /// Registers a custom seed/key algorithm under `name`
    pub fn register_security_algorithm<F>(&mut self, name: &str, algorithm: F)
    where
        F: Fn(&[u8], u8) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.security.register_algorithm(name, algorithm);
    }

    /// Sweeps the diagnostic address range and returns the ECUs found
    pub fn scan_ecus(&mut self) -> DiagResult<Vec<EcuInfo>> {
        let transport = self.transport.as_mut().ok_or(DiagError::NotConnected)?;
        self.discovered = discover::scan(transport)?;
        Ok(self.discovered.clone())
    }

    /// Returns the ECUs found by the last scan
    pub fn discovered_ecus(&self) -> &[EcuInfo] {
        &self.discovered
    }

    /// Selects an ECU for subsequent operations and reads its
    /// identification data (VIN, manufacturer) where the protocol allows.
    pub fn select_ecu(&mut self, ecu: &EcuInfo) -> DiagResult<()> {
        let transport = self.transport.as_mut().ok_or(DiagError::NotConnected)?;
        info!("Selecting ECU: {}", ecu.ecu_id);
        let mut selected = ecu.clone();
        discover::read_identification(transport, &mut selected);
        self.selected = Some(selected);
        self.unlocked_level = None;
        Ok(())
    }

    /// Returns the currently selected ECU, if any
    pub fn selected_ecu(&self) -> Option<&EcuInfo> {
        self.selected.as_ref()
    }

    /// Security level unlocked during the last read, if any
    pub fn unlocked_level(&self) -> Option<u8> {
        self.unlocked_level
    }

    /// Reads `[start_address, end_address)` from the selected ECU with the
    /// default block size of 256 bytes.
    pub fn read_bin(&mut self, start_address: u32, end_address: u32) -> DiagResult<()> {
        self.read_bin_with_block_size(start_address, end_address, DEFAULT_BLOCK_SIZE)
    }

    /// Reads `[start_address, end_address)` from the selected ECU.
    ///
    /// Clears the BIN buffer, negotiates security access (skipped for raw
    /// CAN targets), then drives the chunked read loop. On failure the
    /// partial buffer remains available and the progress record carries the
    /// error; the ECU stays selected and the transport stays open.
    pub fn read_bin_with_block_size(
        &mut self,
        start_address: u32,
        end_address: u32,
        block_size: u32,
    ) -> DiagResult<()> {
        let ecu = self.selected.clone().ok_or(DiagError::NoEcuSelected)?;
        memory::validate(start_address, end_address, block_size)?;
        let transport = self.transport.as_mut().ok_or(DiagError::NotConnected)?;

        info!("Starting BIN read from ECU: {}", ecu.ecu_id);
        self.cancel.reset();
        self.bin_data.clear();
        self.unlocked_level = None;
        *self.progress.lock().unwrap() = ReadProgress::begin(start_address, end_address);

        match ecu.protocol {
            EcuProtocol::Uds | EcuProtocol::Kwp => {
                match self
                    .security
                    .unlock(transport, &ecu, &self.security_algorithm)
                {
                    Ok(level) => self.unlocked_level = Some(level),
                    Err(e) => {
                        error!("Security access failed: {e}");
                        let mut p = self.progress.lock().unwrap();
                        p.status = ReadStatus::Error;
                        p.error_message = Some(e.to_string());
                        return Err(e);
                    }
                }
            }
            EcuProtocol::Can => {
                info!("Raw CAN target, proceeding without security access");
            }
        }

        let addr = u32::from(ecu.address);
        let read_block = |address: u32, size: u32| match ecu.protocol {
            // Raw-CAN targets proved they answer raw frames; address their
            // memory with the UDS service encoding
            EcuProtocol::Uds | EcuProtocol::Can => {
                UdsProtocol::new(&mut *transport, addr).read_memory_by_address(address, size)
            }
            EcuProtocol::Kwp => {
                Kwp2000Protocol::new(&mut *transport, addr).read_memory_by_address(address, size)
            }
        };

        memory::run_read(
            read_block,
            start_address,
            end_address,
            block_size,
            &mut self.bin_data,
            &self.progress,
            &self.cancel,
        )
    }

    /// Returns the BIN data accumulated by the last read (possibly partial)
    pub fn bin_data(&self) -> &[u8] {
        &self.bin_data
    }

    /// Takes a snapshot of the current read progress
    pub fn progress(&self) -> ReadProgress {
        self.progress.lock().unwrap().clone()
    }

    /// Returns a cloneable read-only handle onto the progress record
    pub fn progress_handle(&self) -> ProgressHandle {
        ProgressHandle(self.progress.clone())
    }

    /// Returns the cancellation token for the current/next read
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Conventional file name for the current dump: `<VIN>_<ecu_id>.bin`,
    /// with a missing VIN rendered as `UNKNOWN` and spaces replaced by
    /// underscores.
    pub fn default_file_name(&self) -> DiagResult<String> {
        let ecu = self.selected.as_ref().ok_or(DiagError::NoEcuSelected)?;
        let vin = ecu.vin.as_deref().unwrap_or("UNKNOWN");
        let ecu_id = ecu.ecu_id.replace(' ', "_");
        Ok(format!("{vin}_{ecu_id}.bin"))
    }

    /// Writes the BIN buffer to disk.
    ///
    /// With `path == None` the file is named by [EcuManager::default_file_name]
    /// in the current directory. Parent directories are created as needed.
    /// Returns the path written.
    pub fn save_bin(&self, path: Option<&Path>) -> DiagResult<PathBuf> {
        if self.bin_data.is_empty() {
            error!("No BIN data to save");
            return Err(DiagError::NoBinData);
        }
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(self.default_file_name()?),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&path, &self.bin_data)?;
        info!("BIN file saved: {}", path.display());
        Ok(path)
    }

    /// Closes the transport. The selected ECU and any partial BIN data
    /// remain available.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                error!("Error disconnecting: {e}");
            }
        }
        info!("Disconnected from ECU");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::discover::EcuProtocol;

    fn manager_with_selected(vin: Option<&str>, ecu_id: &str) -> EcuManager {
        let mut mgr =
            EcuManager::with_transport(CanTransport::from_channel(Box::new(DeadChannel)));
        mgr.selected = Some(EcuInfo {
            ecu_id: ecu_id.to_string(),
            protocol: EcuProtocol::Uds,
            address: 0x7E0,
            vin: vin.map(str::to_string),
            manufacturer: None,
            model: None,
            version: None,
        });
        mgr
    }

    #[derive(Debug)]
    pub(super) struct DeadChannel;

    impl crate::channel::FrameChannel for DeadChannel {
        fn open(&mut self) -> crate::channel::ChannelResult<()> {
            Ok(())
        }
        fn close(&mut self) -> crate::channel::ChannelResult<()> {
            Ok(())
        }
        fn send_frame(
            &mut self,
            _frame: &crate::channel::CanFrame,
        ) -> crate::channel::ChannelResult<()> {
            Ok(())
        }
        fn read_frame(
            &mut self,
            _timeout_ms: u32,
        ) -> crate::channel::ChannelResult<crate::channel::CanFrame> {
            Err(crate::channel::ChannelError::ReadTimeout)
        }
        fn clear_rx_buffer(&mut self) -> crate::channel::ChannelResult<()> {
            Ok(())
        }
    }

    #[test]
    fn default_file_name_template() {
        let mgr = manager_with_selected(Some("WBA12345"), "UDS_0x7E0");
        assert_eq!(mgr.default_file_name().unwrap(), "WBA12345_UDS_0x7E0.bin");
    }

    #[test]
    fn default_file_name_without_vin() {
        let mgr = manager_with_selected(None, "UDS 0x7E0");
        assert_eq!(mgr.default_file_name().unwrap(), "UNKNOWN_UDS_0x7E0.bin");
    }

    #[test]
    fn save_bin_requires_data() {
        let mgr = manager_with_selected(None, "UDS_0x7E0");
        assert!(matches!(mgr.save_bin(None), Err(DiagError::NoBinData)));
    }

    #[test]
    fn read_bin_requires_selection() {
        let mut mgr = EcuManager::with_transport(CanTransport::from_channel(Box::new(DeadChannel)));
        assert!(matches!(
            mgr.read_bin(0, 0x100),
            Err(DiagError::NoEcuSelected)
        ));
    }

    #[test]
    fn read_bin_rejects_inverted_range_before_touching_progress() {
        let mut mgr = manager_with_selected(None, "UDS_0x7E0");
        assert!(matches!(
            mgr.read_bin(0x100, 0x0),
            Err(DiagError::ParameterInvalid(_))
        ));
        assert_eq!(mgr.progress().status, ReadStatus::Idle);
    }
}
