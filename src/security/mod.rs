//! Seed/key security access negotiation
//!
//! Memory reads and writes on most ECUs are gated behind SecurityAccess: the
//! ECU hands out a seed, the tester answers with a key derived from it. Key
//! derivations are vendor specific, so they live in a registry keyed by
//! name; callers plug in their own with [SecurityAccess::register_algorithm].

use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::time::Duration;

use log::{debug, info, warn};

use crate::discover::{EcuInfo, EcuProtocol};
use crate::kwp2000::Kwp2000Protocol;
use crate::response::ServiceResponse;
use crate::transport::CanTransport;
use crate::uds::UdsProtocol;
use crate::DiagResult;

pub mod algorithms;

/// Security levels attempted by [SecurityAccess::unlock], in order
pub const SECURITY_LEVELS: [u8; 5] = [1, 2, 3, 5, 7];

/// Wait before the single key-reply retry after NRC 0x37
const TIME_DELAY_RETRY: Duration = Duration::from_secs(1);

/// A seed/key derivation: `(seed, level)` to key bytes, or [None] when the
/// seed is unusable for this algorithm.
pub type SeedKeyFn = Box<dyn Fn(&[u8], u8) -> Option<Vec<u8>> + Send + Sync>;

/// Error produced during security access negotiation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    /// No algorithm with the requested name is registered
    #[error("unknown seed/key algorithm '{0}'")]
    UnknownAlgorithm(String),
    /// The seed request was rejected or went unanswered
    #[error("seed request rejected or unanswered")]
    SeedRequestFailed,
    /// The ECU answered the seed request with an empty seed
    #[error("ECU returned an empty seed")]
    SeedEmpty,
    /// The algorithm produced no key for the received seed
    #[error("algorithm produced no key for the received seed")]
    KeyUnavailable,
    /// The ECU rejected the computed key
    #[error("key rejected with NRC 0x{0:02X}")]
    KeyRejected(u8),
    /// The ECU did not answer the key reply
    #[error("key reply unanswered")]
    KeyUnanswered,
    /// The key was rejected again after the mandated time-delay retry
    #[error("key rejected again after time-delay retry")]
    DelayRetryFailed,
    /// Every security level was attempted without success
    #[error("security access failed at all levels")]
    AllLevelsFailed,
}

/// Security access negotiator with its algorithm registry.
///
/// The registry is plain process-local state owned by this struct; it ships
/// with a `default` algorithm and eight vendor placeholders.
pub struct SecurityAccess {
    algorithms: HashMap<String, SeedKeyFn>,
}

impl Debug for SecurityAccess {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "SecurityAccess({} algorithms)", self.algorithms.len())
    }
}

impl Default for SecurityAccess {
    fn default() -> Self {
        let mut s = Self {
            algorithms: HashMap::new(),
        };
        s.register_algorithm("default", algorithms::default);
        s.register_algorithm("bmw", algorithms::bmw);
        s.register_algorithm("audi", algorithms::audi);
        s.register_algorithm("mercedes", algorithms::mercedes);
        s.register_algorithm("volkswagen", algorithms::volkswagen);
        s.register_algorithm("toyota", algorithms::toyota);
        s.register_algorithm("honda", algorithms::honda);
        s.register_algorithm("ford", algorithms::ford);
        s.register_algorithm("gm", algorithms::gm);
        s
    }
}

impl SecurityAccess {
    /// Creates a negotiator with the built-in algorithms registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a seed/key algorithm under `name`
    pub fn register_algorithm<F>(&mut self, name: &str, algorithm: F)
    where
        F: Fn(&[u8], u8) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.algorithms.insert(name.to_string(), Box::new(algorithm));
        debug!("Registered seed/key algorithm: {name}");
    }

    /// Returns the names of all registered algorithms
    pub fn algorithm_names(&self) -> Vec<String> {
        self.algorithms.keys().cloned().collect()
    }

    /// Negotiates security access with the selected ECU.
    ///
    /// Levels `[1, 2, 3, 5, 7]` are tried in order. Per level: request a
    /// seed (odd sub-function), derive a key with the named algorithm, send
    /// it back (even sub-function). A rejection with NRC 0x37 sleeps one
    /// second and retries the key reply exactly once.
    ///
    /// Returns the unlocked level, or the failure of the last attempted
    /// level once all are exhausted. Transport errors abort immediately.
    pub fn unlock(
        &self,
        transport: &mut CanTransport,
        ecu: &EcuInfo,
        algorithm: &str,
    ) -> DiagResult<u8> {
        let derive = self
            .algorithms
            .get(algorithm)
            .ok_or_else(|| SecurityError::UnknownAlgorithm(algorithm.to_string()))?;

        info!(
            "Starting security access on {} with algorithm: {algorithm}",
            ecu.ecu_id
        );

        let mut last_failure = SecurityError::AllLevelsFailed;
        for level in SECURITY_LEVELS {
            match self.try_level(transport, ecu, level, derive)? {
                Ok(()) => {
                    info!("Security access successful at level {level}");
                    return Ok(level);
                }
                Err(e) => {
                    debug!("Security level {level} failed: {e}");
                    last_failure = e;
                }
            }
        }
        warn!("Security access failed at all levels on {}", ecu.ecu_id);
        Err(last_failure.into())
    }

    /// Attempts one security level. The outer `Result` carries transport
    /// failures, the inner one the per-level outcome.
    fn try_level(
        &self,
        transport: &mut CanTransport,
        ecu: &EcuInfo,
        level: u8,
        derive: &SeedKeyFn,
    ) -> DiagResult<Result<(), SecurityError>> {
        let seed_sub = if level % 2 == 1 { level } else { level - 1 };
        let seed_resp = send_security(transport, ecu, seed_sub, None)?;
        let seed = match seed_resp {
            ServiceResponse::Positive { data, .. } => {
                // The ECU echoes the sub-function ahead of the seed bytes
                let seed: Vec<u8> = if data.first() == Some(&seed_sub) {
                    data[1..].to_vec()
                } else {
                    data
                };
                if seed.is_empty() {
                    return Ok(Err(SecurityError::SeedEmpty));
                }
                seed
            }
            other => {
                debug!("Seed request failed at level {seed_sub}: {other:?}");
                return Ok(Err(SecurityError::SeedRequestFailed));
            }
        };

        let key = match derive(&seed, level) {
            Some(k) => k,
            None => {
                debug!("Key calculation failed for level {level}");
                return Ok(Err(SecurityError::KeyUnavailable));
            }
        };

        let key_sub = if level % 2 == 0 { level } else { level + 1 };
        match send_security(transport, ecu, key_sub, Some(&key))? {
            ServiceResponse::Positive { .. } => Ok(Ok(())),
            ServiceResponse::Negative { nrc: 0x37, .. } => {
                warn!("Required time delay not expired, retrying key reply in 1s");
                std::thread::sleep(TIME_DELAY_RETRY);
                match send_security(transport, ecu, key_sub, Some(&key))? {
                    ServiceResponse::Positive { .. } => Ok(Ok(())),
                    _ => Ok(Err(SecurityError::DelayRetryFailed)),
                }
            }
            ServiceResponse::Negative { nrc, .. } => Ok(Err(SecurityError::KeyRejected(nrc))),
            ServiceResponse::NoResponse => Ok(Err(SecurityError::KeyUnanswered)),
        }
    }
}

/// Issues a SecurityAccess request through the ECU's protocol.
///
/// Raw-CAN ECUs are addressed with the UDS framing, matching the memory-read
/// engine's treatment of them.
fn send_security(
    transport: &mut CanTransport,
    ecu: &EcuInfo,
    sub_function: u8,
    key: Option<&[u8]>,
) -> DiagResult<ServiceResponse> {
    match ecu.protocol {
        EcuProtocol::Uds | EcuProtocol::Can => {
            UdsProtocol::new(transport, u32::from(ecu.address)).security_access(sub_function, key)
        }
        EcuProtocol::Kwp => Kwp2000Protocol::new(transport, u32::from(ecu.address))
            .security_access(sub_function, key),
    }
}
