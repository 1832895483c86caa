//! Shared response record returned by every diagnostic service call
//!
//! Both UDS and KWP2000 use the same positive-response convention (first
//! byte = request SID + 0x40); only the negative-response introducer byte
//! differs between the two protocols (0x7F for UDS, 0xBF for KWP2000).

use log::warn;

/// Outcome of a single diagnostic service call.
///
/// Service methods never fail on a negative or missing reply; the outcome is
/// carried in this record and callers inspect the variant. Transport failures
/// are the only errors that propagate as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    /// The ECU accepted the request
    Positive {
        /// Service ID the response belongs to (response byte - 0x40)
        sid: u8,
        /// Response payload, excluding the response SID byte
        data: Vec<u8>,
    },
    /// The ECU rejected the request
    Negative {
        /// Service ID the rejection refers to
        sid: u8,
        /// Raw negative response code
        nrc: u8,
        /// Human readable NRC definition according to the protocol
        description: String,
    },
    /// No reply arrived within the transport timeout
    NoResponse,
}

impl ServiceResponse {
    /// Returns true for a positive response
    pub fn is_positive(&self) -> bool {
        matches!(self, ServiceResponse::Positive { .. })
    }

    /// Returns the payload of a positive response, if any
    pub fn positive_data(&self) -> Option<&[u8]> {
        match self {
            ServiceResponse::Positive { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Parses raw response bytes into a response record.
    ///
    /// ## Parameters
    /// * bytes - Raw message as received from the bus
    /// * negative_introducer - First byte of a negative response for the
    ///   protocol in use (0x7F for UDS, 0xBF for KWP2000)
    /// * describe - NRC description lookup for the protocol in use
    pub(crate) fn parse(
        bytes: &[u8],
        negative_introducer: u8,
        describe: fn(u8) -> String,
    ) -> Self {
        match bytes {
            [] => ServiceResponse::NoResponse,
            [intro, sid, nrc, ..] if *intro == negative_introducer => ServiceResponse::Negative {
                sid: *sid,
                nrc: *nrc,
                description: describe(*nrc),
            },
            [intro] if *intro == negative_introducer => {
                warn!("Discarding truncated negative response {bytes:02X?}");
                ServiceResponse::NoResponse
            }
            [intro, _] if *intro == negative_introducer => {
                warn!("Discarding truncated negative response {bytes:02X?}");
                ServiceResponse::NoResponse
            }
            [first, rest @ ..] => ServiceResponse::Positive {
                sid: first.wrapping_sub(0x40),
                data: rest.to_vec(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn describe(nrc: u8) -> String {
        format!("NRC 0x{nrc:02X}")
    }

    #[test]
    fn parse_positive() {
        let r = ServiceResponse::parse(&[0x63, 0x22, 0xDE, 0xAD], 0x7F, describe);
        assert_eq!(
            r,
            ServiceResponse::Positive {
                sid: 0x23,
                data: vec![0x22, 0xDE, 0xAD]
            }
        );
    }

    #[test]
    fn parse_negative() {
        let r = ServiceResponse::parse(&[0x7F, 0x27, 0x33], 0x7F, describe);
        match r {
            ServiceResponse::Negative {
                sid,
                nrc,
                description,
            } => {
                assert_eq!(sid, 0x27);
                assert_eq!(nrc, 0x33);
                assert!(!description.is_empty());
            }
            other => panic!("expected negative response, got {other:?}"),
        }
    }

    #[test]
    fn parse_kwp_negative_introducer() {
        let r = ServiceResponse::parse(&[0xBF, 0xA3, 0x33], 0xBF, describe);
        assert!(matches!(
            r,
            ServiceResponse::Negative {
                sid: 0xA3,
                nrc: 0x33,
                ..
            }
        ));
        // 0xBF is a valid positive first byte under UDS framing
        let r = ServiceResponse::parse(&[0xBF, 0xA3, 0x33], 0x7F, describe);
        assert!(r.is_positive());
    }

    #[test]
    fn parse_empty_and_truncated() {
        assert_eq!(
            ServiceResponse::parse(&[], 0x7F, describe),
            ServiceResponse::NoResponse
        );
        assert_eq!(
            ServiceResponse::parse(&[0x7F, 0x27], 0x7F, describe),
            ServiceResponse::NoResponse
        );
    }
}
