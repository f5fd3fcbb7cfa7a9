//! Datagram validation and version dispatch.
//!
//! Every NetFlow datagram starts with a two-byte version and a two-byte
//! flow count; the version selects the decoder. Unsupported versions are a
//! distinct error so the caller can log them without charging the peer an
//! invalid packet.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::address::Xaddr;
use crate::flow::FlowRecord;
use crate::static_versions::{v1, v5, v7};

/// Version and flow count shared by every fixed-layout NetFlow header.
pub const COMMON_HEADER_LEN: usize = 4;

/// NetFlow versions this collector knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetflowVersion {
    V1,
    V5,
    V7,
    Unsupported(u16),
}

impl From<u16> for NetflowVersion {
    fn from(version: u16) -> Self {
        match version {
            1 => NetflowVersion::V1,
            5 => NetflowVersion::V5,
            7 => NetflowVersion::V7,
            v => NetflowVersion::Unsupported(v),
        }
    }
}

/// Why a datagram was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the version's fixed header. Version 0 means the
    /// datagram did not even cover the common header.
    ShortPacket { version: u16, len: usize },
    /// Declared flow count of zero or beyond the version maximum.
    BadFlowCount { version: u16, count: u16 },
    /// Datagram length disagrees with the declared flow count, in either
    /// direction.
    LengthMismatch {
        version: u16,
        len: usize,
        expected: usize,
    },
    /// Fixed-layout parse failed after the length checks passed.
    Malformed { version: u16 },
    /// Version this collector does not decode (v9/IPFIX included).
    UnsupportedVersion { version: u16 },
}

impl DecodeError {
    /// Whether the rejection counts against the peer's `ninvalid`.
    /// Unknown versions are logged but not charged.
    pub fn is_invalid(&self) -> bool {
        !matches!(self, DecodeError::UnsupportedVersion { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::ShortPacket { version: 0, len } => {
                write!(f, "short NetFlow packet, {} bytes", len)
            }
            DecodeError::ShortPacket { version, len } => {
                write!(f, "short NetFlow v.{} packet, {} bytes", version, len)
            }
            DecodeError::BadFlowCount { version, count } => write!(
                f,
                "invalid number of flows ({}) in NetFlow v.{} packet",
                count, version
            ),
            DecodeError::LengthMismatch {
                version,
                len,
                expected,
            } => write!(
                f,
                "inconsistent NetFlow v.{} packet: len {} expected {}",
                version, len, expected
            ),
            DecodeError::Malformed { version } => {
                write!(f, "malformed NetFlow v.{} packet", version)
            }
            DecodeError::UnsupportedVersion { version } => {
                write!(f, "unsupported NetFlow version {}", version)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// One validated datagram's worth of canonical records.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// Wire version of the datagram.
    pub version: u16,
    /// Declared (and verified) flow count.
    pub count: u16,
    /// Records in datagram order.
    pub flows: Vec<FlowRecord>,
}

/// Validate and decode one datagram from `flow_source`.
///
/// `recv_time` becomes the canonical receive timestamp of every record.
pub fn decode_datagram(
    pkt: &[u8],
    flow_source: &Xaddr,
    recv_time: SystemTime,
) -> Result<Decoded, DecodeError> {
    if pkt.len() < COMMON_HEADER_LEN {
        return Err(DecodeError::ShortPacket {
            version: 0,
            len: pkt.len(),
        });
    }
    let version = u16::from_be_bytes(pkt[0..2].try_into().unwrap());
    let recv_secs = recv_time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;

    let flows = match NetflowVersion::from(version) {
        NetflowVersion::V1 => v1::decode(pkt, flow_source, recv_secs)?,
        NetflowVersion::V5 => v5::decode(pkt, flow_source, recv_secs)?,
        NetflowVersion::V7 => v7::decode(pkt, flow_source, recv_secs)?,
        NetflowVersion::Unsupported(v) => {
            return Err(DecodeError::UnsupportedVersion { version: v });
        }
    };

    Ok(Decoded {
        version,
        count: flows.len() as u16,
        flows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Xaddr {
        Xaddr::V4("198.51.100.4".parse().unwrap())
    }

    #[test]
    fn version_mapping() {
        assert_eq!(NetflowVersion::from(1), NetflowVersion::V1);
        assert_eq!(NetflowVersion::from(5), NetflowVersion::V5);
        assert_eq!(NetflowVersion::from(7), NetflowVersion::V7);
        assert_eq!(NetflowVersion::from(9), NetflowVersion::Unsupported(9));
        assert_eq!(NetflowVersion::from(10), NetflowVersion::Unsupported(10));
    }

    #[test]
    fn below_common_header_is_short() {
        let err = decode_datagram(&[0, 5, 0], &source(), SystemTime::now()).unwrap_err();
        assert_eq!(err, DecodeError::ShortPacket { version: 0, len: 3 });
        assert!(err.is_invalid());
    }

    #[test]
    fn unknown_version_is_not_charged_invalid() {
        // A v9 header: version 9, count 1, then padding.
        let mut pkt = vec![0u8; 20];
        pkt[1] = 9;
        pkt[3] = 1;
        let err = decode_datagram(&pkt, &source(), SystemTime::now()).unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedVersion { version: 9 });
        assert!(!err.is_invalid());
    }
}
