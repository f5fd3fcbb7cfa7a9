//! # NetFlow V5
//!
//! References:
//! - <https://www.cisco.com/en/US/technologies/tk648/tk362/technologies_white_paper09186a00800a3db9.html>

use nom::number::complete::be_u32;
use nom_derive::*;
use serde::Serialize;

use std::net::Ipv4Addr;

use crate::address::Xaddr;
use crate::decode::DecodeError;
use crate::flow::{FlowRecord, field};

/// Most flows one v5 datagram may declare.
pub const MAX_FLOWS: u16 = 30;

pub(crate) const HEADER_LEN: usize = 24;
pub(crate) const RECORD_LEN: usize = 48;

/// Exact datagram length for `count` flows.
pub(crate) fn packet_len(count: usize) -> usize {
    HEADER_LEN + count * RECORD_LEN
}

#[derive(Nom, Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct Header {
    /// NetFlow export format version number
    pub version: u16,
    /// Number of flows exported in this packet (1-30)
    pub count: u16,
    /// Current time in milliseconds since the export device booted
    pub sys_up_time: u32,
    /// Current count of seconds since 0000 UTC 1970
    pub unix_secs: u32,
    /// Residual nanoseconds since 0000 UTC 1970
    pub unix_nsecs: u32,
    /// Sequence counter of total flows seen
    pub flow_sequence: u32,
    /// Type of flow-switching engine
    pub engine_type: u8,
    /// Slot number of the flow-switching engine
    pub engine_id: u8,
    /// First two bits hold the sampling mode; remaining 14 bits hold value of sampling interval
    pub sampling_interval: u16,
}

#[derive(Nom, Debug, PartialEq, Eq, Clone, Serialize)]
pub struct FlowSet {
    /// Source IP address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub src_addr: Ipv4Addr,
    /// Destination IP address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub dst_addr: Ipv4Addr,
    /// IP address of next hop router
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub next_hop: Ipv4Addr,
    /// SNMP index of input interface
    pub input: u16,
    /// SNMP index of output interface
    pub output: u16,
    /// Packets in the flow
    pub d_pkts: u32,
    /// Total number of Layer 3 bytes in the packets of the flow
    pub d_octets: u32,
    /// SysUptime at start of flow, milliseconds
    pub first: u32,
    /// SysUptime at the time the last packet of the flow was received
    pub last: u32,
    /// TCP/UDP source port number or equivalent
    pub src_port: u16,
    /// TCP/UDP destination port number or equivalent
    pub dst_port: u16,
    /// Unused (zero) bytes
    pub pad1: u8,
    /// Cumulative OR of TCP flags
    pub tcp_flags: u8,
    /// IP protocol type (for example, TCP = 6; UDP = 17)
    pub protocol: u8,
    /// IP type of service (ToS)
    pub tos: u8,
    /// Autonomous system number of the source, either origin or peer
    pub src_as: u16,
    /// Autonomous system number of the destination, either origin or peer
    pub dst_as: u16,
    /// Source address prefix mask bits
    pub src_mask: u8,
    /// Destination address prefix mask bits
    pub dst_mask: u8,
    /// Unused (zero) bytes
    pub pad2: u16,
}

/// Validate a v5 datagram and canonicalize every flow in it.
///
/// Rejection returns without emitting any record; partial acceptance would
/// desynchronize flow counts from the exporter's view.
pub fn decode(
    pkt: &[u8],
    flow_source: &Xaddr,
    recv_secs: u32,
) -> Result<Vec<FlowRecord>, DecodeError> {
    if pkt.len() < HEADER_LEN {
        return Err(DecodeError::ShortPacket {
            version: 5,
            len: pkt.len(),
        });
    }
    let (rest, header) = Header::parse(pkt).map_err(|_| DecodeError::Malformed { version: 5 })?;
    if header.count == 0 || header.count > MAX_FLOWS {
        return Err(DecodeError::BadFlowCount {
            version: 5,
            count: header.count,
        });
    }
    let expected = packet_len(header.count as usize);
    if pkt.len() != expected {
        return Err(DecodeError::LengthMismatch {
            version: 5,
            len: pkt.len(),
            expected,
        });
    }
    let (_, sets) = nom::multi::count(FlowSet::parse, header.count as usize)(rest)
        .map_err(|_| DecodeError::Malformed { version: 5 })?;

    let mut flows = Vec::with_capacity(sets.len());
    for set in &sets {
        let mut flow = FlowRecord::default();
        flow.fields = field::ALL
            & !field::TAG
            & !field::SRC_ADDR6
            & !field::DST_ADDR6
            & !field::GATEWAY_ADDR6;
        flow.fields &= match flow_source.is_v4() {
            true => !field::AGENT_ADDR6,
            false => !field::AGENT_ADDR4,
        };

        flow.recv_secs = recv_secs;

        flow.tcp_flags = set.tcp_flags;
        flow.protocol = set.protocol;
        flow.tos = set.tos;

        flow.agent_addr = Some(*flow_source);
        flow.src_addr = Some(Xaddr::V4(set.src_addr));
        flow.dst_addr = Some(Xaddr::V4(set.dst_addr));
        flow.gateway_addr = Some(Xaddr::V4(set.next_hop));

        flow.src_port = set.src_port;
        flow.dst_port = set.dst_port;

        // 32-bit wire counters widen to the canonical 64-bit form.
        flow.packets = u64::from(set.d_pkts);
        flow.octets = u64::from(set.d_octets);

        flow.if_index_in = set.input;
        flow.if_index_out = set.output;

        flow.sys_uptime_ms = header.sys_up_time;
        flow.time_sec = header.unix_secs;
        flow.time_nanosec = header.unix_nsecs;
        flow.netflow_version = header.version;

        flow.flow_start = set.first;
        flow.flow_finish = set.last;

        flow.src_as = set.src_as;
        flow.dst_as = set.dst_as;
        flow.src_mask = set.src_mask;
        flow.dst_mask = set.dst_mask;

        flow.engine_type = header.engine_type;
        flow.engine_id = header.engine_id;
        flow.flow_sequence = header.flow_sequence;

        flows.push(flow);
    }
    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(count: u16) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&5u16.to_be_bytes());
        pkt.extend_from_slice(&count.to_be_bytes());
        pkt.extend_from_slice(&100_000u32.to_be_bytes()); // sys_up_time
        pkt.extend_from_slice(&1_700_000_000u32.to_be_bytes()); // unix_secs
        pkt.extend_from_slice(&500u32.to_be_bytes()); // unix_nsecs
        pkt.extend_from_slice(&42u32.to_be_bytes()); // flow_sequence
        pkt.push(1); // engine_type
        pkt.push(2); // engine_id
        pkt.extend_from_slice(&0u16.to_be_bytes()); // sampling_interval
        for i in 0..count {
            pkt.extend_from_slice(&[10, 0, 0, 1]); // src
            pkt.extend_from_slice(&[10, 0, 0, 2]); // dst
            pkt.extend_from_slice(&[10, 0, 0, 254]); // next hop
            pkt.extend_from_slice(&1u16.to_be_bytes()); // input
            pkt.extend_from_slice(&2u16.to_be_bytes()); // output
            pkt.extend_from_slice(&3u32.to_be_bytes()); // d_pkts
            pkt.extend_from_slice(&400u32.to_be_bytes()); // d_octets
            pkt.extend_from_slice(&90_000u32.to_be_bytes()); // first
            pkt.extend_from_slice(&99_000u32.to_be_bytes()); // last
            pkt.extend_from_slice(&(1000 + i).to_be_bytes()); // src_port
            pkt.extend_from_slice(&80u16.to_be_bytes()); // dst_port
            pkt.push(0); // pad1
            pkt.push(0x12); // tcp_flags
            pkt.push(6); // protocol
            pkt.push(0); // tos
            pkt.extend_from_slice(&64500u16.to_be_bytes()); // src_as
            pkt.extend_from_slice(&64501u16.to_be_bytes()); // dst_as
            pkt.push(24); // src_mask
            pkt.push(16); // dst_mask
            pkt.extend_from_slice(&0u16.to_be_bytes()); // pad2
        }
        pkt
    }

    fn source() -> Xaddr {
        Xaddr::V4("192.0.2.9".parse().unwrap())
    }

    #[test]
    fn decodes_every_flow() {
        let pkt = sample_packet(3);
        assert_eq!(pkt.len(), packet_len(3));
        let flows = decode(&pkt, &source(), 1_700_000_100).unwrap();
        assert_eq!(flows.len(), 3);

        let flow = &flows[0];
        assert_eq!(flow.netflow_version, 5);
        assert_eq!(flow.protocol, 6);
        assert_eq!(flow.octets, 400);
        assert_eq!(flow.packets, 3);
        assert_eq!(flow.src_port, 1000);
        assert_eq!(flows[2].src_port, 1002);
        assert_eq!(flow.agent_addr, Some(source()));
        assert_eq!(flow.src_as, 64500);
        assert_eq!(flow.engine_id, 2);
        assert_eq!(flow.flow_sequence, 42);
        assert_eq!(flow.recv_secs, 1_700_000_100);
    }

    #[test]
    fn field_mask_clears_v6_bits() {
        let pkt = sample_packet(1);
        let flows = decode(&pkt, &source(), 0).unwrap();
        let f = flows[0].fields;
        assert_eq!(f & field::SRC_ADDR6, 0);
        assert_eq!(f & field::DST_ADDR6, 0);
        assert_eq!(f & field::GATEWAY_ADDR6, 0);
        assert_eq!(f & field::AGENT_ADDR6, 0);
        assert_eq!(f & field::TAG, 0);
        assert_ne!(f & field::AS_INFO, 0);
        assert_ne!(f & field::FLOW_ENGINE_INFO, 0);
        assert_ne!(f & field::AGENT_ADDR4, 0);
    }

    #[test]
    fn zero_count_is_rejected() {
        let pkt = sample_packet(0);
        match decode(&pkt, &source(), 0) {
            Err(DecodeError::BadFlowCount {
                version: 5,
                count: 0,
            }) => {}
            other => panic!("expected BadFlowCount, got {:?}", other),
        }
    }

    #[test]
    fn oversized_count_is_rejected() {
        let mut pkt = sample_packet(1);
        pkt[2..4].copy_from_slice(&31u16.to_be_bytes());
        match decode(&pkt, &source(), 0) {
            Err(DecodeError::BadFlowCount { count: 31, .. }) => {}
            other => panic!("expected BadFlowCount, got {:?}", other),
        }
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let mut pkt = sample_packet(30);
        pkt.truncate(packet_len(29));
        match decode(&pkt, &source(), 0) {
            Err(DecodeError::LengthMismatch { len, expected, .. }) => {
                assert_eq!(len, packet_len(29));
                assert_eq!(expected, packet_len(30));
            }
            other => panic!("expected LengthMismatch, got {:?}", other),
        }
    }

    #[test]
    fn overlong_packet_is_rejected() {
        let mut pkt = sample_packet(2);
        pkt.push(0);
        assert!(matches!(
            decode(&pkt, &source(), 0),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn short_header_is_rejected() {
        let pkt = sample_packet(1);
        assert!(matches!(
            decode(&pkt[..10], &source(), 0),
            Err(DecodeError::ShortPacket {
                version: 5,
                len: 10
            })
        ));
    }
}
