//! # NetFlow V7
//!
//! Exported by Catalyst switches. The layout is v5 with a trailing
//! bypassed-router address per flow; AS and mask fields exist on the wire
//! but the engine identifiers live only in zeroed header padding.
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

/// Most flows one v7 datagram may declare.
pub const MAX_FLOWS: u16 = 30;

pub(crate) const HEADER_LEN: usize = 24;
pub(crate) const RECORD_LEN: usize = 52;

/// Exact datagram length for `count` flows.
pub(crate) fn packet_len(count: usize) -> usize {
    HEADER_LEN + count * RECORD_LEN
}

#[derive(Nom, Debug, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct Header {
    /// NetFlow export format version number
    pub version: u16,
    /// Number of flows exported in this flow frame
    pub count: u16,
    /// Current time in milliseconds since the export device booted
    pub sys_up_time: u32,
    /// Current count of seconds since 0000 UTC 1970
    pub unix_secs: u32,
    /// Residual nanoseconds since 0000 UTC 1970
    pub unix_nsecs: u32,
    /// Sequence counter of total flows seen
    pub flow_sequence: u32,
    /// Unused (zero) bytes
    pub reserved: u32,
}

#[derive(Nom, Debug, PartialEq, Eq, Clone, Serialize)]
pub struct FlowSet {
    /// Source IP address; zero for destination-only flows
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub src_addr: Ipv4Addr,
    /// Destination IP address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub dst_addr: Ipv4Addr,
    /// Next hop router; always set to zero
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub next_hop: Ipv4Addr,
    /// SNMP index of input interface; always set to zero
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
    /// TCP/UDP source port number
    pub src_port: u16,
    /// TCP/UDP destination port number
    pub dst_port: u16,
    /// Flags indicating which flow fields are invalid
    pub flags_fields_valid: u8,
    /// Cumulative OR of TCP flags
    pub tcp_flags: u8,
    /// IP protocol type
    pub protocol: u8,
    /// IP type of service (ToS)
    pub tos: u8,
    /// Source autonomous system number; always set to zero
    pub src_as: u16,
    /// Destination autonomous system number; always set to zero
    pub dst_as: u16,
    /// Source address prefix mask; always set to zero
    pub src_mask: u8,
    /// Destination address prefix mask; always set to zero
    pub dst_mask: u8,
    /// Flags indicating which flows are invalid
    pub flags_fields_invalid: u16,
    /// IP address of the router bypassed by the switch
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub router_src: Ipv4Addr,
}

/// Validate a v7 datagram and canonicalize every flow in it.
pub fn decode(
    pkt: &[u8],
    flow_source: &Xaddr,
    recv_secs: u32,
) -> Result<Vec<FlowRecord>, DecodeError> {
    if pkt.len() < HEADER_LEN {
        return Err(DecodeError::ShortPacket {
            version: 7,
            len: pkt.len(),
        });
    }
    let (rest, header) = Header::parse(pkt).map_err(|_| DecodeError::Malformed { version: 7 })?;
    if header.count == 0 || header.count > MAX_FLOWS {
        return Err(DecodeError::BadFlowCount {
            version: 7,
            count: header.count,
        });
    }
    let expected = packet_len(header.count as usize);
    if pkt.len() != expected {
        return Err(DecodeError::LengthMismatch {
            version: 7,
            len: pkt.len(),
            expected,
        });
    }
    let (_, sets) = nom::multi::count(FlowSet::parse, header.count as usize)(rest)
        .map_err(|_| DecodeError::Malformed { version: 7 })?;

    // TODO: the flags_fields_valid/flags_fields_invalid bits can tell us
    // which per-flow fields the Cat5k left unset (destination-only NDE
    // mode); use them to clear the matching field bits.

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

        // v7 has no engine identifiers; only the sequence is meaningful.
        flow.flow_sequence = header.flow_sequence;

        flows.push(flow);
    }
    Ok(flows)
}
