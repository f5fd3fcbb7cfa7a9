//! The canonical flow record.
//!
//! Every NetFlow version decodes into this one structure: a bitmask naming
//! the substructures that carry data, plus the substructure values
//! themselves. The bitmask doubles as the on-disk layout: bit order is
//! serialization order (see [`crate::store`]).

use std::fmt;

use serde::Serialize;

use crate::address::Xaddr;

/// Field-presence bits for [`FlowRecord::fields`].
///
/// Bit order is the canonical serialization order. New fields must be added
/// at the end; reordering is a log-format break.
pub mod field {
    pub const TAG: u32 = 1 << 0;
    pub const RECV_TIME: u32 = 1 << 1;
    pub const PROTO_FLAGS_TOS: u32 = 1 << 2;
    pub const AGENT_ADDR4: u32 = 1 << 3;
    pub const AGENT_ADDR6: u32 = 1 << 4;
    pub const SRC_ADDR4: u32 = 1 << 5;
    pub const SRC_ADDR6: u32 = 1 << 6;
    pub const DST_ADDR4: u32 = 1 << 7;
    pub const DST_ADDR6: u32 = 1 << 8;
    pub const GATEWAY_ADDR4: u32 = 1 << 9;
    pub const GATEWAY_ADDR6: u32 = 1 << 10;
    pub const SRC_DST_PORT: u32 = 1 << 11;
    pub const PACKETS: u32 = 1 << 12;
    pub const OCTETS: u32 = 1 << 13;
    pub const IF_INDICES: u32 = 1 << 14;
    pub const AGENT_INFO: u32 = 1 << 15;
    pub const FLOW_TIMES: u32 = 1 << 16;
    pub const AS_INFO: u32 = 1 << 17;
    pub const FLOW_ENGINE_INFO: u32 = 1 << 18;

    /// Every defined field bit.
    pub const ALL: u32 = (1 << 19) - 1;

    /// Combined convenience masks.
    pub const AGENT_ADDR: u32 = AGENT_ADDR4 | AGENT_ADDR6;
    pub const SRC_ADDR: u32 = SRC_ADDR4 | SRC_ADDR6;
    pub const DST_ADDR: u32 = DST_ADDR4 | DST_ADDR6;
    pub const GATEWAY_ADDR: u32 = GATEWAY_ADDR4 | GATEWAY_ADDR6;

    /// Display name for a single field bit, used by config parsing and the
    /// info dump.
    pub fn name(bit: u32) -> Option<&'static str> {
        Some(match bit {
            TAG => "tag",
            RECV_TIME => "recv_time",
            PROTO_FLAGS_TOS => "proto_flags_tos",
            AGENT_ADDR4 => "agent_addr4",
            AGENT_ADDR6 => "agent_addr6",
            SRC_ADDR4 => "src_addr4",
            SRC_ADDR6 => "src_addr6",
            DST_ADDR4 => "dst_addr4",
            DST_ADDR6 => "dst_addr6",
            GATEWAY_ADDR4 => "gateway_addr4",
            GATEWAY_ADDR6 => "gateway_addr6",
            SRC_DST_PORT => "src_dst_port",
            PACKETS => "packets",
            OCTETS => "octets",
            IF_INDICES => "if_indices",
            AGENT_INFO => "agent_info",
            FLOW_TIMES => "flow_times",
            AS_INFO => "as_info",
            FLOW_ENGINE_INFO => "flow_engine_info",
            _ => return None,
        })
    }

    /// Reverse of [`name`]; `"agent_addr"` style combined names resolve to
    /// both family bits.
    pub fn from_name(name: &str) -> Option<u32> {
        Some(match name {
            "tag" => TAG,
            "recv_time" => RECV_TIME,
            "proto_flags_tos" => PROTO_FLAGS_TOS,
            "agent_addr" => AGENT_ADDR,
            "agent_addr4" => AGENT_ADDR4,
            "agent_addr6" => AGENT_ADDR6,
            "src_addr" => SRC_ADDR,
            "src_addr4" => SRC_ADDR4,
            "src_addr6" => SRC_ADDR6,
            "dst_addr" => DST_ADDR,
            "dst_addr4" => DST_ADDR4,
            "dst_addr6" => DST_ADDR6,
            "gateway_addr" => GATEWAY_ADDR,
            "gateway_addr4" => GATEWAY_ADDR4,
            "gateway_addr6" => GATEWAY_ADDR6,
            "src_dst_port" => SRC_DST_PORT,
            "packets" => PACKETS,
            "octets" => OCTETS,
            "if_indices" => IF_INDICES,
            "agent_info" => AGENT_INFO,
            "flow_times" => FLOW_TIMES,
            "as_info" => AS_INFO,
            "flow_engine_info" => FLOW_ENGINE_INFO,
            "all" => ALL,
            _ => return None,
        })
    }
}

/// One decoded flow, ready for filtering and storage.
///
/// A zeroed record with an empty `fields` mask is the starting point for
/// every decoder; the decoder fills in what its NetFlow version supplies and
/// sets the matching bits. Consumers must not read a value whose bit is
/// clear.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowRecord {
    /// Bitmask of present substructures ([`field`] constants).
    pub fields: u32,
    /// Filter-assigned tag; meaningful only when [`field::TAG`] is set.
    pub tag: u32,

    /// Collector wall-clock seconds when the datagram was decoded.
    pub recv_secs: u32,

    pub tcp_flags: u8,
    pub protocol: u8,
    pub tos: u8,

    /// Exporter that sent the datagram.
    pub agent_addr: Option<Xaddr>,
    pub src_addr: Option<Xaddr>,
    pub dst_addr: Option<Xaddr>,
    /// Next-hop router.
    pub gateway_addr: Option<Xaddr>,

    pub src_port: u16,
    pub dst_port: u16,

    pub packets: u64,
    pub octets: u64,

    pub if_index_in: u16,
    pub if_index_out: u16,

    /// Exporter uptime in milliseconds at export.
    pub sys_uptime_ms: u32,
    /// Exporter wall clock at export.
    pub time_sec: u32,
    pub time_nanosec: u32,
    /// NetFlow version the record arrived in.
    pub netflow_version: u16,

    /// Flow start/finish, milliseconds of exporter uptime.
    pub flow_start: u32,
    pub flow_finish: u32,

    pub src_as: u16,
    pub dst_as: u16,
    pub src_mask: u8,
    pub dst_mask: u8,

    pub engine_type: u8,
    pub engine_id: u8,
    pub flow_sequence: u32,
}

impl FlowRecord {
    pub fn has(&self, bits: u32) -> bool {
        self.fields & bits == bits
    }

    /// Assign a filter tag.
    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
        self.fields |= field::TAG;
    }
}

struct MaybeAddr<'a>(&'a Option<Xaddr>);

impl fmt::Display for MaybeAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(a) => write!(f, "{}", a),
            None => f.write_str("?"),
        }
    }
}

/// Brief one-line rendering for verbose logging and the info dump.
impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proto {} {}:{} -> {}:{}",
            self.protocol,
            MaybeAddr(&self.src_addr),
            self.src_port,
            MaybeAddr(&self.dst_addr),
            self.dst_port,
        )?;
        if self.has(field::OCTETS) {
            write!(f, " {} octets", self.octets)?;
        }
        if self.has(field::PACKETS) {
            write!(f, " {} packets", self.packets)?;
        }
        if self.has(field::AGENT_ADDR4) || self.has(field::AGENT_ADDR6) {
            write!(f, " agent {}", MaybeAddr(&self.agent_addr))?;
        }
        if self.has(field::TAG) {
            write!(f, " tag {}", self.tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn field_names_round_trip() {
        for shift in 0..19 {
            let bit = 1u32 << shift;
            let name = field::name(bit).expect("every defined bit has a name");
            assert_eq!(field::from_name(name), Some(bit));
        }
        assert_eq!(field::name(1 << 19), None);
        assert_eq!(field::from_name("src_addr"), Some(field::SRC_ADDR));
    }

    #[test]
    fn set_tag_flags_the_field() {
        let mut flow = FlowRecord::default();
        assert!(!flow.has(field::TAG));
        flow.set_tag(42);
        assert!(flow.has(field::TAG));
        assert_eq!(flow.tag, 42);
    }

    #[test]
    fn brief_display_mentions_endpoints() {
        let mut flow = FlowRecord {
            protocol: 6,
            src_addr: Some(Xaddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            dst_addr: Some(Xaddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
            src_port: 1234,
            dst_port: 80,
            octets: 100,
            ..Default::default()
        };
        flow.fields = field::SRC_ADDR4 | field::DST_ADDR4 | field::SRC_DST_PORT | field::OCTETS;
        let s = format!("{}", flow);
        assert!(s.contains("10.0.0.1:1234 -> 10.0.0.2:80"));
        assert!(s.contains("100 octets"));
    }
}
