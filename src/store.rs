//! The on-disk flow log.
//!
//! A log file is a 16-byte header followed by records. Every record is a
//! fixed 8-byte record header (field bitmask + tag) and then one body per
//! set field bit, in bit order, all integers network order. 64-bit counters
//! are written as two 32-bit halves, high word first, which is exactly a
//! big-endian `u64`.
//!
//! Writers serialize into one buffer and commit with a single `write_all`,
//! so a crash can leave at most one trailing partial record; readers treat
//! a partial tail as end of file.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::address::Xaddr;
use crate::flow::{FlowRecord, field};

/// First four bytes of every log file.
pub const MAGIC: u32 = 0x464C_4F57; // "FLOW"
/// On-disk format version. Bump on any layout change.
pub const FORMAT_VERSION: u32 = 1;
/// Magic + version + reserved padding.
pub const HEADER_LEN: usize = 16;

const RECORD_HEADER_LEN: usize = 8;

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    /// Existing log file is shorter than a header.
    ShortHeader(u64),
    BadMagic(u32),
    BadVersion(u32),
    /// A record's field bit is set but the record carries no value for it.
    FieldMissing(&'static str),
    /// An address field bit disagrees with the address family present.
    FamilyMismatch(&'static str),
    /// A record header declares field bits this format version does not
    /// define, so its length cannot be known.
    UnknownFields(u32),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "log I/O error: {}", e),
            StoreError::ShortHeader(len) => {
                write!(f, "log file too short for a header ({} bytes)", len)
            }
            StoreError::BadMagic(m) => {
                write!(f, "bad log magic {:#010x} (expected {:#010x})", m, MAGIC)
            }
            StoreError::BadVersion(v) => write!(
                f,
                "unsupported log format version {} (expected {})",
                v, FORMAT_VERSION
            ),
            StoreError::FieldMissing(name) => {
                write!(f, "field {} flagged present but missing", name)
            }
            StoreError::FamilyMismatch(name) => {
                write!(f, "field {} has the wrong address family", name)
            }
            StoreError::UnknownFields(bits) => {
                write!(f, "record declares unknown field bits {:#010x}", bits)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Write the log header. Callers must ensure the file is empty and
/// positioned at the start; the header is written exactly once per file.
pub fn put_header<W: Write>(w: &mut W) -> Result<(), StoreError> {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    // Remaining eight bytes reserved, zero.
    w.write_all(&buf)?;
    Ok(())
}

/// Validate the header of a non-empty log file.
pub fn check_header<R: Read>(r: &mut R) -> Result<(), StoreError> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf)?;
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(StoreError::BadMagic(magic));
    }
    let version = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(StoreError::BadVersion(version));
    }
    Ok(())
}

/// Prepare an open log file for appending.
///
/// An empty file gets a fresh header; an existing file has its header
/// validated and is never rewritten. Either way the position ends up at the
/// end of the file.
pub fn open_log(file: &mut File) -> Result<(), StoreError> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        put_header(file)?;
        return Ok(());
    }
    if len < HEADER_LEN as u64 {
        return Err(StoreError::ShortHeader(len));
    }
    file.seek(SeekFrom::Start(0))?;
    check_header(file)?;
    file.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Body length implied by a field mask, excluding the record header.
fn body_len(fields: u32) -> Result<usize, StoreError> {
    if fields & !field::ALL != 0 {
        return Err(StoreError::UnknownFields(fields & !field::ALL));
    }
    let mut len = 0;
    // TAG's value lives in the record header.
    if fields & field::RECV_TIME != 0 {
        len += 4;
    }
    if fields & field::PROTO_FLAGS_TOS != 0 {
        len += 4;
    }
    for bit in [
        field::AGENT_ADDR4,
        field::SRC_ADDR4,
        field::DST_ADDR4,
        field::GATEWAY_ADDR4,
    ] {
        if fields & bit != 0 {
            len += 4;
        }
    }
    for bit in [
        field::AGENT_ADDR6,
        field::SRC_ADDR6,
        field::DST_ADDR6,
        field::GATEWAY_ADDR6,
    ] {
        if fields & bit != 0 {
            len += 16;
        }
    }
    if fields & field::SRC_DST_PORT != 0 {
        len += 4;
    }
    if fields & field::PACKETS != 0 {
        len += 8;
    }
    if fields & field::OCTETS != 0 {
        len += 8;
    }
    if fields & field::IF_INDICES != 0 {
        len += 4;
    }
    if fields & field::AGENT_INFO != 0 {
        len += 16;
    }
    if fields & field::FLOW_TIMES != 0 {
        len += 8;
    }
    if fields & field::AS_INFO != 0 {
        len += 8;
    }
    if fields & field::FLOW_ENGINE_INFO != 0 {
        len += 8;
    }
    Ok(len)
}

fn put_addr4(
    buf: &mut Vec<u8>,
    addr: &Option<Xaddr>,
    name: &'static str,
) -> Result<(), StoreError> {
    match addr {
        Some(Xaddr::V4(a)) => {
            buf.extend_from_slice(&a.octets());
            Ok(())
        }
        Some(_) => Err(StoreError::FamilyMismatch(name)),
        None => Err(StoreError::FieldMissing(name)),
    }
}

fn put_addr6(
    buf: &mut Vec<u8>,
    addr: &Option<Xaddr>,
    name: &'static str,
) -> Result<(), StoreError> {
    match addr {
        Some(Xaddr::V6 { addr, .. }) => {
            buf.extend_from_slice(&addr.octets());
            Ok(())
        }
        Some(_) => Err(StoreError::FamilyMismatch(name)),
        None => Err(StoreError::FieldMissing(name)),
    }
}

/// Serialize one record, keeping only the fields in `mask`.
pub fn serialize_flow(flow: &FlowRecord, mask: u32) -> Result<Vec<u8>, StoreError> {
    let fields = flow.fields & mask;
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + body_len(fields)?);

    buf.extend_from_slice(&fields.to_be_bytes());
    buf.extend_from_slice(&flow.tag.to_be_bytes());

    if fields & field::RECV_TIME != 0 {
        buf.extend_from_slice(&flow.recv_secs.to_be_bytes());
    }
    if fields & field::PROTO_FLAGS_TOS != 0 {
        buf.push(flow.tcp_flags);
        buf.push(flow.protocol);
        buf.push(flow.tos);
        buf.push(0);
    }
    if fields & field::AGENT_ADDR4 != 0 {
        put_addr4(&mut buf, &flow.agent_addr, "agent_addr4")?;
    }
    if fields & field::AGENT_ADDR6 != 0 {
        put_addr6(&mut buf, &flow.agent_addr, "agent_addr6")?;
    }
    if fields & field::SRC_ADDR4 != 0 {
        put_addr4(&mut buf, &flow.src_addr, "src_addr4")?;
    }
    if fields & field::SRC_ADDR6 != 0 {
        put_addr6(&mut buf, &flow.src_addr, "src_addr6")?;
    }
    if fields & field::DST_ADDR4 != 0 {
        put_addr4(&mut buf, &flow.dst_addr, "dst_addr4")?;
    }
    if fields & field::DST_ADDR6 != 0 {
        put_addr6(&mut buf, &flow.dst_addr, "dst_addr6")?;
    }
    if fields & field::GATEWAY_ADDR4 != 0 {
        put_addr4(&mut buf, &flow.gateway_addr, "gateway_addr4")?;
    }
    if fields & field::GATEWAY_ADDR6 != 0 {
        put_addr6(&mut buf, &flow.gateway_addr, "gateway_addr6")?;
    }
    if fields & field::SRC_DST_PORT != 0 {
        buf.extend_from_slice(&flow.src_port.to_be_bytes());
        buf.extend_from_slice(&flow.dst_port.to_be_bytes());
    }
    if fields & field::PACKETS != 0 {
        buf.extend_from_slice(&flow.packets.to_be_bytes());
    }
    if fields & field::OCTETS != 0 {
        buf.extend_from_slice(&flow.octets.to_be_bytes());
    }
    if fields & field::IF_INDICES != 0 {
        buf.extend_from_slice(&flow.if_index_in.to_be_bytes());
        buf.extend_from_slice(&flow.if_index_out.to_be_bytes());
    }
    if fields & field::AGENT_INFO != 0 {
        buf.extend_from_slice(&flow.sys_uptime_ms.to_be_bytes());
        buf.extend_from_slice(&flow.time_sec.to_be_bytes());
        buf.extend_from_slice(&flow.time_nanosec.to_be_bytes());
        buf.extend_from_slice(&flow.netflow_version.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
    }
    if fields & field::FLOW_TIMES != 0 {
        buf.extend_from_slice(&flow.flow_start.to_be_bytes());
        buf.extend_from_slice(&flow.flow_finish.to_be_bytes());
    }
    if fields & field::AS_INFO != 0 {
        buf.extend_from_slice(&flow.src_as.to_be_bytes());
        buf.extend_from_slice(&flow.dst_as.to_be_bytes());
        buf.push(flow.src_mask);
        buf.push(flow.dst_mask);
        buf.extend_from_slice(&0u16.to_be_bytes());
    }
    if fields & field::FLOW_ENGINE_INFO != 0 {
        buf.push(flow.engine_type);
        buf.push(flow.engine_id);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&flow.flow_sequence.to_be_bytes());
    }

    Ok(buf)
}

/// Append one record with a single write.
pub fn put_flow<W: Write>(w: &mut W, flow: &FlowRecord, mask: u32) -> Result<(), StoreError> {
    let buf = serialize_flow(flow, mask)?;
    w.write_all(&buf)?;
    Ok(())
}

enum Fill {
    Full,
    Eof,
    Partial,
}

/// Fill `buf` completely, distinguishing clean EOF (no bytes at all) from a
/// truncated tail.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<Fill> {
    let mut off = 0;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => {
                return Ok(if off == 0 { Fill::Eof } else { Fill::Partial });
            }
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Fill::Full)
}

fn be_u16(buf: &[u8], off: &mut usize) -> u16 {
    let v = u16::from_be_bytes(buf[*off..*off + 2].try_into().unwrap());
    *off += 2;
    v
}

fn be_u32(buf: &[u8], off: &mut usize) -> u32 {
    let v = u32::from_be_bytes(buf[*off..*off + 4].try_into().unwrap());
    *off += 4;
    v
}

fn be_u64(buf: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_be_bytes(buf[*off..*off + 8].try_into().unwrap());
    *off += 8;
    v
}

fn take_u8(buf: &[u8], off: &mut usize) -> u8 {
    let v = buf[*off];
    *off += 1;
    v
}

fn take_addr4(buf: &[u8], off: &mut usize) -> Xaddr {
    let octets: [u8; 4] = buf[*off..*off + 4].try_into().unwrap();
    *off += 4;
    Xaddr::V4(Ipv4Addr::from(octets))
}

fn take_addr6(buf: &[u8], off: &mut usize) -> Xaddr {
    let octets: [u8; 16] = buf[*off..*off + 16].try_into().unwrap();
    *off += 16;
    Xaddr::V6 {
        addr: Ipv6Addr::from(octets),
        scope_id: 0,
    }
}

/// Read the next record, or `None` at end of log. A truncated trailing
/// record also reads as `None`.
pub fn read_flow<R: Read>(r: &mut R) -> Result<Option<FlowRecord>, StoreError> {
    let mut hdr = [0u8; RECORD_HEADER_LEN];
    match read_full(r, &mut hdr)? {
        Fill::Full => {}
        Fill::Eof | Fill::Partial => return Ok(None),
    }
    let fields = u32::from_be_bytes(hdr[0..4].try_into().unwrap());
    let tag = u32::from_be_bytes(hdr[4..8].try_into().unwrap());

    let mut body = vec![0u8; body_len(fields)?];
    match read_full(r, &mut body)? {
        Fill::Full => {}
        Fill::Eof | Fill::Partial => return Ok(None),
    }

    let mut flow = FlowRecord {
        fields,
        tag,
        ..Default::default()
    };
    let mut off = 0;
    let buf = body.as_slice();

    if fields & field::RECV_TIME != 0 {
        flow.recv_secs = be_u32(buf, &mut off);
    }
    if fields & field::PROTO_FLAGS_TOS != 0 {
        flow.tcp_flags = take_u8(buf, &mut off);
        flow.protocol = take_u8(buf, &mut off);
        flow.tos = take_u8(buf, &mut off);
        off += 1; // pad
    }
    if fields & field::AGENT_ADDR4 != 0 {
        flow.agent_addr = Some(take_addr4(buf, &mut off));
    }
    if fields & field::AGENT_ADDR6 != 0 {
        flow.agent_addr = Some(take_addr6(buf, &mut off));
    }
    if fields & field::SRC_ADDR4 != 0 {
        flow.src_addr = Some(take_addr4(buf, &mut off));
    }
    if fields & field::SRC_ADDR6 != 0 {
        flow.src_addr = Some(take_addr6(buf, &mut off));
    }
    if fields & field::DST_ADDR4 != 0 {
        flow.dst_addr = Some(take_addr4(buf, &mut off));
    }
    if fields & field::DST_ADDR6 != 0 {
        flow.dst_addr = Some(take_addr6(buf, &mut off));
    }
    if fields & field::GATEWAY_ADDR4 != 0 {
        flow.gateway_addr = Some(take_addr4(buf, &mut off));
    }
    if fields & field::GATEWAY_ADDR6 != 0 {
        flow.gateway_addr = Some(take_addr6(buf, &mut off));
    }
    if fields & field::SRC_DST_PORT != 0 {
        flow.src_port = be_u16(buf, &mut off);
        flow.dst_port = be_u16(buf, &mut off);
    }
    if fields & field::PACKETS != 0 {
        flow.packets = be_u64(buf, &mut off);
    }
    if fields & field::OCTETS != 0 {
        flow.octets = be_u64(buf, &mut off);
    }
    if fields & field::IF_INDICES != 0 {
        flow.if_index_in = be_u16(buf, &mut off);
        flow.if_index_out = be_u16(buf, &mut off);
    }
    if fields & field::AGENT_INFO != 0 {
        flow.sys_uptime_ms = be_u32(buf, &mut off);
        flow.time_sec = be_u32(buf, &mut off);
        flow.time_nanosec = be_u32(buf, &mut off);
        flow.netflow_version = be_u16(buf, &mut off);
        off += 2; // pad
    }
    if fields & field::FLOW_TIMES != 0 {
        flow.flow_start = be_u32(buf, &mut off);
        flow.flow_finish = be_u32(buf, &mut off);
    }
    if fields & field::AS_INFO != 0 {
        flow.src_as = be_u16(buf, &mut off);
        flow.dst_as = be_u16(buf, &mut off);
        flow.src_mask = take_u8(buf, &mut off);
        flow.dst_mask = take_u8(buf, &mut off);
        off += 2; // pad
    }
    if fields & field::FLOW_ENGINE_INFO != 0 {
        flow.engine_type = take_u8(buf, &mut off);
        flow.engine_id = take_u8(buf, &mut off);
        off += 2; // pad
        flow.flow_sequence = be_u32(buf, &mut off);
    }
    debug_assert_eq!(off, buf.len());

    Ok(Some(flow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_flow() -> FlowRecord {
        let mut flow = FlowRecord {
            recv_secs: 1_700_000_000,
            tcp_flags: 0x12,
            protocol: 6,
            tos: 0x10,
            agent_addr: Some(Xaddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            src_addr: Some(Xaddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            dst_addr: Some(Xaddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
            gateway_addr: Some(Xaddr::V4(Ipv4Addr::new(10, 0, 0, 254))),
            src_port: 1234,
            dst_port: 80,
            packets: 5,
            octets: 1_000,
            if_index_in: 1,
            if_index_out: 2,
            sys_uptime_ms: 100_000,
            time_sec: 1_700_000_000,
            time_nanosec: 250,
            netflow_version: 5,
            flow_start: 90_000,
            flow_finish: 99_000,
            src_as: 64500,
            dst_as: 64501,
            src_mask: 24,
            dst_mask: 16,
            engine_type: 1,
            engine_id: 2,
            flow_sequence: 777,
            ..Default::default()
        };
        flow.fields = field::ALL & !field::TAG & !field::SRC_ADDR6 & !field::DST_ADDR6
            & !field::AGENT_ADDR6
            & !field::GATEWAY_ADDR6;
        flow
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        put_header(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        check_header(&mut Cursor::new(&buf)).unwrap();
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        put_header(&mut buf).unwrap();
        buf[0] ^= 0xff;
        match check_header(&mut Cursor::new(&buf)) {
            Err(StoreError::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut buf = Vec::new();
        put_header(&mut buf).unwrap();
        buf[7] = 0xfe;
        match check_header(&mut Cursor::new(&buf)) {
            Err(StoreError::BadVersion(_)) => {}
            other => panic!("expected BadVersion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn flow_round_trip() {
        let flow = sample_flow();
        let mut buf = Vec::new();
        put_flow(&mut buf, &flow, field::ALL).unwrap();

        let got = read_flow(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(got.fields, flow.fields);
        assert_eq!(got.src_addr, flow.src_addr);
        assert_eq!(got.dst_addr, flow.dst_addr);
        assert_eq!(got.gateway_addr, flow.gateway_addr);
        assert_eq!(got.src_port, flow.src_port);
        assert_eq!(got.dst_port, flow.dst_port);
        assert_eq!(got.packets, flow.packets);
        assert_eq!(got.octets, flow.octets);
        assert_eq!(got.netflow_version, 5);
        assert_eq!(got.flow_sequence, 777);
        assert_eq!(got.src_as, 64500);
    }

    #[test]
    fn counters_are_big_endian_u64() {
        let mut flow = FlowRecord::default();
        flow.fields = field::OCTETS;
        flow.octets = 0x0000_0001_0000_0002;
        let buf = serialize_flow(&flow, field::ALL).unwrap();
        // Record header then the two 32-bit halves, high word first.
        assert_eq!(&buf[8..12], &[0, 0, 0, 1]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 2]);
    }

    #[test]
    fn store_mask_drops_fields() {
        let flow = sample_flow();
        let mask = field::SRC_ADDR4 | field::DST_ADDR4 | field::OCTETS;
        let mut buf = Vec::new();
        put_flow(&mut buf, &flow, mask).unwrap();

        let got = read_flow(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(got.fields, flow.fields & mask);
        assert!(got.src_addr.is_some());
        assert!(got.agent_addr.is_none());
        assert_eq!(got.packets, 0);
        assert_eq!(got.octets, 1_000);
    }

    #[test]
    fn missing_value_for_set_bit_errors() {
        let mut flow = FlowRecord::default();
        flow.fields = field::SRC_ADDR4;
        match serialize_flow(&flow, field::ALL) {
            Err(StoreError::FieldMissing("src_addr4")) => {}
            other => panic!("expected FieldMissing, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn truncated_tail_reads_as_eof() {
        let flow = sample_flow();
        let mut buf = Vec::new();
        put_flow(&mut buf, &flow, field::ALL).unwrap();
        put_flow(&mut buf, &flow, field::ALL).unwrap();
        buf.truncate(buf.len() - 5);

        let mut cur = Cursor::new(&buf);
        assert!(read_flow(&mut cur).unwrap().is_some());
        assert!(read_flow(&mut cur).unwrap().is_none());
    }

    #[test]
    fn open_log_writes_header_once() {
        let mut file = tempfile::tempfile().unwrap();
        open_log(&mut file).unwrap();
        let first_len = file.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(first_len, HEADER_LEN as u64);

        // Second open of the same (now non-empty) log validates instead of
        // rewriting.
        open_log(&mut file).unwrap();
        assert_eq!(file.seek(SeekFrom::End(0)).unwrap(), HEADER_LEN as u64);
    }

    #[test]
    fn open_log_rejects_foreign_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"this is not a flow log, honest").unwrap();
        match open_log(&mut file) {
            Err(StoreError::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }
}
