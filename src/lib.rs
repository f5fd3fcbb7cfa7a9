//! # flowlogd
//!
//! A NetFlow collector daemon. Exporters (routers, switches) send NetFlow
//! v1/v5/v7 datagrams over UDP; the collector validates and decodes them
//! into a canonical flow record, runs each record through an ordered filter
//! list, and appends the survivors to a self-describing binary log that
//! downstream tools read.
//!
//! The crate splits along the pipeline:
//!
//! - [`address`]: exporter endpoint addresses, the peer-table key
//! - [`peers`]: the bounded, LRU-evicting per-exporter state table
//! - [`static_versions`]: wire decoders for the fixed-layout versions
//! - [`decode`]: datagram validation and version dispatch
//! - [`flow`]: the canonical record and its field-presence mask
//! - [`store`]: the append-only log format
//! - [`filter`]: the rule evaluator
//! - [`config`]: the TOML configuration the monitor parses
//! - [`control`]: the channel to the privileged monitor
//! - [`daemon`]: the poll-based event loop tying it all together

pub mod address;
pub mod config;
#[cfg(unix)]
pub mod control;
#[cfg(unix)]
pub mod daemon;
pub mod decode;
pub mod filter;
pub mod flow;
pub mod peers;
pub mod static_versions;
pub mod store;

pub use address::{AddressFamily, Xaddr};
pub use decode::{DecodeError, Decoded, NetflowVersion, decode_datagram};
pub use filter::{FilterAction, FilterRule, evaluate};
pub use flow::{FlowRecord, field};
pub use peers::{PeerState, PeerTable};
