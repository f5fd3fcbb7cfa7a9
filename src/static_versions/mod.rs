//! Fixed-layout NetFlow versions.
//!
//! Versions 1, 5 and 7 carry a fixed header and an array of fixed-size
//! records, so validation can be exact: header length, flow count bounds,
//! and a whole-datagram length equality check. Template-based versions
//! (9, IPFIX) are a different animal and are not decoded here.

pub mod v1;
pub mod v5;
pub mod v7;
