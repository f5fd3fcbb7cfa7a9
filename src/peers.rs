//! Per-exporter state table.
//!
//! NetFlow v9 and IPFIX will require holding decoder state (templates) per
//! peer, so the table is built for that future even though v1/v5/v7 only
//! need counters. Peers live in two structures at once: an ordered index
//! keyed by source address for lookup and deterministic dumps, and a
//! doubly-linked recency list so that overflow can evict the
//! least-recently-valid peer in O(1).
//!
//! Only packets that decode successfully refresh recency. An exporter that
//! sends nothing but garbage keeps its `ninvalid` counter but ages out of
//! the table like a silent one.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, warn};

use crate::address::Xaddr;

/// Sentinel for "no slot" in the recency links.
const NIL: usize = usize::MAX;

/// State kept for one exporter endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PeerState {
    /// Source address; immutable, and the table key.
    pub from: Xaddr,
    /// Valid datagrams seen.
    pub npackets: u64,
    /// Flows decoded from valid datagrams.
    pub nflows: u64,
    /// Datagrams rejected by validation.
    pub ninvalid: u64,
    /// When the peer entry was created.
    pub first_seen: SystemTime,
    /// When the last valid datagram arrived; `None` until one does.
    pub last_valid: Option<SystemTime>,
    /// NetFlow version of the most recent valid datagram.
    pub last_version: u16,
}

impl PeerState {
    fn new(from: Xaddr) -> Self {
        Self {
            from,
            npackets: 0,
            nflows: 0,
            ninvalid: 0,
            first_seen: SystemTime::now(),
            last_valid: None,
            last_version: 0,
        }
    }
}

#[derive(Debug)]
struct Slot {
    peer: PeerState,
    /// Neighbor toward the head (more recently valid).
    prev: usize,
    /// Neighbor toward the tail (eviction end).
    next: usize,
}

/// Bounded table of [`PeerState`], evicting by least-recent valid packet.
#[derive(Debug)]
pub struct PeerTable {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: BTreeMap<Xaddr, usize>,
    head: usize,
    tail: usize,
    max_peers: usize,
    num_forced: u64,
}

impl PeerTable {
    /// Create a table holding at most `max_peers` entries.
    ///
    /// # Panics
    ///
    /// Panics if `max_peers` is zero; a collector that can track no peers
    /// cannot accept any datagram.
    pub fn new(max_peers: usize) -> Self {
        assert!(max_peers > 0, "peer table capacity must be nonzero");
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: BTreeMap::new(),
            head: NIL,
            tail: NIL,
            max_peers,
            num_forced: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    /// Cumulative count of peers evicted to make room.
    pub fn num_forced(&self) -> u64 {
        self.num_forced
    }

    /// Look up a peer by source address.
    pub fn find(&self, addr: &Xaddr) -> Option<&PeerState> {
        self.index
            .get(addr)
            .map(|&i| &self.slot(i).peer)
    }

    /// Find or create the peer for `addr`.
    ///
    /// Creating into a full table evicts the tail of the recency list
    /// first, bumping the forced-deletion counter.
    pub fn intern(&mut self, addr: &Xaddr) -> &PeerState {
        if let Some(&i) = self.index.get(addr) {
            return &self.slot(i).peer;
        }

        if self.index.len() == self.max_peers {
            let victim = self.tail;
            let victim_addr = self.slot(victim).peer.from;
            self.num_forced += 1;
            // XXX ratelimit
            warn!(peer = %victim_addr, "forced deletion of peer");
            self.remove(victim);
        }

        let slot = Slot {
            peer: PeerState::new(*addr),
            prev: NIL,
            next: NIL,
        };
        let i = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(*addr, i);
        self.push_front(i);
        debug!(peer = %addr, "new peer");
        &self.slot(i).peer
    }

    /// Record a valid datagram: move the peer to the recency head and
    /// update its counters. No-op if the peer is not present.
    pub fn touch(&mut self, addr: &Xaddr, nflows: u64, netflow_version: u16) {
        let Some(&i) = self.index.get(addr) else {
            debug_assert!(false, "touch of unknown peer");
            return;
        };
        if self.head != i {
            self.unlink(i);
            self.push_front(i);
        }
        let peer = &mut self.slot_mut(i).peer;
        peer.last_valid = Some(SystemTime::now());
        peer.nflows += nflows;
        peer.npackets += 1;
        peer.last_version = netflow_version;
        debug!(peer = %addr, "update peer");
    }

    /// Record a rejected datagram. Deliberately does not refresh recency.
    pub fn note_invalid(&mut self, addr: &Xaddr) {
        if let Some(&i) = self.index.get(addr) {
            self.slot_mut(i).peer.ninvalid += 1;
        }
    }

    /// Peers in key order, for reporting.
    pub fn snapshot(&self) -> impl Iterator<Item = &PeerState> {
        self.index.values().map(|&i| &self.slot(i).peer)
    }

    fn slot(&self, i: usize) -> &Slot {
        self.slots[i].as_ref().expect("indexed slot is occupied")
    }

    fn slot_mut(&mut self, i: usize) -> &mut Slot {
        self.slots[i].as_mut().expect("indexed slot is occupied")
    }

    fn remove(&mut self, i: usize) {
        self.unlink(i);
        let from = self.slot(i).peer.from;
        self.index.remove(&from);
        self.slots[i] = None;
        self.free.push(i);
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = {
            let s = self.slot(i);
            (s.prev, s.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.slot_mut(p).next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.slot_mut(n).prev = prev,
        }
        let s = self.slot_mut(i);
        s.prev = NIL;
        s.next = NIL;
    }

    fn push_front(&mut self, i: usize) {
        let old_head = self.head;
        {
            let s = self.slot_mut(i);
            s.prev = NIL;
            s.next = old_head;
        }
        match old_head {
            NIL => self.tail = i,
            h => self.slot_mut(h).prev = i,
        }
        self.head = i;
    }

    /// Addresses from most to least recently valid.
    #[cfg(test)]
    fn recency_order(&self) -> Vec<Xaddr> {
        let mut out = Vec::new();
        let mut i = self.head;
        while i != NIL {
            let s = self.slot(i);
            out.push(s.peer.from);
            i = s.next;
        }
        out
    }
}
