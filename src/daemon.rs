//! The collector event loop.
//!
//! One thread owns everything: the peer table, the configuration, the log
//! descriptor, and a poll set of the control channel plus one descriptor
//! per listening socket. Signal handlers only set flags; the loop inspects
//! them at the top of every iteration, so the poll call (installed without
//! `SA_RESTART`) is the only suspension point.

use std::fs::File;
use std::io::{self, Write};
use std::net::{SocketAddr, UdpSocket};
use std::os::raw::c_int;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::{debug, info, warn};

use crate::address::Xaddr;
use crate::config::Config;
use crate::control;
use crate::decode::decode_datagram;
use crate::filter::{FilterAction, FilterRule, evaluate};
use crate::flow::FlowRecord;
use crate::peers::PeerTable;
use crate::store::{self, StoreError};

/// Receive buffer; ample for any fixed-layout NetFlow datagram.
/// Template-based versions will need growth.
const RECV_BUF_LEN: usize = 2048;

static EXIT_FLAG: AtomicI32 = AtomicI32::new(0);
static RECONF_FLAG: AtomicBool = AtomicBool::new(false);
static REOPEN_FLAG: AtomicBool = AtomicBool::new(false);
static INFO_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn sighand_exit(signo: c_int) {
    EXIT_FLAG.store(signo, Ordering::Relaxed);
}

extern "C" fn sighand_reconf(_signo: c_int) {
    RECONF_FLAG.store(true, Ordering::Relaxed);
    REOPEN_FLAG.store(true, Ordering::Relaxed);
}

extern "C" fn sighand_reopen(_signo: c_int) {
    REOPEN_FLAG.store(true, Ordering::Relaxed);
}

extern "C" fn sighand_info(_signo: c_int) {
    INFO_FLAG.store(true, Ordering::Relaxed);
}

/// Install the four flag-setting handlers. No `SA_RESTART`: the poll call
/// must return with `EINTR` so flags get serviced promptly.
pub fn install_signal_handlers() -> nix::Result<()> {
    let flags = SaFlags::empty();
    let mask = SigSet::empty();
    unsafe {
        sigaction(
            Signal::SIGINT,
            &SigAction::new(SigHandler::Handler(sighand_exit), flags, mask),
        )?;
        sigaction(
            Signal::SIGTERM,
            &SigAction::new(SigHandler::Handler(sighand_exit), flags, mask),
        )?;
        sigaction(
            Signal::SIGHUP,
            &SigAction::new(SigHandler::Handler(sighand_reconf), flags, mask),
        )?;
        sigaction(
            Signal::SIGUSR1,
            &SigAction::new(SigHandler::Handler(sighand_reopen), flags, mask),
        )?;
        sigaction(
            Signal::SIGUSR2,
            &SigAction::new(SigHandler::Handler(sighand_info), flags, mask),
        )?;
    }
    Ok(())
}

/// Bind one non-blocking UDP socket per configured address.
///
/// `SO_REUSEADDR` is set so a reconfigure can bind replacement sockets
/// while the ones being replaced are still open.
pub fn bind_listeners(addrs: &[SocketAddr]) -> io::Result<Vec<UdpSocket>> {
    addrs.iter().map(open_listener).collect()
}

fn open_listener(addr: &SocketAddr) -> io::Result<UdpSocket> {
    use nix::sys::socket::{
        AddressFamily, SockFlag, SockType, SockaddrStorage, bind, setsockopt, socket, sockopt,
    };
    use std::os::unix::io::FromRawFd;

    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(family, SockType::Datagram, SockFlag::empty(), None)
        .map_err(io::Error::from)?;
    // The fd is owned from here on; wrap early so errors close it.
    let sock = unsafe { UdpSocket::from_raw_fd(fd) };
    setsockopt(fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;
    bind(fd, &SockaddrStorage::from(*addr)).map_err(io::Error::from)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// Run one datagram through the receive → decode → filter → append
/// pipeline. Returns how many records were appended to `log`.
///
/// Per-datagram failures only touch the sending peer's counters; a
/// [`StoreError`] is the one fatal outcome, because the log is the
/// collector's entire output.
pub fn handle_datagram<W: Write>(
    pkt: &[u8],
    source: &Xaddr,
    now: SystemTime,
    peers: &mut PeerTable,
    filters: &[FilterRule],
    store_mask: u32,
    verbose: bool,
    log: &mut W,
) -> Result<usize, StoreError> {
    peers.intern(source);

    match decode_datagram(pkt, source, now) {
        Ok(decoded) => {
            debug!(
                version = decoded.version,
                flows = decoded.count,
                peer = %source,
                "valid NetFlow packet"
            );
            peers.touch(source, u64::from(decoded.count), decoded.version);
            let mut written = 0;
            for mut flow in decoded.flows {
                if process_flow(&mut flow, filters, store_mask, verbose, log)? {
                    written += 1;
                }
            }
            Ok(written)
        }
        Err(err) if err.is_invalid() => {
            peers.note_invalid(source);
            // XXX ratelimit
            warn!(peer = %source, "{}", err);
            Ok(0)
        }
        Err(err) => {
            info!(peer = %source, "{}", err);
            Ok(0)
        }
    }
}

fn process_flow<W: Write>(
    flow: &mut FlowRecord,
    filters: &[FilterRule],
    store_mask: u32,
    verbose: bool,
    log: &mut W,
) -> Result<bool, StoreError> {
    if let (Some(src), Some(dst)) = (&flow.src_addr, &flow.dst_addr) {
        if src.family() != dst.family() {
            warn!(src = %src, dst = %dst, "flow src/dst address family mismatch");
            return Ok(false);
        }
    }

    if verbose {
        debug!("flow {}", flow);
    }

    if evaluate(flow, filters) == FilterAction::Discard {
        return Ok(false);
    }

    store::put_flow(log, flow, store_mask)?;
    Ok(true)
}

/// The collector: configuration, sockets, peer table, control channel and
/// log descriptor, driven by [`Daemon::run`].
pub struct Daemon {
    config: Config,
    store_mask: u32,
    verbose: bool,
    sockets: Vec<UdpSocket>,
    peers: PeerTable,
    monitor: UnixStream,
    log: Option<File>,
}

impl Daemon {
    pub fn new(
        config: Config,
        sockets: Vec<UdpSocket>,
        monitor: UnixStream,
        verbose: bool,
    ) -> Self {
        let store_mask = config.store_mask();
        let peers = PeerTable::new(config.max_peers);
        Self {
            config,
            store_mask,
            verbose,
            sockets,
            peers,
            monitor,
            log: None,
        }
    }

    /// The main loop. Returns on a termination signal or monitor exit;
    /// errors are fatal conditions (log write failure, failed reload).
    pub fn run(&mut self) -> Result<()> {
        let mut pollfds = self.pollfds();

        loop {
            if EXIT_FLAG.load(Ordering::Relaxed) != 0 {
                break;
            }
            if REOPEN_FLAG.swap(false, Ordering::Relaxed) && self.log.is_some() {
                info!("log reopen requested");
                self.log = None;
            }
            if RECONF_FLAG.swap(false, Ordering::Relaxed) {
                info!("reconfiguration requested");
                self.reconfigure().context("reconfigure failed, exiting")?;
                pollfds = self.pollfds();
            }
            if self.log.is_none() {
                self.start_log().context("logfile open failed, exiting")?;
            }
            if INFO_FLAG.swap(false, Ordering::Relaxed) {
                self.dump_state();
            }

            match poll(&mut pollfds, -1) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(anyhow!(e).context("poll failed")),
            }

            // Any event on the control channel means the monitor is gone.
            if pollfds[0].revents().is_some_and(|r| !r.is_empty()) {
                debug!("monitor closed the control channel");
                break;
            }

            for i in 1..pollfds.len() {
                if pollfds[i]
                    .revents()
                    .is_some_and(|r| r.contains(PollFlags::POLLIN))
                {
                    self.process_input(i - 1)?;
                }
            }
        }

        let signo = EXIT_FLAG.load(Ordering::Relaxed);
        if signo != 0 {
            info!(signal = signo, "exiting on signal");
        }
        Ok(())
    }

    /// Control channel first, then one entry per listening socket; rebuilt
    /// whole on reconfigure.
    fn pollfds(&self) -> Vec<PollFd> {
        let mut fds = Vec::with_capacity(self.sockets.len() + 1);
        fds.push(PollFd::new(self.monitor.as_raw_fd(), PollFlags::POLLIN));
        for socket in &self.sockets {
            fds.push(PollFd::new(socket.as_raw_fd(), PollFlags::POLLIN));
        }
        fds
    }

    /// Read and process one datagram from a readable socket.
    fn process_input(&mut self, idx: usize) -> Result<()> {
        let mut buf = [0u8; RECV_BUF_LEN];
        let (len, from) = loop {
            match self.sockets[idx].recv_from(&mut buf) {
                Ok(received) => break received,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Spurious wake; rare but legal.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    // XXX ratelimit
                    warn!(error = %e, "recvfrom failed");
                    return Ok(());
                }
            }
        };

        let source = Xaddr::from(from);
        let log = self
            .log
            .as_mut()
            .ok_or_else(|| anyhow!("no open log while processing input"))?;
        handle_datagram(
            &buf[..len],
            &source,
            SystemTime::now(),
            &mut self.peers,
            &self.config.filters,
            self.store_mask,
            self.verbose,
            log,
        )
        .context("log write failed, exiting")?;
        Ok(())
    }

    /// Fetch the log descriptor from the monitor and establish the header
    /// contract on it.
    fn start_log(&mut self) -> Result<()> {
        let mut file = control::client_open_log(&mut self.monitor)?;
        store::open_log(&mut file)?;
        debug!("flow log ready");
        self.log = Some(file);
        Ok(())
    }

    /// Run the reconfigure exchange and swap in the result. The peer table
    /// deliberately survives: its capacity is fixed for the table's life
    /// and exporter history is worth keeping across a HUP.
    fn reconfigure(&mut self) -> Result<()> {
        let reconf = control::client_reconfigure(&mut self.monitor)?;
        if reconf.config.max_peers != self.config.max_peers {
            warn!(
                old = self.config.max_peers,
                new = reconf.config.max_peers,
                "max_peers change ignored until restart"
            );
        }
        info!(
            listeners = reconf.sockets.len(),
            filters = reconf.config.filters.len(),
            "configuration reloaded"
        );
        self.store_mask = reconf.config.store_mask();
        self.sockets = reconf.sockets;
        self.config = reconf.config;
        Ok(())
    }

    /// Dump the rule list and peer table to the log at info level.
    fn dump_state(&self) {
        for rule in &self.config.filters {
            info!("filter rule: {}", rule);
        }
        info!(
            "peer state: {} of {} in use, {} forced deletions",
            self.peers.len(),
            self.peers.max_peers(),
            self.peers.num_forced()
        );
        for (i, peer) in self.peers.snapshot().enumerate() {
            info!(
                "peer {} - {}: {} packets {} flows {} invalid",
                i, peer.from, peer.npackets, peer.nflows, peer.ninvalid
            );
            info!(
                "peer {} - {}: first seen {}",
                i,
                peer.from,
                format_time(peer.first_seen)
            );
            if let Some(last_valid) = peer.last_valid {
                info!(
                    "peer {} - {}: last valid {} netflow v.{}",
                    i,
                    peer.from,
                    format_time(last_valid),
                    peer.last_version
                );
            }
        }
    }
}

fn format_time(t: SystemTime) -> String {
    DateTime::<Local>::from(t)
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::field;

    fn source() -> Xaddr {
        Xaddr::V4("203.0.113.5".parse().unwrap())
    }

    // A 64-byte v1 datagram carrying one TCP flow of 100 octets.
    fn v1_single_flow() -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&10_000u32.to_be_bytes());
        pkt.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        pkt.extend_from_slice(&0u32.to_be_bytes());
        pkt.extend_from_slice(&[10, 0, 0, 1]);
        pkt.extend_from_slice(&[10, 0, 0, 2]);
        pkt.extend_from_slice(&[0, 0, 0, 0]);
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&2u16.to_be_bytes());
        pkt.extend_from_slice(&1u32.to_be_bytes());
        pkt.extend_from_slice(&100u32.to_be_bytes());
        pkt.extend_from_slice(&1_000u32.to_be_bytes());
        pkt.extend_from_slice(&2_000u32.to_be_bytes());
        pkt.extend_from_slice(&1234u16.to_be_bytes());
        pkt.extend_from_slice(&80u16.to_be_bytes());
        pkt.extend_from_slice(&0u16.to_be_bytes());
        pkt.push(6);
        pkt.push(0);
        pkt.push(0x10);
        pkt.push(0);
        pkt.extend_from_slice(&0u16.to_be_bytes());
        pkt.extend_from_slice(&0u32.to_be_bytes());
        pkt
    }

    #[test]
    fn valid_datagram_appends_and_touches() {
        let mut peers = PeerTable::new(8);
        let mut log = Vec::new();
        let written = handle_datagram(
            &v1_single_flow(),
            &source(),
            SystemTime::now(),
            &mut peers,
            &[],
            field::ALL,
            false,
            &mut log,
        )
        .unwrap();
        assert_eq!(written, 1);
        assert!(!log.is_empty());

        let peer = peers.find(&source()).unwrap();
        assert_eq!(peer.npackets, 1);
        assert_eq!(peer.nflows, 1);
        assert_eq!(peer.ninvalid, 0);
        assert_eq!(peer.last_version, 1);
    }

    #[test]
    fn short_datagram_counts_invalid_and_appends_nothing() {
        let mut peers = PeerTable::new(8);
        let mut log = Vec::new();
        let written = handle_datagram(
            &[0, 5, 0],
            &source(),
            SystemTime::now(),
            &mut peers,
            &[],
            field::ALL,
            false,
            &mut log,
        )
        .unwrap();
        assert_eq!(written, 0);
        assert!(log.is_empty());
        assert_eq!(peers.find(&source()).unwrap().ninvalid, 1);
    }

    #[test]
    fn unknown_version_creates_peer_without_invalid() {
        let mut peers = PeerTable::new(8);
        let mut log = Vec::new();
        let mut pkt = vec![0u8; 24];
        pkt[1] = 9;
        let written = handle_datagram(
            &pkt,
            &source(),
            SystemTime::now(),
            &mut peers,
            &[],
            field::ALL,
            false,
            &mut log,
        )
        .unwrap();
        assert_eq!(written, 0);
        assert!(log.is_empty());
        let peer = peers.find(&source()).unwrap();
        assert_eq!(peer.ninvalid, 0);
        assert_eq!(peer.npackets, 0);
    }

    #[test]
    fn rebinding_an_unchanged_address_succeeds() {
        // A reconfigure with an unchanged config binds replacements while
        // the old sockets are still open.
        let first = bind_listeners(&["127.0.0.1:0".parse().unwrap()]).unwrap();
        let addr = first[0].local_addr().unwrap();
        let second = bind_listeners(&[addr]).unwrap();
        assert_eq!(second[0].local_addr().unwrap(), addr);
    }

    #[test]
    fn discard_filter_suppresses_append() {
        use crate::filter::{FilterMatch, FilterRule};

        let rules = vec![FilterRule {
            action: FilterAction::Discard,
            tag: None,
            criteria: FilterMatch {
                protocol: Some(6),
                ..Default::default()
            },
        }];
        let mut peers = PeerTable::new(8);
        let mut log = Vec::new();
        let written = handle_datagram(
            &v1_single_flow(),
            &source(),
            SystemTime::now(),
            &mut peers,
            &rules,
            field::ALL,
            false,
            &mut log,
        )
        .unwrap();
        assert_eq!(written, 0);
        assert!(log.is_empty());
        // The datagram itself was valid.
        assert_eq!(peers.find(&source()).unwrap().npackets, 1);
    }
}
