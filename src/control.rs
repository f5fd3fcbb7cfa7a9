//! Control channel between the collector and its privileged monitor.
//!
//! The collector never opens the log file or binds listening sockets
//! itself; both may need privileges it has dropped. Instead it talks to a
//! monitor over a unix-domain socket pair with three exchanges:
//!
//! - `OPEN_LOG`: the monitor opens the configured log path and passes the
//!   descriptor back via `SCM_RIGHTS`;
//! - `RECONFIGURE`: the monitor re-reads the configuration file, streams
//!   the parsed [`Config`] back as JSON, and passes freshly bound listener
//!   descriptors, in `listen_on` order;
//! - EOF on the channel, in either direction, means the other side is gone.
//!
//! Every message is a length-prefixed tagged envelope (`u32` length, `u8`
//! type, payload). Descriptors ride on a separate one-byte `sendmsg`
//! following the reply that announces them, so stream framing stays
//! trivial.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::UdpSocket;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread::JoinHandle;

use nix::cmsg_space;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::daemon::bind_listeners;

const MSG_OPEN_LOG: u8 = 1;
const MSG_OPEN_LOG_REPLY: u8 = 2;
const MSG_RECONFIGURE: u8 = 3;
const MSG_RECONFIGURE_REPLY: u8 = 4;

/// Ceiling on one envelope; a config cannot plausibly reach this.
const MAX_MSG_LEN: usize = 1 << 20;

/// Most listener descriptors one reply may carry.
const MAX_PASSED_FDS: usize = 16;

#[derive(Debug)]
pub enum ControlError {
    Io(io::Error),
    Json(serde_json::Error),
    Sys(nix::Error),
    /// The monitor reported a failure in its reply.
    Monitor(String),
    UnexpectedMessage { expected: u8, got: u8 },
    MissingDescriptors { expected: usize, got: usize },
    OversizedMessage(usize),
    /// Clean end of stream: the other side exited.
    Eof,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Io(e) => write!(f, "control channel I/O error: {}", e),
            ControlError::Json(e) => write!(f, "control message encoding error: {}", e),
            ControlError::Sys(e) => write!(f, "control channel syscall failed: {}", e),
            ControlError::Monitor(msg) => write!(f, "monitor error: {}", msg),
            ControlError::UnexpectedMessage { expected, got } => write!(
                f,
                "unexpected control message type {} (wanted {})",
                got, expected
            ),
            ControlError::MissingDescriptors { expected, got } => write!(
                f,
                "control reply carried {} descriptors, expected {}",
                got, expected
            ),
            ControlError::OversizedMessage(len) => {
                write!(f, "control message of {} bytes exceeds limit", len)
            }
            ControlError::Eof => f.write_str("control channel closed"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Io(e) => Some(e),
            ControlError::Json(e) => Some(e),
            ControlError::Sys(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ControlError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ControlError::Eof
        } else {
            ControlError::Io(e)
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Json(e)
    }
}

impl From<nix::Error> for ControlError {
    fn from(e: nix::Error) -> Self {
        ControlError::Sys(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenLogReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReconfigureReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    config: Option<Config>,
    /// Listener descriptors that follow on the descriptor message.
    #[serde(default)]
    listeners: usize,
}

fn write_msg(stream: &mut UnixStream, kind: u8, payload: &[u8]) -> Result<(), ControlError> {
    let len = payload.len() as u32 + 1;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&[kind])?;
    stream.write_all(payload)?;
    Ok(())
}

fn read_msg(stream: &mut UnixStream) -> Result<(u8, Vec<u8>), ControlError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MSG_LEN {
        return Err(ControlError::OversizedMessage(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let kind = buf[0];
    buf.remove(0);
    Ok((kind, buf))
}

fn expect_msg(stream: &mut UnixStream, expected: u8) -> Result<Vec<u8>, ControlError> {
    let (kind, payload) = read_msg(stream)?;
    if kind != expected {
        return Err(ControlError::UnexpectedMessage {
            expected,
            got: kind,
        });
    }
    Ok(payload)
}

/// Send descriptors with a one-byte carrier message.
fn send_fds(stream: &UnixStream, fds: &[RawFd]) -> Result<(), ControlError> {
    let marker = [fds.len() as u8];
    let iov = [IoSlice::new(&marker)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    Ok(())
}

/// Receive exactly `expected` descriptors from a carrier message.
fn recv_fds(stream: &UnixStream, expected: usize) -> Result<Vec<RawFd>, ControlError> {
    let mut marker = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut marker)];
    let mut cmsg_buf = cmsg_space!([RawFd; MAX_PASSED_FDS]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )?;
    if msg.bytes == 0 {
        return Err(ControlError::Eof);
    }
    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            fds.extend(received);
        }
    }
    if fds.len() != expected {
        return Err(ControlError::MissingDescriptors {
            expected,
            got: fds.len(),
        });
    }
    Ok(fds)
}

/// Ask the monitor for the flow log descriptor.
pub fn client_open_log(stream: &mut UnixStream) -> Result<File, ControlError> {
    write_msg(stream, MSG_OPEN_LOG, b"")?;
    let payload = expect_msg(stream, MSG_OPEN_LOG_REPLY)?;
    let reply: OpenLogReply = serde_json::from_slice(&payload)?;
    if !reply.ok {
        return Err(ControlError::Monitor(
            reply.error.unwrap_or_else(|| "log open failed".to_string()),
        ));
    }
    let fds = recv_fds(stream, 1)?;
    Ok(unsafe { File::from_raw_fd(fds[0]) })
}

/// A successful reconfigure exchange: the new configuration plus its bound
/// listening sockets, in `listen_on` order.
#[derive(Debug)]
pub struct Reconfigured {
    pub config: Config,
    pub sockets: Vec<UdpSocket>,
}

/// Ask the monitor to re-read the configuration file.
pub fn client_reconfigure(stream: &mut UnixStream) -> Result<Reconfigured, ControlError> {
    write_msg(stream, MSG_RECONFIGURE, b"")?;
    let payload = expect_msg(stream, MSG_RECONFIGURE_REPLY)?;
    let reply: ReconfigureReply = serde_json::from_slice(&payload)?;
    if !reply.ok {
        return Err(ControlError::Monitor(
            reply
                .error
                .unwrap_or_else(|| "reconfigure failed".to_string()),
        ));
    }
    let config = reply
        .config
        .ok_or_else(|| ControlError::Monitor("reply carried no configuration".to_string()))?;
    let fds = recv_fds(stream, reply.listeners)?;
    let sockets = fds
        .into_iter()
        .map(|fd| {
            let socket = unsafe { UdpSocket::from_raw_fd(fd) };
            socket.set_nonblocking(true)?;
            Ok(socket)
        })
        .collect::<io::Result<Vec<_>>>()?;
    Ok(Reconfigured { config, sockets })
}

/// The privileged side of the control channel.
///
/// Owns the configuration path and the macro defines, opens the log path,
/// and rebinds listeners on reconfigure. Runs on its own thread; process
/// separation is deliberately not attempted here.
pub struct Monitor {
    config_path: PathBuf,
    defines: Vec<(String, String)>,
}

impl Monitor {
    pub fn new(config_path: impl Into<PathBuf>, defines: Vec<(String, String)>) -> Self {
        Self {
            config_path: config_path.into(),
            defines,
        }
    }

    /// Start serving requests on a fresh socket pair; returns the
    /// collector's end.
    pub fn spawn(self) -> io::Result<(UnixStream, JoinHandle<()>)> {
        let (client, server) = UnixStream::pair()?;
        let handle = std::thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || self.serve(server))?;
        Ok((client, handle))
    }

    fn serve(self, mut stream: UnixStream) {
        loop {
            let result = match read_msg(&mut stream) {
                Ok((MSG_OPEN_LOG, _)) => self.answer_open_log(&mut stream),
                Ok((MSG_RECONFIGURE, _)) => self.answer_reconfigure(&mut stream),
                Ok((kind, _)) => {
                    warn!(kind, "unknown control request, closing channel");
                    break;
                }
                Err(ControlError::Eof) => {
                    debug!("collector closed the control channel");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "control channel read failed");
                    break;
                }
            };
            if let Err(e) = result {
                warn!(error = %e, "control reply failed");
                break;
            }
        }
    }

    fn answer_open_log(&self, stream: &mut UnixStream) -> Result<(), ControlError> {
        debug!("open_log request");
        match self.open_log_file() {
            Ok(file) => {
                let reply = serde_json::to_vec(&OpenLogReply {
                    ok: true,
                    error: None,
                })?;
                write_msg(stream, MSG_OPEN_LOG_REPLY, &reply)?;
                send_fds(stream, &[file.as_raw_fd()])
            }
            Err(e) => {
                let reply = serde_json::to_vec(&OpenLogReply {
                    ok: false,
                    error: Some(e),
                })?;
                write_msg(stream, MSG_OPEN_LOG_REPLY, &reply)
            }
        }
    }

    fn open_log_file(&self) -> Result<File, String> {
        let config = Config::load(&self.config_path, &self.defines)
            .map_err(|e| format!("{}", e))?;
        OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&config.log_file)
            .map_err(|e| format!("open {}: {}", config.log_file.display(), e))
    }

    fn answer_reconfigure(&self, stream: &mut UnixStream) -> Result<(), ControlError> {
        debug!("reconfigure request");
        let outcome = Config::load(&self.config_path, &self.defines)
            .map_err(|e| format!("{}", e))
            .and_then(|config| {
                if config.listen_on.len() > MAX_PASSED_FDS {
                    return Err(format!(
                        "{} listen addresses exceed the descriptor-passing limit of {}",
                        config.listen_on.len(),
                        MAX_PASSED_FDS
                    ));
                }
                let sockets =
                    bind_listeners(&config.listen_on).map_err(|e| format!("bind: {}", e))?;
                Ok((config, sockets))
            });

        match outcome {
            Ok((config, sockets)) => {
                let reply = serde_json::to_vec(&ReconfigureReply {
                    ok: true,
                    error: None,
                    config: Some(config),
                    listeners: sockets.len(),
                })?;
                write_msg(stream, MSG_RECONFIGURE_REPLY, &reply)?;
                let fds: Vec<RawFd> = sockets.iter().map(|s| s.as_raw_fd()).collect();
                send_fds(stream, &fds)
            }
            Err(e) => {
                let reply = serde_json::to_vec(&ReconfigureReply {
                    ok: false,
                    error: Some(e),
                    config: None,
                    listeners: 0,
                })?;
                write_msg(stream, MSG_RECONFIGURE_REPLY, &reply)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        write_msg(&mut a, MSG_OPEN_LOG, b"hello").unwrap();
        let (kind, payload) = read_msg(&mut b).unwrap();
        assert_eq!(kind, MSG_OPEN_LOG);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn eof_is_distinguished() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(matches!(read_msg(&mut b), Err(ControlError::Eof)));
    }

    #[test]
    fn descriptor_passing_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_fds(&a, &[file.as_raw_fd()]).unwrap();
        let fds = recv_fds(&b, 1).unwrap();
        assert_eq!(fds.len(), 1);
        let mut received = unsafe { File::from_raw_fd(fds[0]) };
        received.write_all(b"via scm_rights").unwrap();
    }
}
