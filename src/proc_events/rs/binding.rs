//! Binding to the Linux process events connector (`NETLINK_CONNECTOR`, `CN_IDX_PROC`).
//!
//! The kernel multicasts a message for every fork, exec and exit once a socket has joined the
//! proc connector group. Joining requires `CAP_NET_ADMIN`, so callers must be prepared for
//! [`AttachError::PermissionDenied`].

use crate::trigger::{
    ExitReason, ProcessEndTrigger, ProcessExecTrigger, ProcessStartTrigger, Trigger,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

const NLMSG_HDRLEN: usize = 16;
const CN_MSG_LEN: usize = 20;
const PROC_EVENT_OFFSET: usize = NLMSG_HDRLEN + CN_MSG_LEN;
const PROC_EVENT_DATA_OFFSET: usize = PROC_EVENT_OFFSET + 16;

const NLMSG_ERROR: u16 = 0x2;
const NLMSG_DONE: u16 = 0x3;

const CN_IDX_PROC: u32 = 0x1;
const CN_VAL_PROC: u32 = 0x1;

const PROC_CN_MCAST_LISTEN: u32 = 1;
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const PROC_CN_MCAST_IGNORE: u32 = 2;

const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("insufficient privilege to join the process events connector (CAP_NET_ADMIN required)")]
    PermissionDenied,
    #[error("the process events connector is not supported on this platform")]
    Unsupported,
    #[error("failed to attach to the process events connector: {0}")]
    Io(#[from] std::io::Error),
}

impl AttachError {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn classify(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => AttachError::PermissionDenied,
            Some(libc::EPROTONOSUPPORT) | Some(libc::EAFNOSUPPORT) => AttachError::Unsupported,
            _ => AttachError::Io(err),
        }
    }
}

/// Handle to a running listener thread. Dropping it stops the thread.
pub struct Subscription {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signals the listener to exit and waits for it. The listener polls the stop flag at
    /// least every receive timeout, so this returns promptly.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("process events listener panicked");
            }
            info!("process events listener stopped");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds a proc connector control message (`PROC_CN_MCAST_LISTEN`/`PROC_CN_MCAST_IGNORE`).
pub(crate) fn control_message(op: u32) -> Vec<u8> {
    let total = PROC_EVENT_OFFSET + 4;
    let mut buf = Vec::with_capacity(total);
    // nlmsghdr
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&std::process::id().to_ne_bytes());
    // cn_msg
    buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&4u16.to_ne_bytes());
    buf.extend_from_slice(&0u16.to_ne_bytes());
    // payload
    buf.extend_from_slice(&op.to_ne_bytes());
    buf
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_ne_bytes(bytes.try_into().ok()?))
}

/// Decodes one datagram from the connector. Thread-level fork/exit notifications are dropped;
/// only thread group leaders become triggers.
pub(crate) fn parse_message(buf: &[u8]) -> Option<Trigger> {
    let msg_type = read_u16(buf, 4)?;
    if msg_type == NLMSG_ERROR {
        return None;
    }
    if read_u32(buf, NLMSG_HDRLEN)? != CN_IDX_PROC || read_u32(buf, NLMSG_HDRLEN + 4)? != CN_VAL_PROC
    {
        return None;
    }

    let what = read_u32(buf, PROC_EVENT_OFFSET)?;
    let data = PROC_EVENT_DATA_OFFSET;
    let now = Utc::now();

    match what {
        PROC_EVENT_FORK => {
            let parent_tgid = read_u32(buf, data + 4)?;
            let child_pid = read_u32(buf, data + 8)?;
            let child_tgid = read_u32(buf, data + 12)?;
            (child_pid == child_tgid).then(|| {
                Trigger::ProcessStart(ProcessStartTrigger {
                    pid: child_tgid,
                    ppid: parent_tgid,
                    started_at: now,
                })
            })
        }
        PROC_EVENT_EXEC => {
            let pid = read_u32(buf, data)?;
            let tgid = read_u32(buf, data + 4)?;
            (pid == tgid).then(|| {
                Trigger::ProcessExec(ProcessExecTrigger {
                    pid: tgid,
                    executed_at: now,
                })
            })
        }
        PROC_EVENT_EXIT => {
            let pid = read_u32(buf, data)?;
            let tgid = read_u32(buf, data + 4)?;
            let exit_code = read_u32(buf, data + 8)?;
            (pid == tgid).then(|| {
                Trigger::ProcessEnd(ProcessEndTrigger {
                    pid: tgid,
                    finished_at: now,
                    exit_reason: Some(ExitReason::from_wait_status(exit_code)),
                })
            })
        }
        _ => None,
    }
}

/// Joins the proc connector group and spawns a listener thread that forwards every decoded
/// trigger into `tx`. The thread exits when the returned [`Subscription`] is stopped or the
/// receiving side of `tx` is dropped.
#[cfg(target_os = "linux")]
pub fn start_processing_events(tx: UnboundedSender<Trigger>) -> Result<Subscription, AttachError> {
    let socket = linux::ConnectorSocket::open()?;
    socket.send_control(PROC_CN_MCAST_LISTEN)?;
    info!("joined process events connector");

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let handle = std::thread::Builder::new()
        .name("proc-events".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; 4096];
            while !stop_flag.load(Ordering::Relaxed) {
                let received = match socket.recv(&mut buf) {
                    Ok(Some(n)) => n,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!("process events receive failed: {}", e);
                        break;
                    }
                };

                if let Some(trigger) = parse_message(&buf[..received]) {
                    if tx.send(trigger).is_err() {
                        debug!("trigger receiver dropped, exiting listener");
                        break;
                    }
                }
            }

            if let Err(e) = socket.send_control(PROC_CN_MCAST_IGNORE) {
                debug!("failed to leave process events connector: {}", e);
            }
        })?;

    Ok(Subscription {
        stop,
        handle: Some(handle),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn start_processing_events(_tx: UnboundedSender<Trigger>) -> Result<Subscription, AttachError> {
    Err(AttachError::Unsupported)
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{control_message, AttachError, CN_IDX_PROC};
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    const RECEIVE_TIMEOUT_MS: libc::suseconds_t = 200_000;

    pub(super) struct ConnectorSocket {
        fd: OwnedFd,
    }

    impl ConnectorSocket {
        pub(super) fn open() -> Result<Self, AttachError> {
            // SAFETY: plain socket(2) call, the result is checked before use.
            let raw = unsafe {
                libc::socket(
                    libc::AF_NETLINK,
                    libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                    libc::NETLINK_CONNECTOR,
                )
            };
            if raw < 0 {
                return Err(AttachError::classify(io::Error::last_os_error()));
            }
            // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
            let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            addr.nl_groups = CN_IDX_PROC;
            addr.nl_pid = 0;

            // SAFETY: `addr` outlives the call and the length matches its type.
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(AttachError::classify(io::Error::last_os_error()));
            }

            let timeout = libc::timeval {
                tv_sec: 0,
                tv_usec: RECEIVE_TIMEOUT_MS,
            };
            // SAFETY: `timeout` outlives the call and the length matches its type.
            let rc = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &timeout as *const libc::timeval as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(AttachError::classify(io::Error::last_os_error()));
            }

            Ok(Self { fd })
        }

        pub(super) fn send_control(&self, op: u32) -> Result<(), AttachError> {
            let message = control_message(op);
            // SAFETY: the buffer is valid for `message.len()` bytes.
            let rc = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    message.as_ptr() as *const libc::c_void,
                    message.len(),
                    0,
                )
            };
            if rc < 0 {
                return Err(AttachError::classify(io::Error::last_os_error()));
            }
            Ok(())
        }

        /// Returns `Ok(None)` on timeout, interruption or a dropped-notification overrun.
        pub(super) fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            // SAFETY: the buffer is valid for writes of `buf.len()` bytes.
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if rc >= 0 {
                return Ok(Some(rc as usize));
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                Some(libc::ENOBUFS) => {
                    tracing::warn!("process events socket overrun, notifications were dropped");
                    Ok(None)
                }
                _ => Err(err),
            }
        }
    }
}
