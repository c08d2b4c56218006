//! Unix datagram transport for the notification channel.
//!
//! The proxy binds `<dir>/proxyfs-<unit>.sock`. A monitor binds
//! `<dir>/proxyfs-<unit>-<pid>.sock` and registers by sending a
//! registration frame to the proxy socket; notifications are unicast to the
//! monitor's socket.

use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use proxyfs_core::channel::{registration_frame, FrameHeader, ProcessProbe, Transport, MSG_DONE};
use proxyfs_core::context::ProxyContext;
use proxyfs_core::event::FsEvent;

use crate::{HostError, Result};

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 64 * 1024;

/// How often the listener checks whether it should stop.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Path of the proxy endpoint for `unit_id`.
pub fn endpoint_path(dir: &Path, unit_id: u32) -> PathBuf {
    dir.join(format!("proxyfs-{}.sock", unit_id))
}

/// Path of the monitor endpoint of `pid`.
pub fn subscriber_path(dir: &Path, unit_id: u32, pid: u32) -> PathBuf {
    dir.join(format!("proxyfs-{}-{}.sock", unit_id, pid))
}

fn bind(path: &Path) -> io::Result<UnixDatagram> {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixDatagram::bind(path)
}

/// The proxy side of the channel.
pub struct UnixTransport {
    dir: PathBuf,
    unit_id: u32,
    socket: UnixDatagram,
    closed: Arc<AtomicBool>,
}

impl UnixTransport {
    pub fn bind(dir: &Path, unit_id: u32) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let socket = bind(&endpoint_path(dir, unit_id))?;
        info!(path = %endpoint_path(dir, unit_id).display(), "Notification endpoint bound");
        Ok(Self {
            dir: dir.to_path_buf(),
            unit_id,
            socket,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> PathBuf {
        endpoint_path(&self.dir, self.unit_id)
    }

    /// Feeds every datagram received on the endpoint to the context's
    /// channel as a registration, until the transport closes.
    pub fn spawn_listener(&self, context: Arc<ProxyContext>) -> Result<JoinHandle<()>> {
        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let closed = Arc::clone(&self.closed);

        let handle = thread::Builder::new()
            .name("proxyfs-listener".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                while !closed.load(Ordering::Acquire) {
                    let n = match socket.recv(&mut buf) {
                        Ok(n) => n,
                        Err(e)
                            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                        {
                            continue
                        }
                        Err(e) => {
                            warn!(error = %e, "Notification endpoint failed");
                            break;
                        }
                    };
                    match context.channel().handle_registration(&buf[..n]) {
                        Ok(pid) => info!(pid, "Monitor registered"),
                        Err(e) => warn!(error = %e, "Rejected registration frame"),
                    }
                }
                debug!("Notification listener stopped");
            })?;
        Ok(handle)
    }
}

impl Transport for UnixTransport {
    fn unicast(&self, pid: u32, frame: &[u8]) -> io::Result<()> {
        let target = subscriber_path(&self.dir, self.unit_id, pid);
        self.socket.send_to(frame, &target).map(|_| ())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = fs::remove_file(self.path()) {
            warn!(error = %e, "Failed to remove notification endpoint");
        }
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Process liveness through `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcProbe;

impl ProcessProbe for ProcProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        // SAFETY: signal 0 only checks for existence and permission.
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// The monitor side of the channel.
pub struct Subscriber {
    path: PathBuf,
    socket: UnixDatagram,
    pid: u32,
}

impl Subscriber {
    /// Binds the monitor endpoint of the current process.
    pub fn bind(dir: &Path, unit_id: u32) -> Result<Self> {
        let pid = std::process::id();
        let path = subscriber_path(dir, unit_id, pid);
        let socket = bind(&path)?;
        socket.connect(endpoint_path(dir, unit_id))?;
        Ok(Self { path, socket, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Announces this process as the subscriber.
    pub fn register(&self) -> Result<()> {
        let frame = registration_frame(self.pid, b"register");
        self.socket.send(&frame)?;
        debug!(pid = self.pid, "Registration sent");
        Ok(())
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.socket.set_read_timeout(timeout)?)
    }

    /// Waits for the next notification.
    pub fn recv(&self) -> Result<FsEvent> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self.socket.recv(&mut buf)?;
        decode_event(&buf[..n])
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Decodes one notification frame.
pub fn decode_event(frame: &[u8]) -> Result<FsEvent> {
    let (header, payload) = FrameHeader::decode(frame)?;
    if header.kind != MSG_DONE {
        return Err(HostError::Malformed(format!("unexpected frame type {}", header.kind)));
    }
    // A trailing NUL is tolerated.
    let body = payload.split(|b| *b == 0).next().unwrap_or_default();
    FsEvent::from_json(body).map_err(|e| HostError::Malformed(e.to_string()))
}
