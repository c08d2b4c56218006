//! Single-subscriber notification channel.
//!
//! A monitoring process registers by sending a registration frame; its PID
//! becomes the subscriber. Notifications are built in a pool buffer and
//! unicast to that PID. A subscriber that died or cannot be reached is
//! cleared and later sends are no-ops until someone registers again.
//!
//! Frames use a netlink-style header, little-endian:
//!
//! ```text
//! len:u32 | type:u16 | flags:u16 | seq:u32 | pid:u32 | payload
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, trace, warn};

use crate::error::{ProxyError, Result};
use crate::pool::BufferPool;

/// Default channel unit identifier.
pub const DEFAULT_UNIT_ID: u32 = 25;

/// Length of the frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Frame type of outgoing notifications.
pub const MSG_DONE: u16 = 3;

/// Header preceding every frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Total frame length, header included
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    /// Sender PID; 0 for frames sent by the proxy
    pub pid: u32,
}

impl FrameHeader {
    /// Writes the header into the first [`HEADER_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < HEADER_LEN {
            return Err(ProxyError::MessageTooLarge { len: HEADER_LEN, max: dst.len() });
        }
        let mut out = &mut dst[..HEADER_LEN];
        out.put_u32_le(self.len);
        out.put_u16_le(self.kind);
        out.put_u16_le(self.flags);
        out.put_u32_le(self.seq);
        out.put_u32_le(self.pid);
        Ok(())
    }

    /// Splits a frame into its header and payload. The payload is bounded
    /// by the header's length field.
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8])> {
        if frame.len() < HEADER_LEN {
            return Err(ProxyError::InvalidArgument(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        let mut cur = frame;
        let header = FrameHeader {
            len: cur.get_u32_le(),
            kind: cur.get_u16_le(),
            flags: cur.get_u16_le(),
            seq: cur.get_u32_le(),
            pid: cur.get_u32_le(),
        };
        let end = (header.len as usize).clamp(HEADER_LEN, frame.len());
        Ok((header, &frame[HEADER_LEN..end]))
    }
}

/// Builds a registration frame announcing `pid` as subscriber.
pub fn registration_frame(pid: u32, message: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + message.len());
    frame.put_u32_le((HEADER_LEN + message.len()) as u32);
    frame.put_u16_le(0);
    frame.put_u16_le(0);
    frame.put_u32_le(0);
    frame.put_u32_le(pid);
    frame.put_slice(message);
    frame
}

/// Delivers frames to a process.
pub trait Transport: Send + Sync {
    /// Sends one frame to `pid`.
    fn unicast(&self, pid: u32, frame: &[u8]) -> std::io::Result<()>;

    /// Releases the endpoint. Called once when the channel closes.
    fn close(&self) {}
}

/// Tells whether a process still exists.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// What happened to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The channel endpoint is not open
    NoEndpoint,
    /// Nobody is registered
    NoSubscriber,
    /// The subscriber process is gone; it was cleared
    SubscriberGone,
    /// Unicast failed; the subscriber was cleared
    DeliveryFailed,
    /// No pool buffer was free
    Dropped,
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

/// Channel between the proxy and at most one monitoring process.
pub struct NotificationChannel {
    unit_id: u32,
    endpoint: RwLock<Option<Arc<dyn Transport>>>,
    subscriber: AtomicU32,
    seq: AtomicU32,
    pool: BufferPool,
    probe: Arc<dyn ProcessProbe>,
}

impl NotificationChannel {
    pub fn new(unit_id: u32, pool: BufferPool, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            unit_id,
            endpoint: RwLock::new(None),
            subscriber: AtomicU32::new(0),
            seq: AtomicU32::new(0),
            pool,
            probe,
        }
    }

    pub fn unit_id(&self) -> u32 {
        self.unit_id
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Opens the endpoint. Replaces and closes any previous one.
    pub fn open(&self, transport: Arc<dyn Transport>) {
        if let Some(old) = self.endpoint.write().replace(transport) {
            old.close();
        }
        info!(unit_id = self.unit_id, "Opened notification channel");
    }

    /// Closes the endpoint. Returns false if it was not open.
    pub fn close(&self) -> bool {
        match self.endpoint.write().take() {
            Some(transport) => {
                transport.close();
                info!(unit_id = self.unit_id, "Closed notification channel");
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.read().is_some()
    }

    /// Makes `pid` the subscriber, returning the previous one (0 = none).
    pub fn register_subscriber(&self, pid: u32) -> u32 {
        self.subscriber.swap(pid, Ordering::AcqRel)
    }

    pub fn subscriber(&self) -> Option<u32> {
        match self.subscriber.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Clears the subscriber if it is still `pid`.
    fn drop_subscriber(&self, pid: u32) {
        let _ = self
            .subscriber
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Handles an inbound registration frame: its sender PID becomes the
    /// subscriber. Returns the previous subscriber.
    pub fn handle_registration(&self, frame: &[u8]) -> Result<u32> {
        let (header, payload) = FrameHeader::decode(frame)?;
        let previous = self.register_subscriber(header.pid);
        info!(pid = header.pid, previous, "Registered client PID");

        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches('\0');
        if !text.is_empty() {
            info!(pid = header.pid, payload = text, "Registration message");
        }
        Ok(previous)
    }

    /// Largest payload a single frame can carry.
    pub fn max_payload(&self) -> usize {
        self.pool.buffer_size().saturating_sub(HEADER_LEN)
    }

    /// Sends `body` to the subscriber.
    ///
    /// Only an oversized body or a missing pool is an error; every
    /// condition on the subscriber's side is reported as an outcome.
    pub fn send(&self, body: &[u8]) -> Result<SendOutcome> {
        let Some(transport) = self.endpoint.read().clone() else {
            return Ok(SendOutcome::NoEndpoint);
        };
        let Some(pid) = self.subscriber() else {
            return Ok(SendOutcome::NoSubscriber);
        };

        if !self.probe.is_alive(pid) {
            warn!(
                pid,
                body = %String::from_utf8_lossy(body),
                "Subscriber process does not exist, connection closed"
            );
            self.drop_subscriber(pid);
            return Ok(SendOutcome::SubscriberGone);
        }

        let max = self.max_payload();
        if body.len() > max {
            return Err(ProxyError::MessageTooLarge { len: body.len(), max });
        }

        let mut buf = match self.pool.acquire() {
            Ok(buf) => buf,
            Err(e) if e.is_soft() => return Ok(SendOutcome::Dropped),
            Err(e) => return Err(e),
        };

        let len = HEADER_LEN + body.len();
        let header = FrameHeader {
            len: len as u32,
            kind: MSG_DONE,
            flags: 0,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            pid: 0,
        };
        header.encode(&mut buf)?;
        buf[HEADER_LEN..len].copy_from_slice(body);

        match transport.unicast(pid, &buf[..len]) {
            Ok(()) => {
                trace!(pid, len, "Delivered notification");
                Ok(SendOutcome::Delivered)
            }
            Err(e) => {
                error!(pid, error = %e, "Error sending to subscriber, connection is closed");
                self.drop_subscriber(pid);
                Ok(SendOutcome::DeliveryFailed)
            }
        }
    }
}

/// In-process transport that records every frame it is given.
#[derive(Default)]
pub struct MemoryTransport {
    frames: Mutex<Vec<(u32, Vec<u8>)>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following unicast fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Frames delivered so far, with their destination PID.
    pub fn frames(&self) -> Vec<(u32, Vec<u8>)> {
        self.frames.lock().clone()
    }

    /// Payloads delivered so far.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .iter()
            .filter_map(|(_, f)| FrameHeader::decode(f).ok().map(|(_, p)| p.to_vec()))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for MemoryTransport {
    fn unicast(&self, pid: u32, frame: &[u8]) -> std::io::Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        }
        self.frames.lock().push((pid, frame.to_vec()));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Probe backed by an explicit set of live PIDs.
#[derive(Default)]
pub struct FixedProbe {
    alive: Mutex<HashSet<u32>>,
}

impl FixedProbe {
    pub fn new(pids: impl IntoIterator<Item = u32>) -> Self {
        Self { alive: Mutex::new(pids.into_iter().collect()) }
    }

    pub fn spawn(&self, pid: u32) {
        self.alive.lock().insert(pid);
    }

    pub fn kill(&self, pid: u32) {
        self.alive.lock().remove(&pid);
    }
}

impl ProcessProbe for FixedProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn channel(probe: Arc<FixedProbe>) -> (NotificationChannel, Arc<MemoryTransport>) {
        let channel = NotificationChannel::new(DEFAULT_UNIT_ID, BufferPool::new(4, 64).unwrap(), probe);
        let transport = Arc::new(MemoryTransport::new());
        channel.open(transport.clone());
        (channel, transport)
    }

    #[test]
    fn test_header_encoding() {
        let header = FrameHeader { len: 21, kind: MSG_DONE, flags: 2, seq: 7, pid: 100 };
        let mut buf = [0u8; HEADER_LEN + 5];
        header.encode(&mut buf).unwrap();
        buf[HEADER_LEN..].copy_from_slice(b"hello");

        assert_eq!(&buf[..4], &21u32.to_le_bytes());
        assert_eq!(&buf[4..6], &3u16.to_le_bytes());
        let (decoded, payload) = FrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"hello");

        assert!(FrameHeader::decode(&buf[..8]).is_err());
    }

    #[test]
    fn test_register_swaps_subscriber() {
        let (channel, _) = channel(Arc::new(FixedProbe::default()));
        assert_eq!(channel.register_subscriber(100), 0);
        assert_eq!(channel.register_subscriber(200), 100);
        assert_eq!(channel.subscriber(), Some(200));
    }

    #[test]
    fn test_registration_frame() {
        let (channel, _) = channel(Arc::new(FixedProbe::default()));
        let frame = registration_frame(4242, b"hello from monitor\0");
        assert_eq!(channel.handle_registration(&frame).unwrap(), 0);
        assert_eq!(channel.subscriber(), Some(4242));
    }

    #[test]
    fn test_dead_subscriber_is_cleared() {
        let probe = Arc::new(FixedProbe::new([100]));
        let (channel, transport) = channel(probe.clone());
        channel.register_subscriber(100);

        assert_eq!(channel.send(b"first").unwrap(), SendOutcome::Delivered);
        assert_eq!(transport.frames()[0].0, 100);
        assert_eq!(transport.payloads(), vec![b"first".to_vec()]);

        probe.kill(100);
        assert_eq!(channel.send(b"second").unwrap(), SendOutcome::SubscriberGone);
        assert_eq!(channel.subscriber(), None);
        assert_eq!(channel.send(b"third").unwrap(), SendOutcome::NoSubscriber);
        assert_eq!(transport.frames().len(), 1);

        probe.spawn(300);
        channel.register_subscriber(300);
        assert_eq!(channel.send(b"fourth").unwrap(), SendOutcome::Delivered);
    }

    #[test]
    fn test_delivery_failure_clears_subscriber() {
        let (channel, transport) = channel(Arc::new(FixedProbe::new([7])));
        channel.register_subscriber(7);
        transport.set_failing(true);

        assert_eq!(channel.send(b"x").unwrap(), SendOutcome::DeliveryFailed);
        assert_eq!(channel.subscriber(), None);
        // The frame's buffer went back to the pool.
        assert_eq!(channel.pool().stats().unwrap().in_use, 0);
    }

    #[test]
    fn test_send_without_endpoint() {
        let channel = NotificationChannel::new(
            DEFAULT_UNIT_ID,
            BufferPool::new(1, 32).unwrap(),
            Arc::new(FixedProbe::new([1])),
        );
        channel.register_subscriber(1);
        assert_eq!(channel.send(b"x").unwrap(), SendOutcome::NoEndpoint);

        let transport = Arc::new(MemoryTransport::new());
        channel.open(transport.clone());
        assert!(channel.close());
        assert!(transport.is_closed());
        assert!(!channel.close());
    }

    #[test]
    fn test_oversized_message() {
        let (channel, _) = channel(Arc::new(FixedProbe::new([1])));
        channel.register_subscriber(1);
        let body = vec![b'a'; 64];
        assert!(matches!(
            channel.send(&body),
            Err(ProxyError::MessageTooLarge { len: 64, max: 48 })
        ));
        assert_eq!(channel.send(&body[..48]).unwrap(), SendOutcome::Delivered);
    }

    #[test]
    fn test_concurrent_senders() {
        let (channel, transport) = channel(Arc::new(FixedProbe::new([9])));
        channel.register_subscriber(9);
        let channel = Arc::new(channel);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    (0..25)
                        .filter(|i| {
                            let msg = format!("{t}-{i}");
                            channel.send(msg.as_bytes()).unwrap().is_delivered()
                        })
                        .count()
                })
            })
            .collect();
        let delivered: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(delivered, transport.frames().len());
        assert_eq!(channel.pool().stats().unwrap().in_use, 0);
    }
}
