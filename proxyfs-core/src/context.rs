//! Service context: lifecycle state and the notification channel.
//!
//! There is no process-wide instance. The host constructs a context, starts
//! it, hands it to every mounted volume, and stops it on shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::channel::{NotificationChannel, ProcessProbe, SendOutcome, Transport};
use crate::config::NotifyConfig;
use crate::diag::Diagnostics;
use crate::error::{ProxyError, Result};
use crate::event::FsEvent;
use crate::pool::BufferPool;

pub struct ProxyContext {
    notify: NotifyConfig,
    running: AtomicBool,
    handlers: AtomicU64,
    channel: NotificationChannel,
}

impl ProxyContext {
    /// Creates a stopped context. The buffer pool is allocated only when
    /// notifications are enabled.
    pub fn new(notify: NotifyConfig, probe: Arc<dyn ProcessProbe>) -> Result<Self> {
        let pool = if notify.enabled {
            BufferPool::new(notify.pool_count, notify.pool_size)?
        } else {
            BufferPool::uninitialized()
        };
        let channel = NotificationChannel::new(notify.unit_id, pool, probe);
        Ok(Self {
            notify,
            running: AtomicBool::new(false),
            handlers: AtomicU64::new(0),
            channel,
        })
    }

    /// Marks the context running and opens the channel endpoint, if any.
    /// A pool freed by an earlier stop is allocated again.
    pub fn start(&self, transport: Option<Arc<dyn Transport>>) {
        if self.notify.enabled {
            if let Err(e) = self.channel.pool().init(self.notify.pool_count, self.notify.pool_size) {
                warn!(error = %e, "Failed to allocate notification buffers");
            }
        }
        if let Some(transport) = transport {
            if self.notify.enabled {
                self.channel.open(transport);
            }
        }
        self.running.store(true, Ordering::Release);
        info!(unit_id = self.notify.unit_id, "ProxyFS context started");
    }

    /// Stops accepting operations, closes the endpoint and frees the pool.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let in_flight = self.active_handlers();
        if in_flight > 0 {
            warn!(in_flight, "Stopping with operations still in flight");
        }
        self.channel.close();
        self.channel.pool().destroy();
        info!("ProxyFS context stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Counts an operation in flight until the guard drops.
    pub fn enter(&self) -> Result<HandlerGuard<'_>> {
        if !self.is_running() {
            return Err(ProxyError::NotRunning);
        }
        self.handlers.fetch_add(1, Ordering::AcqRel);
        Ok(HandlerGuard { ctx: self })
    }

    pub fn active_handlers(&self) -> u64 {
        self.handlers.load(Ordering::Acquire)
    }

    /// Whether messages from `uid` are accepted on the channel.
    pub fn check_uid(&self, _uid: u32) -> bool {
        true
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }

    pub fn notify_config(&self) -> &NotifyConfig {
        &self.notify
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(self.notify.unit_id)
    }

    /// Reports `event` to the subscriber. Returns `None` when the event
    /// kind is filtered out. Never fails: problems are logged and reported
    /// as a dropped event.
    pub fn notify(&self, event: &FsEvent) -> Option<SendOutcome> {
        if !self.notify.enabled || !self.notify.wants(event.op) {
            return None;
        }
        let body = match event.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, op = %event.op, "Failed to encode notification");
                return Some(SendOutcome::Dropped);
            }
        };
        match self.channel.send(&body) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, op = %event.op, "Notification dropped");
                Some(SendOutcome::Dropped)
            }
        }
    }
}

/// An operation in flight.
pub struct HandlerGuard<'a> {
    ctx: &'a ProxyContext,
}

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.ctx.handlers.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FixedProbe, MemoryTransport};
    use crate::event::EventKind;
    use crate::types::NodeId;

    fn context(notify: NotifyConfig) -> (ProxyContext, Arc<MemoryTransport>) {
        let ctx = ProxyContext::new(notify, Arc::new(FixedProbe::new([55]))).unwrap();
        let transport = Arc::new(MemoryTransport::new());
        ctx.start(Some(transport.clone()));
        (ctx, transport)
    }

    #[test]
    fn test_lifecycle() {
        let (ctx, transport) = context(NotifyConfig::default());
        assert!(ctx.is_running());
        assert!(ctx.check_uid(1000));

        {
            let _a = ctx.enter().unwrap();
            let _b = ctx.enter().unwrap();
            assert_eq!(ctx.active_handlers(), 2);
        }
        assert_eq!(ctx.active_handlers(), 0);

        ctx.stop();
        assert!(!ctx.is_running());
        assert!(transport.is_closed());
        assert!(!ctx.channel().pool().is_initialized());
        assert!(matches!(ctx.enter(), Err(ProxyError::NotRunning)));
        ctx.stop();
    }

    #[test]
    fn test_restart_allocates_a_fresh_pool() {
        let (ctx, _) = context(NotifyConfig::default());
        ctx.stop();
        assert!(!ctx.channel().pool().is_initialized());

        let transport = Arc::new(MemoryTransport::new());
        ctx.start(Some(transport.clone()));
        assert!(ctx.channel().pool().is_initialized());
        ctx.channel().register_subscriber(55);

        let event = FsEvent::new(EventKind::Mkdir, NodeId::new(3), "/d", 1);
        assert_eq!(ctx.notify(&event), Some(SendOutcome::Delivered));
        assert_eq!(transport.frames().len(), 1);
    }

    #[test]
    fn test_notify_filters_events() {
        let notify = NotifyConfig { events: vec![EventKind::Unlink], ..NotifyConfig::default() };
        let (ctx, transport) = context(notify);
        ctx.channel().register_subscriber(55);

        let open = FsEvent::new(EventKind::Open, NodeId::new(3), "/a", 1);
        assert_eq!(ctx.notify(&open), None);

        let unlink = FsEvent::new(EventKind::Unlink, NodeId::new(3), "/a", 1);
        assert_eq!(ctx.notify(&unlink), Some(SendOutcome::Delivered));
        let payloads = transport.payloads();
        assert_eq!(FsEvent::from_json(&payloads[0]).unwrap(), unlink);
    }

    #[test]
    fn test_notify_oversized_event_is_dropped() {
        let notify = NotifyConfig { pool_size: 32, ..NotifyConfig::default() };
        let (ctx, transport) = context(notify);
        ctx.channel().register_subscriber(55);

        let event = FsEvent::new(EventKind::Create, NodeId::new(3), "x".repeat(100), 1);
        assert_eq!(ctx.notify(&event), Some(SendOutcome::Dropped));
        assert!(transport.frames().is_empty());
    }

    #[test]
    fn test_disabled_notifications() {
        let notify = NotifyConfig { enabled: false, ..NotifyConfig::default() };
        let (ctx, _) = context(notify);
        assert!(!ctx.channel().is_open());
        assert!(!ctx.channel().pool().is_initialized());
        let event = FsEvent::new(EventKind::Open, NodeId::new(1), "/", 1);
        assert_eq!(ctx.notify(&event), None);
    }
}
