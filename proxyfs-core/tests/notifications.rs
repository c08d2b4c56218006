//! Activity notifications emitted by a mounted volume.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use proxyfs_core::channel::{
    FixedProbe, FrameHeader, MemoryTransport, SendOutcome, HEADER_LEN, MSG_DONE,
};
use proxyfs_core::config::NotifyConfig;
use proxyfs_core::context::ProxyContext;
use proxyfs_core::error::ProxyError;
use proxyfs_core::event::{EventKind, FsEvent};
use proxyfs_core::memfs::MemFs;
use proxyfs_core::types::{Credentials, OpenFlags};
use proxyfs_core::volume::{MountOptions, ProxyFs};

const MONITOR: u32 = 777;

struct Harness {
    lower: MemFs,
    fs: ProxyFs,
    context: Arc<ProxyContext>,
    transport: Arc<MemoryTransport>,
    probe: Arc<FixedProbe>,
}

impl Harness {
    fn new(notify: NotifyConfig) -> Self {
        let lower = MemFs::new();
        let probe = Arc::new(FixedProbe::new([MONITOR]));
        let context = Arc::new(ProxyContext::new(notify, probe.clone()).unwrap());
        let transport = Arc::new(MemoryTransport::new());
        context.start(Some(transport.clone()));
        context.channel().register_subscriber(MONITOR);

        let fs = ProxyFs::mount(Arc::new(lower.clone()), Path::new("/"), MountOptions::default())
            .unwrap()
            .with_context(Arc::clone(&context));
        Self { lower, fs, context, transport, probe }
    }

    fn events(&self) -> Vec<FsEvent> {
        self.transport
            .payloads()
            .iter()
            .map(|p| FsEvent::from_json(p).unwrap())
            .collect()
    }

    fn sent(&self) -> u64 {
        self.fs.stats().events_sent.load(Ordering::Relaxed)
    }

    fn dropped(&self) -> u64 {
        self.fs.stats().events_dropped.load(Ordering::Relaxed)
    }
}

fn creds() -> Credentials {
    Credentials::new(1000, 1000, 4242)
}

#[test]
fn test_activity_is_reported_to_the_monitor() {
    let h = Harness::new(NotifyConfig::default());
    let root = h.fs.root_id();

    let (dir, _) = h.fs.mkdir(root, OsStr::new("d"), 0o755, &creds()).unwrap();
    let dir = dir.node().unwrap().id();
    let (file, _) = h.fs.create(dir, OsStr::new("f"), 0o644, true, &creds()).unwrap();
    let file = file.node().unwrap().id();
    let handle = h.fs.open(file, OpenFlags::READ, &creds()).unwrap();
    h.fs.release(handle.id()).unwrap();
    drop(handle);
    h.fs.unlink(dir, OsStr::new("f"), &creds()).unwrap();

    let events = h.events();
    assert_eq!(
        events,
        vec![
            FsEvent::new(EventKind::Mkdir, dir, "/d", 4242),
            FsEvent::new(EventKind::Create, file, "/d/f", 4242),
            FsEvent::new(EventKind::Open, file, "/d/f", 4242),
            FsEvent::new(EventKind::Unlink, file, "/d/f", 4242),
        ]
    );
    assert_eq!(h.sent(), 4);

    let frames = h.transport.frames();
    assert!(frames.iter().all(|(pid, _)| *pid == MONITOR));
    let seqs: Vec<u32> = frames
        .iter()
        .map(|(_, frame)| {
            let (header, payload) = FrameHeader::decode(frame).unwrap();
            assert_eq!(header.kind, MSG_DONE);
            assert_eq!(header.len as usize, HEADER_LEN + payload.len());
            header.seq
        })
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
}

#[test]
fn test_wire_payload_is_plain_json() {
    let h = Harness::new(NotifyConfig::default());
    let (dir, _) = h.fs.mkdir(h.fs.root_id(), OsStr::new("docs"), 0o755, &creds()).unwrap();
    let ino = dir.node().unwrap().id().get();

    let payloads = h.transport.payloads();
    assert_eq!(payloads.len(), 1);
    let expected = format!(r#"{{"op":"mkdir","ino":{},"name":"/docs","pid":4242}}"#, ino);
    assert_eq!(payloads[0], expected.as_bytes());
}

#[test]
fn test_event_filter() {
    let notify = NotifyConfig { events: vec![EventKind::Unlink], ..NotifyConfig::default() };
    let h = Harness::new(notify);
    let root = h.fs.root_id();

    h.fs.create(root, OsStr::new("f"), 0o644, true, &creds()).unwrap();
    h.fs.unlink(root, OsStr::new("f"), &creds()).unwrap();

    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].op, EventKind::Unlink);
    assert_eq!(h.dropped(), 0);
}

#[test]
fn test_lookups_are_not_reported() {
    let h = Harness::new(NotifyConfig::default());
    h.lower.add_file("/quiet", b"");
    h.fs.lookup(h.fs.root_id(), OsStr::new("quiet")).unwrap();
    h.fs.lookup(h.fs.root_id(), OsStr::new("absent")).unwrap_err();
    assert!(h.transport.frames().is_empty());
}

#[test]
fn test_dead_monitor_is_forgotten() {
    let h = Harness::new(NotifyConfig::default());
    h.probe.kill(MONITOR);

    h.fs.mkdir(h.fs.root_id(), OsStr::new("d"), 0o755, &creds()).unwrap();
    assert!(h.lower.exists("/d"));
    assert_eq!(h.context.channel().subscriber(), None);
    assert!(h.transport.frames().is_empty());
    assert_eq!(h.dropped(), 1);

    h.fs.mkdir(h.fs.root_id(), OsStr::new("e"), 0o755, &creds()).unwrap();
    assert_eq!(h.context.channel().send(b"{}").unwrap(), SendOutcome::NoSubscriber);
    assert!(h.transport.frames().is_empty());
    assert_eq!(h.dropped(), 1);

    h.probe.spawn(MONITOR);
    h.context.channel().register_subscriber(MONITOR);
    h.fs.rmdir(h.fs.root_id(), OsStr::new("d"), &creds()).unwrap();
    assert_eq!(h.events().len(), 1);
    assert_eq!(h.sent(), 1);
}

#[test]
fn test_delivery_failure_does_not_fail_the_operation() {
    let h = Harness::new(NotifyConfig::default());
    h.transport.set_failing(true);

    h.fs.mkdir(h.fs.root_id(), OsStr::new("d"), 0o755, &creds()).unwrap();
    assert!(h.lower.exists("/d"));
    assert_eq!(h.context.channel().subscriber(), None);
    assert_eq!(h.dropped(), 1);
}

#[test]
fn test_oversized_event_is_dropped() {
    let notify = NotifyConfig { pool_count: 4, pool_size: 64, ..NotifyConfig::default() };
    let h = Harness::new(notify);
    let root = h.fs.root_id();

    h.fs.mkdir(root, OsStr::new("a"), 0o755, &creds()).unwrap();
    assert_eq!(h.sent(), 1);

    let long = "a-directory-name-that-does-not-fit-in-one-buffer";
    h.fs.mkdir(root, OsStr::new(long), 0o755, &creds()).unwrap();
    assert!(h.lower.exists(format!("/{}", long)));
    assert_eq!(h.dropped(), 1);
    assert_eq!(h.transport.frames().len(), 1);

    let stats = h.context.channel().pool().stats().unwrap();
    assert_eq!(stats.in_use, 0);
}

#[test]
fn test_concurrent_activity_with_one_buffer() {
    let notify = NotifyConfig { pool_count: 1, ..NotifyConfig::default() };
    let h = Arc::new(Harness::new(notify));
    let root = h.fs.root_id();

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let h = Arc::clone(&h);
            thread::spawn(move || {
                for j in 0..16 {
                    let name = format!("f-{}-{}", i, j);
                    h.fs.create(root, OsStr::new(&name), 0o644, true, &creds()).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(h.sent() + h.dropped(), 128);
    assert_eq!(h.transport.frames().len() as u64, h.sent());
    assert_eq!(h.context.channel().pool().stats().unwrap().in_use, 0);
}

#[test]
fn test_stopped_context_refuses_operations() {
    let h = Harness::new(NotifyConfig::default());
    h.lower.add_file("/f", b"");
    h.context.stop();

    assert!(h.transport.is_closed());
    assert!(!h.context.channel().pool().is_initialized());
    let err = h.fs.lookup(h.fs.root_id(), OsStr::new("f")).unwrap_err();
    assert!(matches!(err, ProxyError::NotRunning));
}

#[test]
fn test_disabled_notifications_leave_operations_untouched() {
    let notify = NotifyConfig { enabled: false, ..NotifyConfig::default() };
    let h = Harness::new(notify);

    h.fs.mkdir(h.fs.root_id(), OsStr::new("d"), 0o755, &creds()).unwrap();
    assert!(h.lower.exists("/d"));
    assert!(!h.context.channel().is_open());
    assert!(h.transport.frames().is_empty());
    assert_eq!(h.sent() + h.dropped(), 0);
}
