//! End-to-end forwarding over the in-memory lower filesystem.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;

use proxyfs_core::delegate::InvalidateOutcome;
use proxyfs_core::error::ProxyError;
use proxyfs_core::memfs::{MemFs, PAGE_SIZE};
use proxyfs_core::types::{Credentials, FileType, NodeId, OpenFlags, SetAttr, Whence};
use proxyfs_core::volume::{MountOptions, ProxyFs};

fn mount(lower: &MemFs) -> ProxyFs {
    ProxyFs::mount(Arc::new(lower.clone()), Path::new("/"), MountOptions::default()).unwrap()
}

fn creds() -> Credentials {
    Credentials::new(0, 0, 4242)
}

fn id_of(fs: &ProxyFs, parent: NodeId, name: &str) -> NodeId {
    let (entry, _) = fs.lookup(parent, OsStr::new(name)).unwrap();
    entry.node().unwrap().id()
}

#[test]
fn test_resolved_node_mirrors_lower_identifier() {
    let lower = MemFs::new();
    let dir_ino = lower.add_dir("/docs");
    let file_ino = lower.add_file("/docs/readme", b"proxy");
    let fs = mount(&lower);

    let docs = id_of(&fs, fs.root_id(), "docs");
    assert_eq!(docs.get(), dir_ino);

    let (entry, attr) = fs.lookup(docs, OsStr::new("readme")).unwrap();
    assert_eq!(entry.node().unwrap().id().get(), file_ino);
    assert_eq!(attr.ino.get(), file_ino);
    assert_eq!(attr.kind, FileType::File);
    assert_eq!(attr.size, 5);
    assert_eq!(entry.path(), Path::new("/docs/readme"));
}

#[test]
fn test_lookup_missing_name() {
    let lower = MemFs::new();
    let fs = mount(&lower);

    let err = fs.lookup(fs.root_id(), OsStr::new("missing")).unwrap_err();
    assert!(matches!(err, ProxyError::NotFound { .. }));
    assert_eq!(err.errno(), libc::ENOENT);
}

#[test]
fn test_placeholder_allocation_failure_leaves_no_reference() {
    let lower = MemFs::new();
    let fs = mount(&lower);
    let dentries = lower.live_dentries();
    let inodes = lower.live_inode_refs();

    lower.fail_allocations(true);
    let err = fs.lookup(fs.root_id(), OsStr::new("missing")).unwrap_err();
    assert!(matches!(err, ProxyError::AllocationFailure { .. }));
    assert_eq!(err.errno(), libc::ENOMEM);

    assert_eq!(lower.live_dentries(), dentries);
    assert_eq!(lower.live_inode_refs(), inodes);
}

#[test]
fn test_open_close_releases_lower_handle_once() {
    let lower = MemFs::new();
    lower.add_file("/f", b"hello world");
    let fs = mount(&lower);
    let id = id_of(&fs, fs.root_id(), "f");

    let handle = fs.open(id, OpenFlags::READ, &creds()).unwrap();
    assert_eq!(lower.live_files(), 1);

    let mut buf = [0u8; 5];
    assert_eq!(fs.read(handle.id(), 6, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"world");
    assert_eq!(fs.llseek(handle.id(), 0, Whence::End).unwrap(), 11);

    let fh = handle.id();
    drop(handle);
    fs.release(fh).unwrap();
    assert_eq!(lower.live_files(), 0);
    assert_eq!(lower.files_released(), 1);

    let err = fs.release(fh).unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);
    assert_eq!(lower.files_released(), 1);
}

#[test]
fn test_write_reaches_lower_file() {
    let lower = MemFs::new();
    lower.add_file("/log", b"one");
    let fs = mount(&lower);
    let id = id_of(&fs, fs.root_id(), "log");

    let handle = fs.open(id, OpenFlags::WRITE | OpenFlags::APPEND, &creds()).unwrap();
    assert_eq!(fs.write(handle.id(), 0, b",two").unwrap(), 4);
    fs.flush(handle.id(), 0).unwrap();
    fs.fsync(handle.id(), 0, u64::MAX, false).unwrap();
    fs.release(handle.id()).unwrap();

    assert_eq!(lower.read_path("/log").unwrap(), b"one,two");
    assert_eq!(fs.getattr(id).unwrap().size, 7);
    assert_eq!(fs.stats().bytes_written.load(Ordering::Relaxed), 4);
}

#[test]
fn test_structural_operations() {
    let lower = MemFs::new();
    let fs = mount(&lower);
    let root = fs.root_id();

    let (docs, attr) = fs.mkdir(root, OsStr::new("docs"), 0o750, &creds()).unwrap();
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.perm, 0o750);
    let docs = docs.node().unwrap().id();

    let (file, _) = fs.create(docs, OsStr::new("a"), 0o644, true, &creds()).unwrap();
    let file = file.node().unwrap().id();
    assert!(lower.exists("/docs/a"));

    let err = fs.create(docs, OsStr::new("a"), 0o644, true, &creds()).unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);

    let (_, linked) = fs.link(file, root, OsStr::new("b"), &creds()).unwrap();
    assert_eq!(linked.ino, file);
    assert_eq!(linked.nlink, 2);

    let (link, _) = fs.symlink(root, OsStr::new("to-a"), Path::new("docs/a"), &creds()).unwrap();
    assert_eq!(fs.readlink(link.node().unwrap().id()).unwrap(), Path::new("docs/a"));

    let mode = FileType::Fifo.mode_bits() | 0o600;
    let (_, fifo) = fs.mknod(root, OsStr::new("pipe"), mode, 0, &creds()).unwrap();
    assert_eq!(fifo.kind, FileType::Fifo);

    fs.rename(docs, OsStr::new("a"), root, OsStr::new("c"), 0, &creds()).unwrap();
    assert!(!lower.exists("/docs/a"));
    assert!(lower.exists("/c"));
    assert_eq!(id_of(&fs, root, "c"), file);

    let err = fs.rmdir(root, OsStr::new("c"), &creds()).unwrap_err();
    assert_eq!(err.errno(), libc::ENOTDIR);

    fs.unlink(root, OsStr::new("b"), &creds()).unwrap();
    fs.unlink(root, OsStr::new("c"), &creds()).unwrap();
    fs.rmdir(root, OsStr::new("docs"), &creds()).unwrap();
    assert!(!lower.exists("/docs"));
    assert!(fs.lookup(root, OsStr::new("docs")).is_err());
}

#[test]
fn test_node_outlives_unlinked_hard_link() {
    let lower = MemFs::new();
    lower.add_file("/a", b"data");
    let fs = mount(&lower);
    let root = fs.root_id();
    let id = id_of(&fs, root, "a");

    fs.link(id, root, OsStr::new("b"), &creds()).unwrap();
    fs.unlink(root, OsStr::new("b"), &creds()).unwrap();
    assert!(fs.root().child(OsStr::new("a")).is_some());

    assert_eq!(fs.getattr(id).unwrap().nlink, 1);
    let handle = fs.open(id, OpenFlags::READ, &creds()).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read(handle.id(), 0, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"data");
    fs.release(handle.id()).unwrap();
}

#[test]
fn test_renamed_nodes_stay_addressable() {
    let lower = MemFs::new();
    lower.add_file("/a", b"x");
    lower.add_dir("/d");
    lower.add_file("/d/f", b"inner");
    let fs = mount(&lower);
    let root = fs.root_id();
    let a = id_of(&fs, root, "a");
    let d = id_of(&fs, root, "d");
    let f = id_of(&fs, d, "f");

    fs.rename(root, OsStr::new("a"), root, OsStr::new("c"), 0, &creds()).unwrap();
    assert_eq!(fs.getattr(a).unwrap().ino, a);
    let moved = fs.root().child(OsStr::new("c")).unwrap();
    assert_eq!(moved.node().unwrap().id(), a);
    assert_eq!(moved.path(), Path::new("/c"));

    fs.rename(root, OsStr::new("d"), root, OsStr::new("e"), 0, &creds()).unwrap();
    assert_eq!(fs.getattr(d).unwrap().kind, FileType::Directory);
    assert_eq!(fs.getattr(f).unwrap().size, 5);
    let inner = fs.root().child(OsStr::new("e")).unwrap().child(OsStr::new("f")).unwrap();
    assert_eq!(inner.path(), Path::new("/e/f"));

    let handle = fs.open(f, OpenFlags::READ, &creds()).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(handle.id(), 0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"inner");
    fs.release(handle.id()).unwrap();
    assert_eq!(fs.nodes().len(), 4);
}

#[test]
fn test_rmdir_non_empty() {
    let lower = MemFs::new();
    lower.add_dir("/d");
    lower.add_file("/d/f", b"");
    let fs = mount(&lower);
    id_of(&fs, fs.root_id(), "d");

    let err = fs.rmdir(fs.root_id(), OsStr::new("d"), &creds()).unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    assert!(lower.exists("/d/f"));
}

#[test]
fn test_setattr_truncates() {
    let lower = MemFs::new();
    lower.add_file("/f", b"0123456789");
    let fs = mount(&lower);
    let id = id_of(&fs, fs.root_id(), "f");

    let changes = SetAttr { size: Some(4), mode: Some(0o600), ..Default::default() };
    let attr = fs.setattr(id, &changes).unwrap();
    assert_eq!(attr.size, 4);
    assert_eq!(attr.perm, 0o600);
    assert_eq!(lower.read_path("/f").unwrap(), b"0123");
}

#[test]
fn test_xattrs() {
    let lower = MemFs::new();
    lower.add_file("/f", b"");
    let fs = mount(&lower);
    let id = id_of(&fs, fs.root_id(), "f");

    fs.setxattr(id, OsStr::new("user.tag"), b"blue", 0).unwrap();
    assert_eq!(fs.getxattr(id, OsStr::new("user.tag")).unwrap(), b"blue");
    assert_eq!(fs.listxattr(id).unwrap(), vec![OsStr::new("user.tag").to_os_string()]);

    fs.removexattr(id, OsStr::new("user.tag")).unwrap();
    let err = fs.getxattr(id, OsStr::new("user.tag")).unwrap_err();
    assert_eq!(err.errno(), libc::ENODATA);
}

#[test]
fn test_create_and_open_without_atomic_open() {
    let lower = MemFs::new();
    let fs = mount(&lower);

    let err = fs
        .atomic_open(fs.root_id(), OsStr::new("new"), OpenFlags::READ_WRITE, 0o644, &creds())
        .unwrap_err();
    assert!(matches!(err, ProxyError::NotPossible { .. }));
    assert!(!lower.exists("/new"));

    let (entry, attr, handle) = fs
        .create_and_open(fs.root_id(), OsStr::new("new"), 0o644, OpenFlags::READ_WRITE, &creds())
        .unwrap();
    assert_eq!(attr.size, 0);
    assert_eq!(handle.node().id(), entry.node().unwrap().id());
    fs.write(handle.id(), 0, b"fresh").unwrap();
    fs.release(handle.id()).unwrap();
    assert_eq!(lower.read_path("/new").unwrap(), b"fresh");
}

#[test]
fn test_tmpfile_has_no_entry() {
    let lower = MemFs::new();
    let fs = mount(&lower);

    let handle = fs.tmpfile(fs.root_id(), 0o600, OpenFlags::READ_WRITE, &creds()).unwrap();
    assert!(handle.entry().is_none());
    fs.write(handle.id(), 0, b"scratch").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(handle.id(), 0, &mut buf).unwrap(), 7);

    let fh = handle.id();
    drop(handle);
    fs.release(fh).unwrap();
    assert_eq!(lower.live_files(), 0);

    lower.add_file("/plain", b"");
    let plain = id_of(&fs, fs.root_id(), "plain");
    let err = fs.tmpfile(plain, 0o600, OpenFlags::READ_WRITE, &creds()).unwrap_err();
    assert_eq!(err.errno(), libc::ENOTDIR);
}

#[test]
fn test_readdir_lists_lower_children() {
    let lower = MemFs::new();
    lower.add_dir("/b");
    lower.add_file("/a", b"");
    let fs = mount(&lower);

    let handle = fs.open(fs.root_id(), OpenFlags::READ | OpenFlags::DIRECTORY, &creds()).unwrap();
    let entries = fs.readdir(handle.id(), 0).unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec![".", "..", "a", "b"]);
    assert_eq!(entries[3].kind, FileType::Directory);

    let rest = fs.readdir(handle.id(), entries[2].offset).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name, "b");
    fs.release(handle.id()).unwrap();
}

#[test]
fn test_missing_capabilities_fall_back() {
    let lower = MemFs::new();
    let ino = lower.add_file("/f", b"data");
    let fs = mount(&lower);
    let id = id_of(&fs, fs.root_id(), "f");
    let handle = fs.open(id, OpenFlags::READ_WRITE, &creds()).unwrap();

    // No-op success.
    fs.check_flags(handle.id(), OpenFlags::READ).unwrap();
    fs.fadvise(handle.id(), 0, 0, 0).unwrap();
    fs.write_node(id, true).unwrap();
    fs.freeze_fs().unwrap();
    fs.unfreeze_fs().unwrap();
    fs.shutdown().unwrap();

    // Optional capabilities.
    assert_eq!(fs.fileattr_get(id).unwrap_err().errno(), libc::EOPNOTSUPP);
    assert_eq!(fs.quota_read(0, 0, 16).unwrap_err().errno(), libc::EOPNOTSUPP);
    assert_eq!(fs.bmap(id, 0).unwrap_err().errno(), libc::EOPNOTSUPP);
    assert_eq!(fs.setlease(handle.id(), 0).unwrap_err().errno(), libc::EOPNOTSUPP);

    // Required capabilities.
    assert_eq!(fs.fiemap(id, 0, 4).unwrap_err().errno(), libc::ENOSYS);
    assert_eq!(fs.flock(handle.id(), libc::LOCK_EX).unwrap_err().errno(), libc::ENOSYS);
    assert_eq!(fs.llseek(handle.id(), 0, Whence::Data).unwrap_err().errno(), libc::ENOSYS);

    assert_eq!(fs.ioctl(handle.id(), 0x5401, &[]).unwrap_err().errno(), libc::ENOTTY);

    // Capabilities the lower filesystem has.
    fs.sync_fs(true).unwrap();
    assert!(fs.statfs().unwrap().bsize > 0);
    assert_eq!(fs.readahead(id, 0, 4).unwrap(), 1);
    assert_eq!(lower.cached_pages(ino), 1);

    // A directory has no page mapping.
    assert_eq!(fs.readahead(fs.root_id(), 0, 4).unwrap_err().errno(), libc::EOPNOTSUPP);
    fs.invalidate_pages(fs.root_id(), 0, None).unwrap();

    fs.release(handle.id()).unwrap();
}

#[test]
fn test_invalidation_is_deferred_while_open() {
    let lower = MemFs::new();
    let ino = lower.add_file("/f", &vec![1u8; PAGE_SIZE * 2]);
    let fs = mount(&lower);
    let id = id_of(&fs, fs.root_id(), "f");

    let handle = fs.open(id, OpenFlags::READ, &creds()).unwrap();
    fs.readahead(id, 0, 2).unwrap();
    assert_eq!(lower.cached_pages(ino), 2);

    let outcome = fs.invalidate(fs.root_id(), OsStr::new("f")).unwrap();
    assert_eq!(outcome, InvalidateOutcome::Deferred);
    assert_eq!(lower.cached_pages(ino), 2);
    assert!(fs.root().child(OsStr::new("f")).is_some());

    fs.release(handle.id()).unwrap();
    drop(handle);
    let outcome = fs.invalidate(fs.root_id(), OsStr::new("f")).unwrap();
    assert_eq!(outcome, InvalidateOutcome::Invalidated);
    assert_eq!(lower.cached_pages(ino), 0);
    assert!(fs.root().child(OsStr::new("f")).is_none());

    let outcome = fs.invalidate(fs.root_id(), OsStr::new("f")).unwrap();
    assert_eq!(outcome, InvalidateOutcome::NotCached);
}

#[test]
fn test_root_entry_is_never_invalidated() {
    let lower = MemFs::new();
    lower.add_file("/f", b"");
    let fs = mount(&lower);

    let root = Arc::clone(fs.root());
    assert_eq!(fs.invalidate_entry(&root).unwrap(), InvalidateOutcome::Deferred);
    assert!(!root.is_pruned());
    assert!(root.lower().is_ok());
    id_of(&fs, fs.root_id(), "f");
}

#[test]
fn test_lower_change_behind_the_proxy() {
    let lower = MemFs::new();
    lower.add_file("/f", b"");
    let fs = mount(&lower);
    let (entry, _) = fs.lookup(fs.root_id(), OsStr::new("f")).unwrap();
    assert!(entry.revalidate(0).unwrap());

    lower.remove_path("/f");
    assert!(!entry.revalidate(0).unwrap());
}

#[test]
fn test_concurrent_lookups_share_one_node() {
    let lower = MemFs::new();
    let ino = lower.add_file("/shared", b"");
    let fs = Arc::new(mount(&lower));
    let barrier = Arc::new(Barrier::new(4));

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let (entry, _) = fs.lookup(fs.root_id(), OsStr::new("shared")).unwrap();
                entry.node().unwrap().id()
            })
        })
        .collect();

    for t in threads {
        assert_eq!(t.join().unwrap().get(), ino);
    }
    assert_eq!(fs.nodes().len(), 2);
}

#[test]
fn test_unmount_closes_open_handles() {
    let lower = MemFs::new();
    lower.add_file("/a", b"");
    lower.add_file("/b", b"");
    let fs = mount(&lower);
    let a = id_of(&fs, fs.root_id(), "a");
    let b = id_of(&fs, fs.root_id(), "b");

    fs.open(a, OpenFlags::READ, &creds()).unwrap();
    fs.open(b, OpenFlags::READ, &creds()).unwrap();
    assert_eq!(lower.live_files(), 2);
    assert_eq!(fs.stats().active_handles.load(Ordering::Relaxed), 2);

    let report = fs.unmount();
    assert_eq!(report.handles_closed, 2);
    assert_eq!(report.nodes_released, 3);
    assert_eq!(lower.live_files(), 0);
    assert_eq!(fs.stats().active_handles.load(Ordering::Relaxed), 0);
    assert!(fs.show_stats().contains("open handles: 0"));
}
