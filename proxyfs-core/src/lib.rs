//! # ProxyFS Core
//!
//! The core library for ProxyFS - a stackable passthrough filesystem that
//! mirrors a lower filesystem and forwards every operation to it.
//!
//! ## Overview
//!
//! A proxy volume is mounted over a path of a lower filesystem. Every proxy
//! object (entry, node, handle) is bound to exactly one lower object, and
//! every operation the host issues against the proxy is translated to the
//! bound lower objects and forwarded. Results and errors come back
//! unchanged; where the lower filesystem lacks an operation, a fixed
//! per-operation fallback decides the reply.
//!
//! Alongside the forwarding layer, a notification channel lets one
//! registered monitoring process receive a JSON event for selected
//! activity, using a preallocated pool of message buffers.
//!
//! ## Basic Usage
//!
//! ```rust
//! use proxyfs_core::memfs::MemFs;
//! use proxyfs_core::types::{Credentials, OpenFlags};
//! use proxyfs_core::volume::{MountOptions, ProxyFs};
//! use std::ffi::OsStr;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let lower = MemFs::new();
//! lower.add_file("/hello.txt", b"hello");
//!
//! let fs = ProxyFs::mount(Arc::new(lower), Path::new("/"), MountOptions::default()).unwrap();
//! let (entry, attr) = fs.lookup(fs.root_id(), OsStr::new("hello.txt")).unwrap();
//! assert_eq!(attr.size, 5);
//!
//! let node = entry.node().unwrap();
//! let handle = fs.open(node.id(), OpenFlags::READ, &Credentials::current()).unwrap();
//! let mut buf = [0u8; 16];
//! let n = fs.read(handle.id(), 0, &mut buf).unwrap();
//! assert_eq!(&buf[..n], b"hello");
//! fs.release(handle.id()).unwrap();
//! ```
//!
//! ## Architecture
//!
//! - [`lower`]: The interface a lower filesystem implements
//! - [`node`], [`entry`], [`handle`]: The proxy object graph
//! - [`delegate`]: Forwarding of every operation, with fallbacks
//! - [`volume`]: Mounting and the volume-wide state
//! - [`pool`], [`channel`], [`event`]: Monitor notifications
//! - [`context`], [`diag`], [`config`]: Service lifecycle, diagnostics and settings
//! - [`stats`]: Operation counters
//! - [`memfs`]: An in-memory lower filesystem
//!
//! ## Platform Support
//!
//! Host integration lives in separate crates:
//!
//! - `proxyfs-linux`: directory-backed lower filesystem, FUSE bridge and
//!   Unix socket notification transport
//! - `proxyfs-cli`: the `proxyfs` command

pub mod channel;
pub mod config;
pub mod context;
pub mod delegate;
pub mod diag;
pub mod entry;
pub mod error;
pub mod event;
pub mod handle;
pub mod lower;
pub mod memfs;
pub mod node;
pub mod pool;
pub mod stats;
pub mod types;
pub mod volume;

pub use error::{ProxyError, Result};
pub use volume::{MountOptions, ProxyFs};
