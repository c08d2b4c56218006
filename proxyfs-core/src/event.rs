//! Filesystem activity reported to the monitoring process.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Kinds of activity that produce a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Open,
    Create,
    Mkdir,
    Mknod,
    Symlink,
    Link,
    Unlink,
    Rmdir,
    Rename,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Open,
        EventKind::Create,
        EventKind::Mkdir,
        EventKind::Mknod,
        EventKind::Symlink,
        EventKind::Link,
        EventKind::Unlink,
        EventKind::Rmdir,
        EventKind::Rename,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::Create => "create",
            EventKind::Mkdir => "mkdir",
            EventKind::Mknod => "mknod",
            EventKind::Symlink => "symlink",
            EventKind::Link => "link",
            EventKind::Unlink => "unlink",
            EventKind::Rmdir => "rmdir",
            EventKind::Rename => "rename",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown event kind: {}", s))
    }
}

/// One notification, sent as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEvent {
    pub op: EventKind,
    pub ino: NodeId,
    /// Path of the affected entry relative to the volume root
    pub name: String,
    /// Process that issued the operation
    pub pid: u32,
}

impl FsEvent {
    pub fn new(op: EventKind, ino: NodeId, name: impl Into<String>, pid: u32) -> Self {
        Self { op, ino, name: name.into(), pid }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = FsEvent::new(EventKind::Mkdir, NodeId::new(12), "/docs", 4321);
        let json = String::from_utf8(event.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"op":"mkdir","ino":12,"name":"/docs","pid":4321}"#);
        assert_eq!(FsEvent::from_json(json.as_bytes()).unwrap(), event);
    }

    #[test]
    fn test_event_kind_from_str() {
        assert_eq!("RENAME".parse::<EventKind>(), Ok(EventKind::Rename));
        assert!("chmod".parse::<EventKind>().is_err());
    }
}
