use std::ffi::OsString;
use std::fmt;
use std::time::SystemTime;
use serde::{Deserialize, Serialize};

/// Identifier of a filesystem object. Proxy nodes carry the identifier of the
/// lower node they are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an open proxy handle. Identifiers are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Creates a new HandleId with the given ID.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying handle ID.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({})", self.0)
    }
}

/// Represents the type of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Character device
    CharDevice,
    /// Block device
    BlockDevice,
    /// Named pipe
    Fifo,
    /// Unix domain socket
    Socket,
}

impl FileType {
    /// Derives the file type from the `S_IFMT` bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileType::Directory,
            m if m == libc::S_IFLNK as u32 => FileType::Symlink,
            m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
            m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
            m if m == libc::S_IFIFO as u32 => FileType::Fifo,
            m if m == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::File,
        }
    }

    /// Returns the `S_IFMT` bits for this type.
    pub fn mode_bits(&self) -> u32 {
        (match self {
            FileType::File => libc::S_IFREG,
            FileType::Directory => libc::S_IFDIR,
            FileType::Symlink => libc::S_IFLNK,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
            FileType::Fifo => libc::S_IFIFO,
            FileType::Socket => libc::S_IFSOCK,
        }) as u32
    }
}

/// Attributes of a filesystem object as reported by getattr.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAttr {
    pub ino: NodeId,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    /// Permission bits without the file type
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl NodeAttr {
    /// Creates attributes with zeroed counters and the current time.
    pub fn new(ino: NodeId, kind: FileType, perm: u16) -> Self {
        let now = SystemTime::now();
        Self {
            ino,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            kind,
            perm,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }
}

/// A time value for setattr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    /// Use the current time
    Now,
    /// Use a specific time
    At(SystemTime),
}

/// Attribute changes requested by setattr. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
}

impl SetAttr {
    /// Returns true if no change is requested.
    pub fn is_empty(&self) -> bool {
        *self == SetAttr::default()
    }
}

/// POSIX open flags as passed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(i32);

impl OpenFlags {
    /// Read-only access
    pub const READ: Self = Self(libc::O_RDONLY);
    /// Write-only access
    pub const WRITE: Self = Self(libc::O_WRONLY);
    /// Read and write access
    pub const READ_WRITE: Self = Self(libc::O_RDWR);
    /// Append mode flag
    pub const APPEND: Self = Self(libc::O_APPEND);
    /// Create file if it doesn't exist
    pub const CREATE: Self = Self(libc::O_CREAT);
    /// Truncate file to zero length
    pub const TRUNCATE: Self = Self(libc::O_TRUNC);
    /// Exclusive creation (fail if file exists)
    pub const EXCLUSIVE: Self = Self(libc::O_EXCL);
    /// Open a directory
    pub const DIRECTORY: Self = Self(libc::O_DIRECTORY);

    /// Creates flags from raw bits.
    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    /// Returns the raw value of the flags.
    pub const fn bits(&self) -> i32 {
        self.0
    }

    /// Returns true if all flags in `other` are set. Access mode flags are
    /// compared as a mode, not as bits.
    pub const fn contains(&self, other: Self) -> bool {
        if other.0 & libc::O_ACCMODE == other.0 {
            self.0 & libc::O_ACCMODE == other.0
        } else {
            self.0 & other.0 == other.0
        }
    }

    /// Returns true if the access mode allows reading.
    pub const fn is_readable(&self) -> bool {
        let mode = self.0 & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Returns true if the access mode allows writing.
    pub const fn is_writable(&self) -> bool {
        let mode = self.0 & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Identity of the client on whose behalf an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self { uid, gid, pid }
    }

    /// Credentials of the current process.
    pub fn current() -> Self {
        // SAFETY: getuid/getgid never fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self { uid, gid, pid: std::process::id() }
    }
}

/// Origin for a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
    Data,
    Hole,
}

impl Whence {
    /// Converts a raw `SEEK_*` constant.
    pub fn from_raw(whence: i32) -> Option<Self> {
        match whence {
            libc::SEEK_SET => Some(Whence::Set),
            libc::SEEK_CUR => Some(Whence::Current),
            libc::SEEK_END => Some(Whence::End),
            libc::SEEK_DATA => Some(Whence::Data),
            libc::SEEK_HOLE => Some(Whence::Hole),
            _ => None,
        }
    }
}

/// One entry produced by directory iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: NodeId,
    /// Position to resume iteration after this entry
    pub offset: i64,
    pub kind: FileType,
    pub name: OsString,
}

/// Volume statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Kind of POSIX ACL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclType {
    Access,
    Default,
}

/// A POSIX ACL in its extended attribute encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl(pub Vec<u8>);

/// Inode flags as exchanged by fileattr get/set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttrFlags {
    pub flags: u32,
    pub xflags: u32,
    pub extsize: u32,
    pub projid: u32,
}

/// A mapped extent reported by fiemap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
    pub flags: u32,
}

/// Byte-range lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    pub start: u64,
    pub end: u64,
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`
    pub typ: i32,
    pub pid: u32,
}

/// Memory mapping request forwarded to a lower handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub offset: u64,
    pub length: u64,
    pub prot: i32,
    pub flags: i32,
}

/// Index of a page in a node's page-mapping space.
pub type PageIndex = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_id_display() {
        let handle = HandleId::new(12345);
        assert_eq!(format!("{}", handle), "HandleId(12345)");
        assert_eq!(handle.get(), 12345);
    }

    #[test]
    fn test_file_type_mode_round_trip() {
        for kind in [FileType::File, FileType::Directory, FileType::Symlink, FileType::Fifo] {
            assert_eq!(FileType::from_mode(kind.mode_bits() | 0o644), kind);
        }
    }

    #[test]
    fn test_open_flags_access_mode() {
        let flags = OpenFlags::READ_WRITE | OpenFlags::APPEND;
        assert!(flags.is_readable());
        assert!(flags.is_writable());
        assert!(flags.contains(OpenFlags::APPEND));
        assert!(flags.contains(OpenFlags::READ_WRITE));
        assert!(!flags.contains(OpenFlags::WRITE));

        let ro = OpenFlags::READ;
        assert!(ro.is_readable());
        assert!(!ro.is_writable());
        assert!(!ro.contains(OpenFlags::TRUNCATE));
    }

    #[test]
    fn test_set_attr_empty() {
        assert!(SetAttr::default().is_empty());
        let attr = SetAttr { size: Some(0), ..Default::default() };
        assert!(!attr.is_empty());
    }

    #[test]
    fn test_whence_from_raw() {
        assert_eq!(Whence::from_raw(libc::SEEK_END), Some(Whence::End));
        assert_eq!(Whence::from_raw(99), None);
    }
}
