//! The handler surface a node plugs into the tree with.
//!
//! `Operations` is the trait application authors implement per node type.
//! Every method defaults to "not implemented", the same way `fuser::Filesystem`
//! gives every opcode a default body and `lnxdrive-fuse` only overrides the
//! subset `LnxDriveFs` actually supports. The bridge checks
//! [`Operations::capabilities`] once (cached on the handle, see `handle.rs`)
//! rather than probing per call, per the "cache capability bits on first
//! use" guidance in the design notes.

use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;

use crate::attr::StableAttr;
use crate::context::RequestContext;
use crate::dirstream::DirStream;
use crate::error::OpResult;
use crate::handle::Fh;

bitflags! {
    /// Which optional capability methods a handler implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const LOOKUP      = 1 << 0;
        const GETATTR     = 1 << 1;
        const SETATTR     = 1 << 2;
        const MKDIR       = 1 << 3;
        const MKNOD       = 1 << 4;
        const SYMLINK     = 1 << 5;
        const LINK        = 1 << 6;
        const UNLINK      = 1 << 7;
        const RMDIR       = 1 << 8;
        const RENAME      = 1 << 9;
        const CREATE      = 1 << 10;
        const OPEN        = 1 << 11;
        const READ        = 1 << 12;
        const WRITE       = 1 << 13;
        const FLUSH       = 1 << 14;
        const FSYNC       = 1 << 15;
        const FALLOCATE   = 1 << 16;
        const LSEEK       = 1 << 17;
        const LOCK        = 1 << 18;
        const OPENDIR     = 1 << 19;
        const STATFS      = 1 << 20;
        const ACCESS      = 1 << 21;
        const GETXATTR    = 1 << 22;
        const SETXATTR    = 1 << 23;
        const LISTXATTR   = 1 << 24;
        const REMOVEXATTR = 1 << 25;
    }
}

/// Permission/size/time attributes a handler hands back; the bridge merges
/// these with the node's [`StableAttr`] to build the final reply (permission
/// bits from the handler, file-type bits from `stable.mode`).
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub perm: u16,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub flags: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl Default for Attr {
    fn default() -> Self {
        let now = SystemTime::UNIX_EPOCH;
        Self {
            perm: 0,
            size: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            flags: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }
}

/// Fields a SETATTR request may change; `None` means "leave as-is".
#[derive(Debug, Clone, Default)]
pub struct AttrChange {
    pub size: Option<u64>,
    pub perm: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// A handler's response to an operation that links a new name into the
/// tree (LOOKUP, MKDIR, MKNOD, SYMLINK, LINK, CREATE).
pub struct NodeReply {
    pub stable: StableAttr,
    pub ops: Arc<dyn Operations>,
    pub attr: Attr,
}

/// Response to OPEN/CREATE beyond the node identity: flags the kernel
/// should apply to its cache of this open file.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenReply {
    pub keep_cache: bool,
    pub direct_io: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsReply {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FileLock {
    pub start: u64,
    pub end: u64,
    pub typ: i32,
    pub pid: u32,
}

/// The handler trait a node plugs into the tree with.
///
/// Every method is optional; the default implementation returns
/// [`Errno::NotSupported`](crate::error::Errno::NotSupported). A type only
/// needs to override [`capabilities`](Operations::capabilities) plus the
/// methods it actually backs.
pub trait Operations: Send + Sync {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn lookup(&self, _ctx: &RequestContext, _name: &str) -> OpResult<NodeReply> {
        Err(crate::error::Errno::not_supported("lookup"))
    }

    fn getattr(&self, _ctx: &RequestContext, _fh: Option<Fh>) -> OpResult<Attr> {
        Err(crate::error::Errno::not_supported("getattr"))
    }

    fn setattr(&self, _ctx: &RequestContext, _fh: Option<Fh>, _change: AttrChange) -> OpResult<Attr> {
        Err(crate::error::Errno::not_supported("setattr"))
    }

    fn mkdir(&self, _ctx: &RequestContext, _name: &str, _mode: u32) -> OpResult<NodeReply> {
        Err(crate::error::Errno::not_supported("mkdir"))
    }

    fn mknod(&self, _ctx: &RequestContext, _name: &str, _mode: u32, _rdev: u32) -> OpResult<NodeReply> {
        Err(crate::error::Errno::not_supported("mknod"))
    }

    fn symlink(&self, _ctx: &RequestContext, _name: &str, _target: &str) -> OpResult<NodeReply> {
        Err(crate::error::Errno::not_supported("symlink"))
    }

    fn link(&self, _ctx: &RequestContext, _name: &str, _target: StableAttr) -> OpResult<NodeReply> {
        Err(crate::error::Errno::not_supported("link"))
    }

    fn create(
        &self,
        _ctx: &RequestContext,
        _name: &str,
        _mode: u32,
        _flags: i32,
    ) -> OpResult<(NodeReply, OpenReply)> {
        Err(crate::error::Errno::not_supported("create"))
    }

    fn unlink(&self, _ctx: &RequestContext, _name: &str) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("unlink"))
    }

    fn rmdir(&self, _ctx: &RequestContext, _name: &str) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("rmdir"))
    }

    fn rename(&self, _ctx: &RequestContext, _name: &str, _new_name: &str) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("rename"))
    }

    fn open(&self, _ctx: &RequestContext, _flags: i32) -> OpResult<OpenReply> {
        Err(crate::error::Errno::not_supported("open"))
    }

    fn read(&self, _ctx: &RequestContext, _fh: Fh, _offset: i64, _size: u32) -> OpResult<Vec<u8>> {
        Err(crate::error::Errno::not_supported("read"))
    }

    fn write(&self, _ctx: &RequestContext, _fh: Fh, _offset: i64, _data: &[u8]) -> OpResult<u32> {
        Err(crate::error::Errno::not_supported("write"))
    }

    fn flush(&self, _ctx: &RequestContext, _fh: Fh) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("flush"))
    }

    fn fsync(&self, _ctx: &RequestContext, _fh: Fh, _datasync: bool) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("fsync"))
    }

    fn fallocate(&self, _ctx: &RequestContext, _fh: Fh, _offset: i64, _length: i64, _mode: i32) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("fallocate"))
    }

    fn lseek(&self, _ctx: &RequestContext, _fh: Fh, _offset: i64, _whence: i32) -> OpResult<i64> {
        Err(crate::error::Errno::not_supported("lseek"))
    }

    fn lock(&self, _ctx: &RequestContext, _fh: Fh, _lock: FileLock) -> OpResult<FileLock> {
        Err(crate::error::Errno::not_supported("lock"))
    }

    fn open_directory(&self, _ctx: &RequestContext) -> OpResult<Box<dyn DirStream>> {
        Err(crate::error::Errno::not_supported("opendir"))
    }

    fn release(&self, _ctx: &RequestContext, _fh: Fh) -> OpResult<()> {
        Ok(())
    }

    fn releasedir(&self, _ctx: &RequestContext, _fh: Fh) -> OpResult<()> {
        Ok(())
    }

    fn statfs(&self, _ctx: &RequestContext) -> OpResult<StatfsReply> {
        Err(crate::error::Errno::not_supported("statfs"))
    }

    fn access(&self, _ctx: &RequestContext, _mask: u32) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("access"))
    }

    fn getxattr(&self, _ctx: &RequestContext, _name: &str, _size: u32) -> OpResult<Vec<u8>> {
        Err(crate::error::Errno::not_supported("getxattr"))
    }

    fn setxattr(&self, _ctx: &RequestContext, _name: &str, _value: &[u8], _flags: i32) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("setxattr"))
    }

    fn listxattr(&self, _ctx: &RequestContext) -> OpResult<Vec<String>> {
        Err(crate::error::Errno::not_supported("listxattr"))
    }

    fn removexattr(&self, _ctx: &RequestContext, _name: &str) -> OpResult<()> {
        Err(crate::error::Errno::not_supported("removexattr"))
    }

    /// Called exactly once, immediately before the node is dropped from the
    /// tree. Never called for persistent nodes (they are never destroyed by
    /// the bridge).
    fn on_forget(&self) {}
}
