//! The transport boundary: a fixed set of opcode methods the bridge
//! implements (the "raw filesystem" sink a kernel-channel transport calls
//! into) plus the reply structs those methods fill in. The wire framing
//! itself — header decode, the mount syscall, the worker read loop — is an
//! external collaborator and stays out of this crate.

use std::time::{Duration, SystemTime};

use crate::attr::Ino;
use crate::context::RequestContext;
use crate::dirstream::DirEntry;
use crate::error::{Errno, OpResult};
use crate::ops::{AttrChange, FileLock, StatfsReply};

/// The permission-plus-type attribute block placed into a reply. `mode`
/// already combines permission bits from a handler with file-type bits
/// from the node's stable attribute, per the bridge's mode-composition
/// rule.
#[derive(Debug, Clone, Copy)]
pub struct AttrReply {
    pub ino: Ino,
    pub size: u64,
    pub blocks: u64,
    pub mode: u32,
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

#[derive(Debug, Clone, Copy)]
pub struct AttrOut {
    pub attr: AttrReply,
    pub attr_timeout: Duration,
}

/// Reply to LOOKUP, CREATE, MKDIR, MKNOD, SYMLINK, LINK. When the looked-up
/// name does not exist and a negative-lookup timeout is configured, the
/// bridge fills `entry_timeout` anyway so the kernel can cache the absence.
#[derive(Debug, Clone, Copy)]
pub struct EntryOut {
    pub ino: Ino,
    pub generation: u64,
    pub attr: AttrReply,
    pub entry_timeout: Duration,
    pub attr_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOut {
    pub fh: u64,
    pub keep_cache: bool,
    pub direct_io: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateOut {
    pub entry: EntryOut,
    pub open: OpenOut,
}

/// The transport interface a bridge implementation produces.
///
/// One method per opcode, each receiving a [`RequestContext`] plus
/// opcode-specific arguments and returning a status-carrying [`OpResult`].
/// `node` arguments are kernel-visible inode numbers, `fh` arguments are
/// kernel-visible handle numbers — the header-plus-payload shape a
/// transport decodes before handing the call to this layer, which treats
/// it as opaque beyond those named fields.
pub trait RawFileSystem: Send + Sync {
    fn lookup(&self, ctx: &RequestContext, parent: u64, name: &str) -> OpResult<EntryOut>;
    fn forget(&self, ctx: &RequestContext, node: u64, nlookup: u64);
    fn getattr(&self, ctx: &RequestContext, node: u64, fh: Option<u64>) -> OpResult<AttrOut>;
    fn setattr(&self, ctx: &RequestContext, node: u64, fh: Option<u64>, change: AttrChange) -> OpResult<AttrOut>;

    fn mkdir(&self, ctx: &RequestContext, parent: u64, name: &str, mode: u32) -> OpResult<EntryOut>;
    fn mknod(&self, ctx: &RequestContext, parent: u64, name: &str, mode: u32, rdev: u32) -> OpResult<EntryOut>;
    fn symlink(&self, ctx: &RequestContext, parent: u64, name: &str, target: &str) -> OpResult<EntryOut>;
    fn link(&self, ctx: &RequestContext, parent: u64, name: &str, target_node: u64) -> OpResult<EntryOut>;
    fn create(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
        mode: u32,
        flags: i32,
    ) -> OpResult<CreateOut>;

    fn unlink(&self, ctx: &RequestContext, parent: u64, name: &str) -> OpResult<()>;
    fn rmdir(&self, ctx: &RequestContext, parent: u64, name: &str) -> OpResult<()>;
    fn rename(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
        exchange: bool,
    ) -> OpResult<()>;

    fn open(&self, ctx: &RequestContext, node: u64, flags: i32) -> OpResult<OpenOut>;
    fn opendir(&self, ctx: &RequestContext, node: u64, flags: i32) -> OpResult<OpenOut>;
    fn release(&self, ctx: &RequestContext, node: u64, fh: u64) -> OpResult<()>;
    fn releasedir(&self, ctx: &RequestContext, node: u64, fh: u64) -> OpResult<()>;

    fn read(&self, ctx: &RequestContext, node: u64, fh: u64, offset: i64, size: u32) -> OpResult<Vec<u8>>;
    fn write(&self, ctx: &RequestContext, node: u64, fh: u64, offset: i64, data: &[u8]) -> OpResult<u32>;
    fn flush(&self, ctx: &RequestContext, node: u64, fh: u64) -> OpResult<()>;
    fn fsync(&self, ctx: &RequestContext, node: u64, fh: u64, datasync: bool) -> OpResult<()>;
    fn fallocate(&self, ctx: &RequestContext, node: u64, fh: u64, offset: i64, length: i64, mode: i32) -> OpResult<()>;
    fn lseek(&self, ctx: &RequestContext, node: u64, fh: u64, offset: i64, whence: i32) -> OpResult<i64>;
    fn lock(&self, ctx: &RequestContext, node: u64, fh: u64, lock: FileLock, set: bool) -> OpResult<FileLock>;

    /// Pulls entries starting at `offset`, calling `add` for each; stops
    /// when `add` returns `true` (buffer full) or the stream is exhausted.
    fn readdir(
        &self,
        ctx: &RequestContext,
        node: u64,
        fh: u64,
        offset: i64,
        add: &mut dyn FnMut(&DirEntry) -> bool,
    ) -> OpResult<()>;

    /// Same iteration as `readdir`, but each entry is additionally resolved
    /// through the parent's LOOKUP and linked into the tree.
    fn readdirplus(
        &self,
        ctx: &RequestContext,
        node: u64,
        fh: u64,
        offset: i64,
        add: &mut dyn FnMut(&EntryOut, &DirEntry) -> bool,
    ) -> OpResult<()>;

    fn statfs(&self, ctx: &RequestContext, node: u64) -> OpResult<StatfsReply>;
    fn access(&self, ctx: &RequestContext, node: u64, mask: u32) -> OpResult<()>;

    fn getxattr(&self, ctx: &RequestContext, node: u64, name: &str, size: u32) -> OpResult<Vec<u8>>;
    fn setxattr(&self, ctx: &RequestContext, node: u64, name: &str, value: &[u8], flags: i32) -> OpResult<()>;
    fn listxattr(&self, ctx: &RequestContext, node: u64) -> OpResult<Vec<String>>;
    fn removexattr(&self, ctx: &RequestContext, node: u64, name: &str) -> OpResult<()>;
}

pub(crate) fn not_implemented(capability: &str) -> Errno {
    Errno::not_supported(capability)
}
