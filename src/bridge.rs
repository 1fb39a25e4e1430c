//! The request bridge: owns the inode graph and the handle table, and turns
//! kernel-visible inode/handle numbers into calls against the right node's
//! [`Operations`](crate::ops::Operations) implementation.
//!
//! One mutex (`BridgeState`) guards the id table, the handle table, and the
//! automatic-inode counter. It is held only for table bookkeeping — never
//! across a call into a handler, and never across the blocking wait half of
//! a handle release (see [`handle::ReleaseTicket`]). Per-inode mutation
//! (linking, unlinking, renaming) is the inode graph's own business and
//! locks independently, inode-by-inode, inside `inode.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, instrument};

use crate::attr::{Ino, StableAttr, S_IFDIR, S_IFMT};
use crate::context::RequestContext;
use crate::dirstream::DirEntry;
use crate::error::{Errno, OpResult};
use crate::handle::{FileEntry, Fh, HandleTable};
use crate::inode::{self, Inode};
use crate::notify::Notifier;
use crate::ops::{AttrChange, Capabilities, NodeReply, Operations};
use crate::options::Options;
use crate::raw::{AttrOut, AttrReply, CreateOut, EntryOut, OpenOut, RawFileSystem};

const DEFAULT_TTL: Duration = Duration::from_secs(1);

struct BridgeState {
    id_table: HashMap<u64, Inode>,
    handles: HandleTable,
    next_automatic_ino: u64,
}

/// Owns the inode graph for one mounted filesystem and dispatches every
/// opcode against it.
pub struct Bridge {
    state: Arc<Mutex<BridgeState>>,
    notifier: Arc<dyn Notifier>,
    options: Options,
    root: Inode,
}

/// Builds the callback an `Inode` fires on destruction to evict itself from
/// `state`'s id table. Holds only a [`Weak`] reference so a bridge that has
/// already been torn down doesn't get resurrected by a late destruction.
fn destroy_hook(state: &Arc<Mutex<BridgeState>>) -> impl Fn(Ino) + Send + Sync + 'static {
    let state: Weak<Mutex<BridgeState>> = Arc::downgrade(state);
    move |ino: Ino| {
        if let Some(state) = state.upgrade() {
            state.lock().id_table.remove(&ino.get());
        }
    }
}

impl Bridge {
    /// Builds a fresh bridge with `root_ops` backing the root directory.
    pub fn new(root_ops: Arc<dyn Operations>, notifier: Arc<dyn Notifier>, options: Options) -> Arc<Bridge> {
        let root = Inode::new(StableAttr::new(Ino::ROOT, S_IFDIR, 0), root_ops, true, Arc::clone(&notifier));
        let mut id_table = HashMap::new();
        id_table.insert(Ino::ROOT.get(), root.clone());
        let automatic_ino_start = options.automatic_ino_start;
        let state = Arc::new(Mutex::new(BridgeState {
            id_table,
            handles: HandleTable::new(),
            next_automatic_ino: automatic_ino_start,
        }));
        root.set_destroy_hook(destroy_hook(&state));
        let bridge = Arc::new(Bridge {
            state,
            notifier,
            options,
            root: root.clone(),
        });
        if let Some(hook) = &bridge.options.on_add_root {
            hook(&root);
        }
        bridge
    }

    pub fn root(&self) -> &Inode {
        &self.root
    }

    /// Builds a persistent node — one the bridge never destroys regardless
    /// of lookup count or parent count — and links it under `parent`. This
    /// is the explicit-construction counterpart to the lazy nodes `lookup`
    /// and friends create through [`Bridge::resolve_child`]; a handler
    /// author calls it directly, outside of any request, to seed the tree
    /// with nodes that must be resolvable even before the kernel has ever
    /// looked them up.
    pub fn add_persistent_child(&self, parent: &Inode, name: &str, ops: Arc<dyn Operations>, mode: u32) -> Inode {
        let mut state = self.state.lock();
        let ino = self.alloc_ino(&mut state);
        let node = Inode::new(StableAttr::new(ino, mode, 0), ops, true, Arc::clone(&self.notifier));
        node.set_destroy_hook(destroy_hook(&self.state));
        state.id_table.insert(ino.get(), node.clone());
        drop(state);
        inode::set_entry(parent, name, &node);
        node
    }

    fn entry_timeout(&self) -> Duration {
        self.options.entry_timeout.unwrap_or(DEFAULT_TTL)
    }

    fn attr_timeout(&self) -> Duration {
        self.options.attr_timeout.unwrap_or(DEFAULT_TTL)
    }

    fn negative_timeout(&self) -> Duration {
        self.options.negative_timeout.unwrap_or(Duration::ZERO)
    }

    /// Looks up a live node by its kernel-visible inode number. An unknown
    /// id means the transport handed us a number this bridge never issued —
    /// a programming error in the caller, not a filesystem-level failure.
    fn require_node(&self, ino: u64) -> Inode {
        match self.state.lock().id_table.get(&ino).cloned() {
            Some(node) => node,
            None => {
                error!(ino, "dispatch against an inode number this bridge never issued");
                panic!("unknown inode number {ino}");
            }
        }
    }

    /// Allocates the next free automatic inode number, skipping any value a
    /// handler has already claimed directly.
    fn alloc_ino(&self, state: &mut BridgeState) -> Ino {
        loop {
            let candidate = state.next_automatic_ino;
            state.next_automatic_ino = state.next_automatic_ino.wrapping_add(1);
            if !state.id_table.contains_key(&candidate) && candidate != Ino::NULL.get() {
                return Ino::new(candidate);
            }
        }
    }

    /// Resolves a [`NodeReply`] into a live, tree-linked [`Inode`], assigning
    /// an automatic inode number when the handler left `stable.ino` as
    /// [`Ino::NULL`] (the "let the bridge number this node" convention).
    fn resolve_child(&self, reply: NodeReply) -> Inode {
        let mut stable = reply.stable;
        let mut state = self.state.lock();
        if stable.ino == Ino::NULL {
            stable.ino = self.alloc_ino(&mut state);
        }
        // `resolve_child` only ever resolves a non-root child (the root is
        // built directly by `Bridge::new`), so any reserved number reaching
        // this point — NULL survives only if `alloc_ino` itself is broken,
        // ROOT means a handler returned it for a brand-new node — is always
        // a programming error.
        if stable.ino.is_reserved() {
            error!(ino = %stable.ino, "handler assigned a reserved inode number to a new node");
            panic!("reserved inode number assigned to a live node");
        }
        if let Some(existing) = state.id_table.get(&stable.ino.get()) {
            if existing.stable().mode & S_IFMT != stable.mode & S_IFMT {
                error!(ino = %stable.ino, "handler reused an inode number with a different file type");
                panic!("inode number {} reused with a mismatched file type", stable.ino);
            }
        }
        let notifier = Arc::clone(&self.notifier);
        let hook = destroy_hook(&self.state);
        let node = state
            .id_table
            .entry(stable.ino.get())
            .or_insert_with(move || {
                let node = Inode::new(stable, reply.ops, false, notifier);
                node.set_destroy_hook(hook);
                node
            })
            .clone();
        node
    }

    fn attr_reply(&self, inode: &Inode, attr: crate::ops::Attr) -> AttrReply {
        let stable = inode.stable();
        AttrReply {
            ino: stable.ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            mode: (attr.perm as u32 & 0o7777) | (stable.mode & S_IFMT),
            nlink: attr.nlink,
            uid: self.options.default_uid.filter(|_| attr.uid == 0).unwrap_or(attr.uid),
            gid: self.options.default_gid.filter(|_| attr.gid == 0).unwrap_or(attr.gid),
            rdev: attr.rdev,
            blksize: attr.blksize,
            flags: attr.flags,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
        }
    }

    fn entry_out(&self, inode: &Inode, attr: crate::ops::Attr) -> EntryOut {
        EntryOut {
            ino: inode.stable().ino,
            generation: inode.stable().gen,
            attr: self.attr_reply(inode, attr),
            entry_timeout: self.entry_timeout(),
            attr_timeout: self.attr_timeout(),
        }
    }

    fn negative_entry_out(&self) -> EntryOut {
        EntryOut {
            ino: Ino::NULL,
            generation: 0,
            attr: self.attr_reply(&self.root, crate::ops::Attr::default()),
            entry_timeout: self.negative_timeout(),
            attr_timeout: Duration::ZERO,
        }
    }

    /// Looks for an already-open handle on `node` the GETATTR-by-inode
    /// fallback can piggyback on, probing it so a concurrent release can't
    /// free the slot out from under the call.
    fn probe_any_open_handle(&self, node: &Inode) -> Option<(Fh, crate::handle::ProbeGuard)> {
        for fh in node.open_handles_snapshot() {
            let state = self.state.lock();
            if let Some(guard) = state.handles.probe(fh) {
                return Some((fh, guard));
            }
        }
        None
    }

    fn register_handle(&self, node: &Inode, capabilities: Capabilities, dir_stream: Option<Box<dyn crate::dirstream::DirStream>>) -> Fh {
        let mut entry = FileEntry::new(node.stable().ino.get(), 0, capabilities);
        entry.dir_stream = dir_stream;
        let fh = {
            let mut state = self.state.lock();
            state.handles.register(entry)
        };
        let index = node.register_open_handle(fh);
        let mut state = self.state.lock();
        if let Some(slot) = state.handles.get_mut(fh) {
            slot.index_in_node = index;
        }
        fh
    }

    /// Tests the capability bit cached on `fh`'s handle against `cap`,
    /// short-circuiting to [`Errno::NotSupported`] without dispatching into
    /// the handler when it's absent, per the "cache capability bits on
    /// first use" guidance. Also the point where an unknown/released handle
    /// is rejected for these opcodes.
    fn require_capability(&self, fh: Fh, cap: Capabilities, name: &'static str) -> OpResult<()> {
        let state = self.state.lock();
        let entry = state
            .handles
            .get(fh)
            .ok_or_else(|| Errno::Invalid(format!("handle {} not open", fh.get())))?;
        if entry.capabilities.contains(cap) {
            Ok(())
        } else {
            Err(Errno::not_supported(name))
        }
    }

    fn release_handle(&self, ctx: &RequestContext, node: &Inode, fh: Fh, is_dir: bool) -> OpResult<()> {
        let ticket = {
            let mut state = self.state.lock();
            state.handles.begin_release(fh)
        };
        let Some(ticket) = ticket else {
            return Ok(());
        };
        ticket.wait();
        let entry = {
            let mut state = self.state.lock();
            state.handles.finish_release(fh)
        };
        if let Some(mut entry) = entry {
            node.unregister_open_handle(entry.index_in_node);
            if let Some(stream) = entry.dir_stream.as_deref_mut() {
                stream.close();
            }
        }
        if is_dir {
            node.ops().releasedir(ctx, fh)
        } else {
            node.ops().release(ctx, fh)
        }
    }
}

impl RawFileSystem for Bridge {
    #[instrument(level = "debug", skip(self, ctx), fields(parent, name))]
    fn lookup(&self, ctx: &RequestContext, parent: u64, name: &str) -> OpResult<EntryOut> {
        let parent_node = self.require_node(parent);
        match parent_node.ops().lookup(ctx, name) {
            Ok(reply) => {
                let child = self.resolve_child(reply);
                inode::add_new_child(&parent_node, name, &child);
                Ok(self.entry_out(&child, child.ops().getattr(ctx, None).unwrap_or_default_attr()))
            }
            Err(Errno::NotFound(_)) if self.options.negative_timeout.is_some() => {
                debug!("caching negative lookup");
                Ok(self.negative_entry_out())
            }
            Err(err) => Err(err),
        }
    }

    fn forget(&self, _ctx: &RequestContext, node: u64, nlookup: u64) {
        let target = { self.state.lock().id_table.get(&node).cloned() };
        if let Some(node) = target {
            inode::remove_ref(&node, nlookup);
        }
    }

    #[instrument(level = "debug", skip(self, ctx), fields(node, fh))]
    fn getattr(&self, ctx: &RequestContext, node: u64, fh: Option<u64>) -> OpResult<AttrOut> {
        let inode = self.require_node(node);
        let attr = match fh.map(Fh::new) {
            Some(fh) => inode.ops().getattr(ctx, Some(fh))?,
            None => match self.probe_any_open_handle(&inode) {
                Some((fh, _guard)) => inode.ops().getattr(ctx, Some(fh))?,
                None => inode.ops().getattr(ctx, None)?,
            },
        };
        Ok(AttrOut {
            attr: self.attr_reply(&inode, attr),
            attr_timeout: self.attr_timeout(),
        })
    }

    #[instrument(level = "debug", skip(self, ctx, change), fields(node, fh))]
    fn setattr(&self, ctx: &RequestContext, node: u64, fh: Option<u64>, change: AttrChange) -> OpResult<AttrOut> {
        let inode = self.require_node(node);
        inode.ops().setattr(ctx, fh.map(Fh::new), change)?;
        // Re-fetch rather than trust setattr's own returned `Attr`: a
        // handler may clamp a requested value (e.g. truncate past a size
        // limit) and only reflect the clamped result from getattr.
        let attr = inode.ops().getattr(ctx, fh.map(Fh::new))?;
        Ok(AttrOut {
            attr: self.attr_reply(&inode, attr),
            attr_timeout: self.attr_timeout(),
        })
    }

    #[instrument(level = "info", skip(self, ctx), fields(parent, name, mode))]
    fn mkdir(&self, ctx: &RequestContext, parent: u64, name: &str, mode: u32) -> OpResult<EntryOut> {
        let parent_node = self.require_node(parent);
        let reply = parent_node.ops().mkdir(ctx, name, mode)?;
        let child = self.resolve_child(reply);
        inode::add_new_child(&parent_node, name, &child);
        Ok(self.entry_out(&child, child.ops().getattr(ctx, None).unwrap_or_default_attr()))
    }

    #[instrument(level = "info", skip(self, ctx), fields(parent, name, mode))]
    fn mknod(&self, ctx: &RequestContext, parent: u64, name: &str, mode: u32, rdev: u32) -> OpResult<EntryOut> {
        let parent_node = self.require_node(parent);
        let reply = parent_node.ops().mknod(ctx, name, mode, rdev)?;
        let child = self.resolve_child(reply);
        inode::add_new_child(&parent_node, name, &child);
        Ok(self.entry_out(&child, child.ops().getattr(ctx, None).unwrap_or_default_attr()))
    }

    #[instrument(level = "info", skip(self, ctx, target), fields(parent, name))]
    fn symlink(&self, ctx: &RequestContext, parent: u64, name: &str, target: &str) -> OpResult<EntryOut> {
        let parent_node = self.require_node(parent);
        let reply = parent_node.ops().symlink(ctx, name, target)?;
        let child = self.resolve_child(reply);
        inode::add_new_child(&parent_node, name, &child);
        Ok(self.entry_out(&child, child.ops().getattr(ctx, None).unwrap_or_default_attr()))
    }

    #[instrument(level = "info", skip(self, ctx), fields(parent, name, target_node))]
    fn link(&self, ctx: &RequestContext, parent: u64, name: &str, target_node: u64) -> OpResult<EntryOut> {
        let parent_node = self.require_node(parent);
        let target = self.require_node(target_node);
        let reply = parent_node.ops().link(ctx, name, target.stable())?;
        let child = self.resolve_child(reply);
        inode::add_new_child(&parent_node, name, &child);
        Ok(self.entry_out(&child, child.ops().getattr(ctx, None).unwrap_or_default_attr()))
    }

    #[instrument(level = "info", skip(self, ctx), fields(parent, name, mode, flags))]
    fn create(&self, ctx: &RequestContext, parent: u64, name: &str, mode: u32, flags: i32) -> OpResult<CreateOut> {
        let parent_node = self.require_node(parent);
        let (reply, open) = parent_node.ops().create(ctx, name, mode, flags)?;
        let child = self.resolve_child(reply);
        inode::add_new_child(&parent_node, name, &child);
        let capabilities = child.ops().capabilities();
        let fh = self.register_handle(&child, capabilities, None);
        let entry = self.entry_out(&child, child.ops().getattr(ctx, Some(fh)).unwrap_or_default_attr());
        Ok(CreateOut {
            entry,
            open: OpenOut {
                fh: fh.get(),
                keep_cache: open.keep_cache,
                direct_io: open.direct_io,
            },
        })
    }

    #[instrument(level = "info", skip(self, ctx), fields(parent, name))]
    fn unlink(&self, ctx: &RequestContext, parent: u64, name: &str) -> OpResult<()> {
        let parent_node = self.require_node(parent);
        parent_node.ops().unlink(ctx, name)?;
        inode::rm_child(&parent_node, name);
        Ok(())
    }

    #[instrument(level = "info", skip(self, ctx), fields(parent, name))]
    fn rmdir(&self, ctx: &RequestContext, parent: u64, name: &str) -> OpResult<()> {
        let parent_node = self.require_node(parent);
        parent_node.ops().rmdir(ctx, name)?;
        inode::rm_child(&parent_node, name);
        Ok(())
    }

    #[instrument(level = "info", skip(self, ctx), fields(parent, name, new_parent, new_name, exchange))]
    fn rename(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
        exchange: bool,
    ) -> OpResult<()> {
        let parent_node = self.require_node(parent);
        let new_parent_node = self.require_node(new_parent);
        if exchange {
            // No handler hook models an atomic two-way directory swap; the
            // tree mutation is authoritative and handlers observe it only
            // through subsequent lookups.
            return inode::exchange_child(&parent_node, name, &new_parent_node, new_name)
                .map_err(|_| Errno::NotFound(format!("{name} or {new_name}")));
        }
        parent_node.ops().rename(ctx, name, new_name)?;
        inode::mv_child(&parent_node, name, &new_parent_node, new_name, true)
            .map_err(|_| Errno::NotFound(name.to_string()))
    }

    #[instrument(level = "debug", skip(self, ctx), fields(node, flags))]
    fn open(&self, ctx: &RequestContext, node: u64, flags: i32) -> OpResult<OpenOut> {
        let inode = self.require_node(node);
        let reply = inode.ops().open(ctx, flags)?;
        let fh = self.register_handle(&inode, inode.ops().capabilities(), None);
        Ok(OpenOut {
            fh: fh.get(),
            keep_cache: reply.keep_cache,
            direct_io: reply.direct_io,
        })
    }

    #[instrument(level = "debug", skip(self, ctx), fields(node, flags))]
    fn opendir(&self, ctx: &RequestContext, node: u64, _flags: i32) -> OpResult<OpenOut> {
        let inode = self.require_node(node);
        let stream = inode.ops().open_directory(ctx)?;
        let fh = self.register_handle(&inode, inode.ops().capabilities(), Some(stream));
        Ok(OpenOut {
            fh: fh.get(),
            keep_cache: false,
            direct_io: false,
        })
    }

    #[instrument(level = "debug", skip(self, ctx), fields(node, fh))]
    fn release(&self, ctx: &RequestContext, node: u64, fh: u64) -> OpResult<()> {
        let inode = self.require_node(node);
        self.release_handle(ctx, &inode, Fh::new(fh), false)
    }

    #[instrument(level = "debug", skip(self, ctx), fields(node, fh))]
    fn releasedir(&self, ctx: &RequestContext, node: u64, fh: u64) -> OpResult<()> {
        let inode = self.require_node(node);
        self.release_handle(ctx, &inode, Fh::new(fh), true)
    }

    #[instrument(level = "debug", skip(self, ctx), fields(node, fh, offset, size))]
    fn read(&self, ctx: &RequestContext, node: u64, fh: u64, offset: i64, size: u32) -> OpResult<Vec<u8>> {
        let fh = Fh::new(fh);
        self.require_capability(fh, Capabilities::READ, "read")?;
        self.require_node(node).ops().read(ctx, fh, offset, size)
    }

    #[instrument(level = "debug", skip(self, ctx, data), fields(node, fh, offset, size = data.len()))]
    fn write(&self, ctx: &RequestContext, node: u64, fh: u64, offset: i64, data: &[u8]) -> OpResult<u32> {
        let fh = Fh::new(fh);
        self.require_capability(fh, Capabilities::WRITE, "write")?;
        self.require_node(node).ops().write(ctx, fh, offset, data)
    }

    fn flush(&self, ctx: &RequestContext, node: u64, fh: u64) -> OpResult<()> {
        let fh = Fh::new(fh);
        self.require_capability(fh, Capabilities::FLUSH, "flush")?;
        self.require_node(node).ops().flush(ctx, fh)
    }

    fn fsync(&self, ctx: &RequestContext, node: u64, fh: u64, datasync: bool) -> OpResult<()> {
        let fh = Fh::new(fh);
        self.require_capability(fh, Capabilities::FSYNC, "fsync")?;
        self.require_node(node).ops().fsync(ctx, fh, datasync)
    }

    fn fallocate(&self, ctx: &RequestContext, node: u64, fh: u64, offset: i64, length: i64, mode: i32) -> OpResult<()> {
        let fh = Fh::new(fh);
        self.require_capability(fh, Capabilities::FALLOCATE, "fallocate")?;
        self.require_node(node).ops().fallocate(ctx, fh, offset, length, mode)
    }

    fn lseek(&self, ctx: &RequestContext, node: u64, fh: u64, offset: i64, whence: i32) -> OpResult<i64> {
        let fh = Fh::new(fh);
        self.require_capability(fh, Capabilities::LSEEK, "lseek")?;
        self.require_node(node).ops().lseek(ctx, fh, offset, whence)
    }

    fn lock(
        &self,
        ctx: &RequestContext,
        node: u64,
        fh: u64,
        lock: crate::ops::FileLock,
        _set: bool,
    ) -> OpResult<crate::ops::FileLock> {
        let fh = Fh::new(fh);
        self.require_capability(fh, Capabilities::LOCK, "lock")?;
        self.require_node(node).ops().lock(ctx, fh, lock)
    }

    #[instrument(level = "debug", skip(self, ctx, add), fields(node, fh, offset))]
    fn readdir(
        &self,
        ctx: &RequestContext,
        node: u64,
        fh: u64,
        offset: i64,
        add: &mut dyn FnMut(&DirEntry) -> bool,
    ) -> OpResult<()> {
        let inode = self.require_node(node);
        let fh = Fh::new(fh);
        let mut state = self.state.lock();
        let entry = state
            .handles
            .get_mut(fh)
            .ok_or_else(|| Errno::Invalid("directory handle not open".into()))?;
        self.drain_dir_stream(ctx, &inode, entry, offset, add)
    }

    #[instrument(level = "debug", skip(self, ctx, add), fields(node, fh, offset))]
    fn readdirplus(
        &self,
        ctx: &RequestContext,
        node: u64,
        fh: u64,
        offset: i64,
        add: &mut dyn FnMut(&EntryOut, &DirEntry) -> bool,
    ) -> OpResult<()> {
        let parent_node = self.require_node(node);
        let mut collected = Vec::new();
        {
            let fh_typed = Fh::new(fh);
            let mut state = self.state.lock();
            let entry = state
                .handles
                .get_mut(fh_typed)
                .ok_or_else(|| Errno::Invalid("directory handle not open".into()))?;
            self.drain_dir_stream(ctx, &parent_node, entry, offset, &mut |e| {
                collected.push(e.clone());
                collected.len() >= 4096
            })?;
        }
        for dir_entry in &collected {
            let lookup = parent_node.ops().lookup(ctx, &dir_entry.name);
            let entry_out = match lookup {
                Ok(reply) => {
                    if dir_entry.mode & S_IFMT != reply.stable.mode & S_IFMT {
                        error!(name = %dir_entry.name, "readdirplus entry type does not match lookup's");
                        panic!("directory entry type mismatch with lookup result for {}", dir_entry.name);
                    }
                    let child = self.resolve_child(reply);
                    inode::add_new_child(&parent_node, &dir_entry.name, &child);
                    self.entry_out(&child, child.ops().getattr(ctx, None).unwrap_or_default_attr())
                }
                Err(_) => self.negative_entry_out(),
            };
            if add(&entry_out, dir_entry) {
                break;
            }
        }
        Ok(())
    }

    fn statfs(&self, ctx: &RequestContext, node: u64) -> OpResult<crate::ops::StatfsReply> {
        // Many kernels refuse to even finish the mount without a STATFS
        // reply, so a handler that doesn't implement it gets a zeroed
        // success rather than ENOSYS.
        match self.require_node(node).ops().statfs(ctx) {
            Err(Errno::NotSupported(_)) => Ok(crate::ops::StatfsReply::default()),
            other => other,
        }
    }

    fn access(&self, ctx: &RequestContext, node: u64, mask: u32) -> OpResult<()> {
        let inode = self.require_node(node);
        match inode.ops().access(ctx, mask) {
            Err(Errno::NotSupported(_)) if self.options.default_permissions => {
                let attr = inode.ops().getattr(ctx, None)?;
                if permission_check_passes(&attr, &ctx.caller, mask) {
                    Ok(())
                } else {
                    Err(Errno::Invalid("permission denied".into()))
                }
            }
            other => other,
        }
    }

    fn getxattr(&self, ctx: &RequestContext, node: u64, name: &str, size: u32) -> OpResult<Vec<u8>> {
        self.require_node(node).ops().getxattr(ctx, name, size)
    }

    fn setxattr(&self, ctx: &RequestContext, node: u64, name: &str, value: &[u8], flags: i32) -> OpResult<()> {
        self.require_node(node).ops().setxattr(ctx, name, value, flags)
    }

    fn listxattr(&self, ctx: &RequestContext, node: u64) -> OpResult<Vec<String>> {
        self.require_node(node).ops().listxattr(ctx)
    }

    fn removexattr(&self, ctx: &RequestContext, node: u64, name: &str) -> OpResult<()> {
        self.require_node(node).ops().removexattr(ctx, name)
    }
}

impl Bridge {
    /// Pulls entries out of `entry`'s directory stream into `add`, handling
    /// the overflow stash and the offset-resume decision.
    ///
    /// `offset == 0` always disposes of any existing stream and requests a
    /// fresh one from `node`, so a listing that is read start-to-finish and
    /// then re-read from the top sees the same sequence rather than an
    /// exhausted iterator. A stream that does not support seeking can only
    /// resume from the logical offset it last stopped at; when the kernel
    /// asks for a different, non-zero offset against such a stream (this
    /// happens when the stream was dropped and a fresh handle reopened
    /// mid-listing), that offset can't be honored reliably, so this returns
    /// [`Errno::Invalid`] rather than silently restarting or skipping
    /// entries.
    fn drain_dir_stream(
        &self,
        ctx: &RequestContext,
        node: &Inode,
        entry: &mut FileEntry,
        offset: i64,
        add: &mut dyn FnMut(&DirEntry) -> bool,
    ) -> OpResult<()> {
        if offset == 0 {
            if let Some(stream) = entry.dir_stream.as_deref_mut() {
                stream.close();
            }
            entry.dir_stream = Some(node.ops().open_directory(ctx)?);
            entry.overflow = None;
        }

        let stream = entry
            .dir_stream
            .as_deref_mut()
            .ok_or_else(|| Errno::Invalid("handle has no directory stream".into()))?;

        if offset != 0 {
            if let Some(stashed) = &entry.overflow {
                if stashed.off as i64 != offset && stream.supports_seek() {
                    stream.seek(offset as u64)?;
                    entry.overflow = None;
                } else if stashed.off as i64 != offset {
                    return Err(Errno::Invalid(format!(
                        "directory stream cannot resume at offset {offset} without seek support"
                    )));
                }
            } else if stream.supports_seek() {
                stream.seek(offset as u64)?;
            } else {
                return Err(Errno::Invalid(format!(
                    "directory stream cannot resume at offset {offset} without seek support"
                )));
            }
        }

        if let Some(stashed) = entry.overflow.take() {
            if add(&stashed) {
                entry.overflow = Some(stashed);
                return Ok(());
            }
        }

        while stream.has_next() {
            let next = stream.next()?;
            if add(&next) {
                entry.overflow = Some(next);
                break;
            }
        }
        Ok(())
    }
}

fn permission_check_passes(attr: &crate::ops::Attr, caller: &crate::context::CallerId, mask: u32) -> bool {
    const R_OK: u32 = 4;
    const W_OK: u32 = 2;
    const X_OK: u32 = 1;

    let perm = attr.perm as u32;
    let bits = if caller.uid == attr.uid {
        (perm >> 6) & 0o7
    } else if caller.gid == attr.gid {
        (perm >> 3) & 0o7
    } else {
        perm & 0o7
    };
    (mask & R_OK == 0 || bits & R_OK != 0) && (mask & W_OK == 0 || bits & W_OK != 0) && (mask & X_OK == 0 || bits & X_OK != 0)
}

/// A failed handle-less GETATTR call made internally while building an
/// entry reply (e.g. right after LOOKUP/MKDIR) degrades to the node's
/// default attributes rather than failing the whole create-style operation
/// over a handler that only implements a subset of `Operations`.
trait AttrOrDefault {
    fn unwrap_or_default_attr(self) -> crate::ops::Attr;
}

impl AttrOrDefault for OpResult<crate::ops::Attr> {
    fn unwrap_or_default_attr(self) -> crate::ops::Attr {
        self.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::attr::S_IFREG;
    use crate::context::CallerId;
    use crate::dirstream::{DirEntry, VecDirStream};
    use crate::notify::NullNotifier;
    use crate::ops::Attr;

    fn ctx() -> RequestContext {
        RequestContext::new(CallerId { uid: 0, gid: 0, pid: 0 })
    }

    /// Root whose `open_directory` hands back a fixed listing, for exercising
    /// readdir's overflow-stash/resume path.
    struct ListingRoot {
        entries: Vec<DirEntry>,
    }

    impl Operations for ListingRoot {
        fn capabilities(&self) -> Capabilities {
            Capabilities::OPENDIR | Capabilities::GETATTR
        }

        fn getattr(&self, _ctx: &RequestContext, _fh: Option<Fh>) -> OpResult<Attr> {
            Ok(Attr { perm: 0o755, ..Attr::default() })
        }

        fn open_directory(&self, _ctx: &RequestContext) -> OpResult<Box<dyn crate::dirstream::DirStream>> {
            Ok(Box::new(VecDirStream::new(self.entries.clone())))
        }
    }

    #[test]
    fn directory_listing_resumes_across_overflow_without_reiterating() {
        // Entry `off` is the offset a caller should pass to resume *after*
        // that entry, matching the kernel's readdir convention.
        let entries: Vec<DirEntry> = (0..50)
            .map(|i| DirEntry::new(format!("e{i}"), 1000 + i as u64, S_IFREG, (i + 1) as u64))
            .collect();
        let bridge = Bridge::new(Arc::new(ListingRoot { entries }), Arc::new(NullNotifier), Options::default());
        let ctx = ctx();
        let fh = bridge.opendir(&ctx, Ino::ROOT.get(), 0).unwrap().fh;

        let mut first_batch = Vec::new();
        bridge
            .readdir(&ctx, Ino::ROOT.get(), fh, 0, &mut |e| {
                if first_batch.len() >= 30 {
                    return true;
                }
                first_batch.push(e.name.clone());
                false
            })
            .unwrap();
        assert_eq!(first_batch.len(), 30);
        assert_eq!(first_batch[0], "e0");
        assert_eq!(first_batch[29], "e29");

        let mut second_batch = Vec::new();
        bridge
            .readdir(&ctx, Ino::ROOT.get(), fh, 30, &mut |e| {
                second_batch.push(e.name.clone());
                false
            })
            .unwrap();
        assert_eq!(second_batch.len(), 20, "second read must deliver exactly the remaining entries");
        assert_eq!(second_batch[0], "e30");
        assert_eq!(second_batch[19], "e49");

        let mut third_batch = Vec::new();
        bridge
            .readdir(&ctx, Ino::ROOT.get(), fh, 50, &mut |e| {
                third_batch.push(e.name.clone());
                false
            })
            .unwrap();
        assert!(third_batch.is_empty(), "a read past the end of an exhausted listing adds nothing");
    }

    /// A file whose GETATTR asserts it was always called with a handle and
    /// takes a moment to do so, so a concurrent release can be observed
    /// waiting on it.
    struct SlowFile {
        // `mpsc::Sender` alone isn't `Sync`; `Operations` requires it.
        started: Mutex<mpsc::Sender<()>>,
    }

    impl Operations for SlowFile {
        fn capabilities(&self) -> Capabilities {
            Capabilities::OPEN | Capabilities::GETATTR
        }

        fn open(&self, _ctx: &RequestContext, _flags: i32) -> OpResult<crate::ops::OpenReply> {
            Ok(crate::ops::OpenReply::default())
        }

        fn getattr(&self, _ctx: &RequestContext, fh: Option<Fh>) -> OpResult<Attr> {
            assert!(fh.is_some(), "handle-less GETATTR must resolve to an open handle");
            let _ = self.started.lock().send(());
            thread::sleep(std::time::Duration::from_millis(150));
            Ok(Attr::default())
        }
    }

    struct RootWithFile {
        file: Arc<dyn Operations>,
    }

    impl Operations for RootWithFile {
        fn capabilities(&self) -> Capabilities {
            Capabilities::LOOKUP
        }

        fn lookup(&self, _ctx: &RequestContext, name: &str) -> OpResult<NodeReply> {
            if name == "x" {
                Ok(NodeReply {
                    stable: StableAttr::new(2u64, S_IFREG, 0),
                    ops: Arc::clone(&self.file),
                    attr: Attr::default(),
                })
            } else {
                Err(Errno::NotFound(name.to_string()))
            }
        }
    }

    #[test]
    fn handle_less_getattr_picks_up_open_handle_and_blocks_release() {
        let (started_tx, started_rx) = mpsc::channel();
        let file: Arc<dyn Operations> = Arc::new(SlowFile { started: Mutex::new(started_tx) });
        let bridge = Bridge::new(Arc::new(RootWithFile { file }), Arc::new(NullNotifier), Options::default());
        let ctx = ctx();

        let entry = bridge.lookup(&ctx, Ino::ROOT.get(), "x").unwrap();
        let ino = entry.ino.get();
        let fh = bridge.open(&ctx, ino, 0).unwrap().fh;

        let bridge2 = Arc::clone(&bridge);
        let getattr_thread = thread::spawn(move || bridge2.getattr(&RequestContext::new(CallerId { uid: 0, gid: 0, pid: 0 }), ino, None));

        // Wait until the handler is actually inside GETATTR before racing release against it.
        started_rx.recv_timeout(std::time::Duration::from_secs(2)).expect("getattr should start");

        let before_release = Instant::now();
        bridge
            .release(&RequestContext::new(CallerId { uid: 0, gid: 0, pid: 0 }), ino, fh)
            .unwrap();
        let release_elapsed = before_release.elapsed();

        getattr_thread.join().unwrap().unwrap();
        assert!(
            release_elapsed >= std::time::Duration::from_millis(100),
            "release should have blocked until the in-flight GETATTR finished, took {release_elapsed:?}"
        );
    }

    struct EmptyRoot;

    impl Operations for EmptyRoot {
        fn capabilities(&self) -> Capabilities {
            Capabilities::LOOKUP
        }

        fn lookup(&self, _ctx: &RequestContext, name: &str) -> OpResult<NodeReply> {
            Err(Errno::NotFound(name.to_string()))
        }
    }

    #[test]
    fn negative_lookup_caches_for_the_configured_timeout() {
        let options = Options::builder().negative_timeout(Duration::from_secs(1)).build();
        let bridge = Bridge::new(Arc::new(EmptyRoot), Arc::new(NullNotifier), options);

        let entry = bridge.lookup(&ctx(), Ino::ROOT.get(), "missing").unwrap();
        assert_eq!(entry.ino, Ino::NULL);
        assert_eq!(entry.entry_timeout, Duration::from_secs(1));
    }

    #[test]
    fn negative_lookup_without_configured_timeout_propagates_error() {
        let bridge = Bridge::new(Arc::new(EmptyRoot), Arc::new(NullNotifier), Options::default());
        let err = bridge.lookup(&ctx(), Ino::ROOT.get(), "missing").unwrap_err();
        assert!(matches!(err, Errno::NotFound(_)));
    }

    #[test]
    #[should_panic(expected = "unknown inode number")]
    fn dispatch_against_unknown_inode_panics() {
        let bridge = Bridge::new(Arc::new(EmptyRoot), Arc::new(NullNotifier), Options::default());
        let _ = bridge.getattr(&ctx(), 999_999, None);
    }

    #[test]
    #[should_panic(expected = "reused with a mismatched file type")]
    fn reusing_an_inode_number_with_a_different_file_type_panics() {
        struct FlipFlopRoot {
            calls: std::sync::atomic::AtomicUsize,
        }
        impl Operations for FlipFlopRoot {
            fn capabilities(&self) -> Capabilities {
                Capabilities::LOOKUP
            }
            fn lookup(&self, _ctx: &RequestContext, _name: &str) -> OpResult<NodeReply> {
                let mode = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    crate::attr::S_IFDIR
                } else {
                    S_IFREG
                };
                Ok(NodeReply {
                    stable: StableAttr::new(42u64, mode, 0),
                    ops: Arc::new(EmptyRoot),
                    attr: Attr::default(),
                })
            }
        }
        let bridge = Bridge::new(
            Arc::new(FlipFlopRoot { calls: std::sync::atomic::AtomicUsize::new(0) }),
            Arc::new(NullNotifier),
            Options::default(),
        );
        let ctx = ctx();
        bridge.lookup(&ctx, Ino::ROOT.get(), "a").unwrap();
        bridge.lookup(&ctx, Ino::ROOT.get(), "b").unwrap();
    }
}
