//! Handle table: slot-reused allocation of kernel-visible file/directory
//! handles .
//!
//! Release has to wait for in-flight probes (the GETATTR-by-inode fallback
//! of the bridge dispatcher) without holding the bridge-wide lock for the whole wait — the
//! lock only guards the table's bookkeeping, never a blocking call. Callers
//! split release into [`HandleTable::begin_release`] (under the lock) and
//! [`ReleaseTicket::wait`] (outside it), then [`HandleTable::finish_release`]
//! (back under the lock) to actually free the slot.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::dirstream::{DirEntry, DirStream};
use crate::ops::Capabilities;

/// A kernel-visible handle number. `0` is reserved for "no handle".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fh(u64);

impl Fh {
    pub const NONE: Fh = Fh(0);

    pub const fn new(raw: u64) -> Self {
        Fh(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Fh {
    fn from(v: u64) -> Self {
        Fh(v)
    }
}

impl fmt::Display for Fh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rendezvous primitive: [`ReleaseTicket::wait`] blocks until every
/// in-flight probe started before release finishes.
#[derive(Default)]
struct WaitGroup {
    count: Mutex<u32>,
    cond: Condvar,
}

impl WaitGroup {
    fn enter(&self) {
        *self.count.lock() += 1;
    }

    fn leave(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    fn wait_until_idle(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// A single handle-table slot. Carries either a plain file handle marker, a
/// directory stream, or both, matching a handle slot.
pub struct FileEntry {
    /// Kernel-visible id of the inode this handle is bound to, kept so
    /// release can find the owning inode without a second map lookup.
    pub node_id: u64,
    /// Index of this handle's token within the owning inode's
    /// `open_handles`, so release is an O(1) swap-remove there.
    pub index_in_node: usize,
    pub capabilities: Capabilities,
    pub dir_stream: Option<Box<dyn DirStream>>,
    pub overflow: Option<DirEntry>,
    wait: Arc<WaitGroup>,
    releasing: bool,
}

impl FileEntry {
    pub fn new(node_id: u64, index_in_node: usize, capabilities: Capabilities) -> Self {
        Self {
            node_id,
            index_in_node,
            capabilities,
            dir_stream: None,
            overflow: None,
            wait: Arc::new(WaitGroup::default()),
            releasing: false,
        }
    }
}

/// Held while a probe (e.g. a handle-less GETATTR fallback) is in flight
/// against a handle; dropping it lets a concurrent release proceed.
pub struct ProbeGuard {
    wait: Arc<WaitGroup>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.wait.leave();
    }
}

/// First half of a release: obtained under the bridge lock, waited on
/// outside it.
pub struct ReleaseTicket {
    fh: Fh,
    wait: Arc<WaitGroup>,
}

impl ReleaseTicket {
    pub fn fh(&self) -> Fh {
        self.fh
    }

    /// Blocks until every probe that started before this ticket was issued
    /// has dropped its [`ProbeGuard`]. Must be called without holding the
    /// bridge-wide lock.
    pub fn wait(&self) {
        self.wait.wait_until_idle();
    }
}

/// Slot-reused allocator mapping kernel-visible handle numbers to
/// [`FileEntry`] slots.
pub struct HandleTable {
    slots: Vec<Option<FileEntry>>,
    free: Vec<u32>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Registers a new handle, reusing a freed slot (LIFO) when one exists.
    pub fn register(&mut self, entry: FileEntry) -> Fh {
        let index = if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(entry);
            index
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some(entry));
            index
        };
        // Kernel-visible handles are 1-based; 0 means "no handle".
        Fh::new(index as u64 + 1)
    }

    fn slot_index(fh: Fh) -> Option<usize> {
        if fh.is_none() {
            None
        } else {
            Some((fh.get() - 1) as usize)
        }
    }

    pub fn get(&self, fh: Fh) -> Option<&FileEntry> {
        Self::slot_index(fh).and_then(|i| self.slots.get(i)).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, fh: Fh) -> Option<&mut FileEntry> {
        Self::slot_index(fh).and_then(|i| self.slots.get_mut(i)).and_then(|s| s.as_mut())
    }

    /// Marks a probe as in-flight against `fh`. Returns `None` once release
    /// has begun for this handle, same as an unknown handle.
    pub fn probe(&self, fh: Fh) -> Option<ProbeGuard> {
        let entry = self.get(fh)?;
        if entry.releasing {
            return None;
        }
        entry.wait.enter();
        Some(ProbeGuard {
            wait: Arc::clone(&entry.wait),
        })
    }

    /// Marks `fh` as releasing (blocking any future probe) and hands back a
    /// ticket to wait on outside the lock. Idempotent-unsafe: call at most
    /// once per handle.
    pub fn begin_release(&mut self, fh: Fh) -> Option<ReleaseTicket> {
        let entry = self.get_mut(fh)?;
        entry.releasing = true;
        Some(ReleaseTicket {
            fh,
            wait: Arc::clone(&entry.wait),
        })
    }

    /// Removes the slot and pushes it onto the free list. Must only be
    /// called after [`ReleaseTicket::wait`] returned for this handle.
    pub fn finish_release(&mut self, fh: Fh) -> Option<FileEntry> {
        let index = Self::slot_index(fh)?;
        let entry = self.slots.get_mut(index).and_then(|s| s.take());
        if entry.is_some() {
            self.free.push(index as u32);
        }
        entry
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_release_reuses_slot() {
        let mut table = HandleTable::new();
        let fh1 = table.register(FileEntry::new(1, 0, Capabilities::empty()));
        assert!(!fh1.is_none());

        let ticket = table.begin_release(fh1).expect("entry present");
        ticket.wait();
        table.finish_release(fh1).expect("entry present");

        let fh2 = table.register(FileEntry::new(2, 0, Capabilities::empty()));
        assert_eq!(fh1, fh2, "freed slot should be reused (LIFO)");
    }

    #[test]
    fn release_waits_for_outstanding_probe() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;
        use std::time::Duration;

        let mut table = HandleTable::new();
        let fh = table.register(FileEntry::new(1, 0, Capabilities::empty()));
        let guard = table.probe(fh).expect("handle exists");

        let ticket = table.begin_release(fh).expect("handle exists");
        let released = Arc::new(AtomicBool::new(false));
        let released2 = Arc::clone(&released);
        let handle = thread::spawn(move || {
            ticket.wait();
            released2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst), "release must wait for the probe");

        drop(guard);
        handle.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
        table.finish_release(fh).expect("entry present");
    }

    #[test]
    fn probe_rejected_once_releasing() {
        let mut table = HandleTable::new();
        let fh = table.register(FileEntry::new(1, 0, Capabilities::empty()));
        let ticket = table.begin_release(fh).unwrap();
        assert!(table.probe(fh).is_none());
        ticket.wait();
        table.finish_release(fh);
    }
}
