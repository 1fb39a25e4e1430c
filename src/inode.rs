//! The in-memory inode graph: a DAG over directories (single parent)
//! and regular files (multiple parents via hard links), reference-counted
//! by kernel lookups.
//!
//! Both the `children` and `parents` edges are strong `Arc`s — the design
//! notes call this out explicitly: destruction is driven by the explicit
//! predicate in [`InodeState::destroyable`], not by Rust's ordinary `Drop`
//! cycle handling. A well-formed filesystem tree never creates a strong
//! reference cycle (a directory cannot be its own descendant), so this is
//! safe in practice.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::error;

use crate::attr::{Ino, StableAttr};
use crate::handle::Fh;
use crate::notify::Notifier;
use crate::ops::Operations;

/// Sentinel returned by [`Inode::path_from`] for an orphaned node.
pub const DELETED_PATH: &str = "(deleted)";

struct InodeInner {
    stable: StableAttr,
    ops: Arc<dyn Operations>,
    persistent: std::sync::atomic::AtomicBool,
    notifier: Arc<dyn Notifier>,
    state: Mutex<InodeState>,
    /// Fired, at most once, with this inode's number when it is destroyed.
    /// Set by whatever owns the id table (the bridge) so destruction here
    /// can evict the corresponding entry there without this module knowing
    /// anything about the bridge.
    destroy_hook: Mutex<Option<Box<dyn Fn(Ino) + Send + Sync>>>,
}

/// The mutable, lock-protected part of an inode: everything the data model
/// groups under the per-inode mutex.
#[derive(Default)]
pub struct InodeState {
    pub children: HashMap<String, Inode>,
    pub parents: HashSet<ParentData>,
    pub lookup_count: u64,
    pub change_counter: u64,
    pub open_handles: Vec<Fh>,
}

impl InodeState {
    fn destroyable(&self, persistent: bool) -> bool {
        !persistent && self.lookup_count == 0 && self.children.is_empty() && self.parents.is_empty()
    }
}

/// A tree node. Cheaply `Clone`-able (an `Arc` underneath); equality and
/// hashing are by identity, not by content, since two distinct `Inode`
/// values must never alias the same stable inode number (the data model's identity
/// invariant is enforced by the bridge's `id_table`, not by this type).
#[derive(Clone)]
pub struct Inode(Arc<InodeInner>);

impl Inode {
    pub fn new(stable: StableAttr, ops: Arc<dyn Operations>, persistent: bool, notifier: Arc<dyn Notifier>) -> Self {
        Inode(Arc::new(InodeInner {
            stable,
            ops,
            persistent: std::sync::atomic::AtomicBool::new(persistent),
            notifier,
            state: Mutex::new(InodeState::default()),
            destroy_hook: Mutex::new(None),
        }))
    }

    /// Registers the callback fired once when this node is destroyed. A
    /// second call replaces the first; only one owner is expected to set
    /// this (the bridge, right after constructing the node).
    pub fn set_destroy_hook(&self, hook: impl Fn(Ino) + Send + Sync + 'static) {
        *self.0.destroy_hook.lock() = Some(Box::new(hook));
    }

    pub fn notify_entry(&self, name: &str) {
        self.notifier().notify_entry(self.ino(), name);
    }

    pub fn notify_content(&self, offset: i64, len: i64) {
        self.notifier().notify_content(self.ino(), offset, len);
    }

    pub fn stable(&self) -> StableAttr {
        self.0.stable
    }

    pub fn ino(&self) -> Ino {
        self.0.stable.ino
    }

    pub fn ops(&self) -> &Arc<dyn Operations> {
        &self.0.ops
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.0.notifier
    }

    pub fn is_persistent(&self) -> bool {
        self.0.persistent.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn set_persistent(&self, value: bool) {
        self.0.persistent.store(value, std::sync::atomic::Ordering::Release);
    }

    pub fn is_dir(&self) -> bool {
        self.0.stable.is_dir()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const u8 as usize
    }

    fn ptr_eq(a: &Inode, b: &Inode) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.0.state.lock()
    }

    pub fn lookup_count(&self) -> u64 {
        self.lock().lookup_count
    }

    pub fn change_counter(&self) -> u64 {
        self.lock().change_counter
    }

    pub fn children_snapshot(&self) -> Vec<(String, Inode)> {
        let state = self.lock();
        let mut items: Vec<(String, Inode)> =
            state.children.iter().map(|(n, c)| (n.clone(), c.clone())).collect();
        // Deterministic order despite hash-table nondeterminism: by the
        // child's stable inode number, matching the inode graph's "smallest node
        // address" reproducibility requirement without leaking raw
        // addresses into the ordering.
        items.sort_by_key(|(_, child)| child.ino().get());
        items
    }

    pub fn parents_snapshot(&self) -> Vec<ParentData> {
        self.lock().parents.iter().cloned().collect()
    }

    pub fn open_handles_snapshot(&self) -> Vec<Fh> {
        self.lock().open_handles.clone()
    }

    pub fn register_open_handle(&self, fh: Fh) -> usize {
        let mut state = self.lock();
        state.open_handles.push(fh);
        state.open_handles.len() - 1
    }

    /// O(1) swap-remove of an open handle by its recorded index.
    pub fn unregister_open_handle(&self, index: usize) {
        let mut state = self.lock();
        if index < state.open_handles.len() {
            state.open_handles.swap_remove(index);
        }
    }

    /// `/`-separated path from `root` to `self`, following any parent
    /// chain. Returns [`DELETED_PATH`] if this node has become orphaned.
    pub fn path_from(&self, root: &Inode) -> String {
        if Inode::ptr_eq(self, root) {
            return String::new();
        }
        let mut segments = Vec::new();
        let mut current = self.clone();
        loop {
            let parent_link = {
                let state = current.lock();
                state.parents.iter().next().cloned()
            };
            match parent_link {
                None => return DELETED_PATH.to_string(),
                Some(link) => {
                    segments.push(link.name.clone());
                    if Inode::ptr_eq(&link.parent, root) {
                        segments.reverse();
                        return segments.join("/");
                    }
                    current = link.parent;
                }
            }
        }
    }

    fn destroy_if_eligible(self) {
        let eligible = {
            let state = self.lock();
            state.destroyable(self.is_persistent())
        };
        if eligible {
            self.ops().on_forget();
            if let Some(hook) = self.0.destroy_hook.lock().take() {
                hook(self.ino());
            }
        }
    }
}

impl PartialEq for Inode {
    fn eq(&self, other: &Self) -> bool {
        Inode::ptr_eq(self, other)
    }
}

impl Eq for Inode {}

impl Hash for Inode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Inode(ino={})", self.ino())
    }
}

/// The `{name, parent}` pair through which a child is reachable from one of
/// its parents. Equality is by both components.
#[derive(Clone)]
pub struct ParentData {
    pub name: String,
    pub parent: Inode,
}

impl PartialEq for ParentData {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Inode::ptr_eq(&self.parent, &other.parent)
    }
}

impl Eq for ParentData {}

impl Hash for ParentData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.parent.addr().hash(state);
    }
}

/// Locks a deduplicated, address-sorted set of inodes for the duration of a
/// multi-inode tree mutation, precluding deadlock regardless of call order
/// (the inode graph's "ordered-pair locking", generalized to up to four inodes for
/// exchange).
struct LockSet<'a> {
    order: Vec<&'a Inode>,
    guards: Vec<MutexGuard<'a, InodeState>>,
}

impl<'a> LockSet<'a> {
    fn new(inodes: &[&'a Inode]) -> Self {
        let mut order: Vec<&'a Inode> = Vec::new();
        for &i in inodes {
            if !order.iter().any(|u| Inode::ptr_eq(u, i)) {
                order.push(i);
            }
        }
        order.sort_by_key(|i| i.addr());
        let guards = order.iter().map(|i| i.lock()).collect();
        LockSet { order, guards }
    }

    fn get(&mut self, inode: &Inode) -> &mut InodeState {
        let idx = self
            .order
            .iter()
            .position(|u| Inode::ptr_eq(u, inode))
            .expect("inode was locked by this LockSet");
        &mut self.guards[idx]
    }
}

fn remove_parent_link(state: &mut InodeState, parent: &Inode, name: &str) {
    state.parents.retain(|p| !(p.name == name && Inode::ptr_eq(&p.parent, parent)));
}

fn add_parent_link(state: &mut InodeState, parent: &Inode, name: &str) {
    state.parents.insert(ParentData {
        name: name.to_string(),
        parent: parent.clone(),
    });
}

/// Inserts or replaces `name` in `parent.children`. If a different child
/// was present its parent link is dropped and, if it becomes eligible, it
/// is destroyed.
pub fn set_entry(parent: &Inode, name: &str, child: &Inode) {
    let mut displaced = None;
    {
        let mut locks = LockSet::new(&[parent, child]);
        let old = locks.get(parent).children.insert(name.to_string(), child.clone());
        locks.get(parent).change_counter += 1;
        add_parent_link(locks.get(child), parent, name);
        locks.get(child).change_counter += 1;
        if let Some(old_child) = old {
            if !Inode::ptr_eq(&old_child, child) {
                displaced = Some(old_child);
            }
        }
    }
    if let Some(old_child) = displaced {
        let eligible = {
            let mut locks = LockSet::new(&[parent, &old_child]);
            remove_parent_link(locks.get(&old_child), parent, name);
            locks.get(&old_child).destroyable(old_child.is_persistent())
        };
        if eligible {
            old_child.destroy_if_eligible();
        }
    }
}

/// Removes `name` from `parent.children`; destroys the child if it just
/// lost its last parent and has no outstanding lookups.
pub fn rm_child(parent: &Inode, name: &str) -> Option<Inode> {
    let mut locks = LockSet::new(&[parent]);
    let removed = locks.get(parent).children.remove(name);
    locks.get(parent).change_counter += 1;
    drop(locks);

    if let Some(child) = removed.clone() {
        let eligible = {
            let mut locks = LockSet::new(&[parent, &child]);
            remove_parent_link(locks.get(&child), parent, name);
            locks.get(&child).change_counter += 1;
            locks.get(&child).destroyable(child.is_persistent())
        };
        if eligible {
            child.clone().destroy_if_eligible();
        }
        child.notifier().notify_delete(parent.ino(), child.ino(), name);
    }
    removed
}

/// Atomic move of a child from `(parent, name)` to `(new_parent, new_name)`.
/// Returns `Err(())` if `overwrite` is false and the destination exists.
///
/// The children-map and parents-set mutations happen inside a single
/// [`LockSet`] covering every inode involved, so no observer can see the new
/// link before the old one is gone or the moved child's `parents` before it
/// reflects the move. Which inodes that set must cover (the moved child, and
/// any displaced destination) isn't known until the parents' `children` maps
/// are inspected, so a short lock-free peek picks candidates first; the peek
/// is re-validated once the real lock set is held, retrying if a concurrent
/// mutation made it stale.
pub fn mv_child(parent: &Inode, name: &str, new_parent: &Inode, new_name: &str, overwrite: bool) -> Result<(), ()> {
    loop {
        let child = match parent.children_snapshot().into_iter().find(|(n, _)| n == name) {
            Some((_, c)) => c,
            None => return Err(()),
        };
        let existing_dest = new_parent
            .children_snapshot()
            .into_iter()
            .find(|(n, _)| n == new_name)
            .map(|(_, c)| c);
        if existing_dest.is_some() && !overwrite {
            return Err(());
        }

        let mut participants = vec![parent, new_parent, &child];
        if let Some(dest) = &existing_dest {
            participants.push(dest);
        }
        let mut locks = LockSet::new(&participants);

        let child_still_there = locks
            .get(parent)
            .children
            .get(name)
            .is_some_and(|c| Inode::ptr_eq(c, &child));
        let dest_now = locks.get(new_parent).children.get(new_name).cloned();
        let dest_matches = match (&existing_dest, &dest_now) {
            (None, None) => true,
            (Some(expected), Some(actual)) => Inode::ptr_eq(expected, actual),
            _ => false,
        };
        if !child_still_there || !dest_matches {
            continue;
        }

        locks.get(parent).children.remove(name);
        locks.get(parent).change_counter += 1;
        locks.get(new_parent).children.insert(new_name.to_string(), child.clone());
        locks.get(new_parent).change_counter += 1;
        remove_parent_link(locks.get(&child), parent, name);
        add_parent_link(locks.get(&child), new_parent, new_name);
        locks.get(&child).change_counter += 1;

        let mut displaced = None;
        if let Some(dest) = existing_dest.clone() {
            if !Inode::ptr_eq(&dest, &child) {
                remove_parent_link(locks.get(&dest), new_parent, new_name);
                locks.get(&dest).change_counter += 1;
                displaced = Some(dest);
            }
        }
        drop(locks);
        if let Some(old) = displaced {
            old.destroy_if_eligible();
        }
        return Ok(());
    }
}

/// Atomic swap of two children between (possibly identical) parents. Both
/// names must already exist. Like [`mv_child`], every mutation happens
/// inside one [`LockSet`] so the two links are never observed half-swapped.
pub fn exchange_child(parent1: &Inode, name1: &str, parent2: &Inode, name2: &str) -> Result<(), ()> {
    loop {
        let child1 = match parent1.children_snapshot().into_iter().find(|(n, _)| n == name1) {
            Some((_, c)) => c,
            None => return Err(()),
        };
        let child2 = match parent2.children_snapshot().into_iter().find(|(n, _)| n == name2) {
            Some((_, c)) => c,
            None => return Err(()),
        };

        let mut locks = LockSet::new(&[parent1, parent2, &child1, &child2]);
        let c1_matches = locks
            .get(parent1)
            .children
            .get(name1)
            .is_some_and(|c| Inode::ptr_eq(c, &child1));
        let c2_matches = locks
            .get(parent2)
            .children
            .get(name2)
            .is_some_and(|c| Inode::ptr_eq(c, &child2));
        if !c1_matches || !c2_matches {
            continue;
        }

        locks.get(parent1).children.insert(name1.to_string(), child2.clone());
        locks.get(parent2).children.insert(name2.to_string(), child1.clone());
        locks.get(parent1).change_counter += 1;
        locks.get(parent2).change_counter += 1;
        remove_parent_link(locks.get(&child1), parent1, name1);
        add_parent_link(locks.get(&child1), parent2, name2);
        locks.get(&child1).change_counter += 1;
        remove_parent_link(locks.get(&child2), parent2, name2);
        add_parent_link(locks.get(&child2), parent1, name1);
        locks.get(&child2).change_counter += 1;
        return Ok(());
    }
}

/// Increments `child.lookup_count` and links it at `(parent, name)`. Panics
/// if `child.stable.ino` is a reserved value being assigned to a non-root
/// node — that is a programming error in the caller (the bridge), per
/// the error taxonomy.
pub fn add_new_child(parent: &Inode, name: &str, child: &Inode) {
    if child.ino().is_reserved() {
        error!(ino = %child.ino(), "attempted to link a node with a reserved inode number");
        panic!("reserved inode number used for a live node");
    }
    let mut locks = LockSet::new(&[parent, child]);
    locks.get(parent).children.insert(name.to_string(), child.clone());
    locks.get(parent).change_counter += 1;
    add_parent_link(locks.get(child), parent, name);
    locks.get(child).lookup_count += 1;
    locks.get(child).change_counter += 1;
}

/// Decrements `lookup_count` by `n` (the FORGET path) and destroys the node
/// if it becomes eligible.
pub fn remove_ref(node: &Inode, n: u64) {
    let eligible = {
        let mut locks = LockSet::new(&[node]);
        let state = locks.get(node);
        state.lookup_count = state.lookup_count.saturating_sub(n);
        state.destroyable(node.is_persistent())
    };
    if eligible {
        node.clone().destroy_if_eligible();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::S_IFDIR;
    use crate::attr::S_IFREG;
    use crate::notify::NullNotifier;
    use crate::ops::Operations;

    struct NoopOps;
    impl Operations for NoopOps {}

    fn make_dir(ino: u64) -> Inode {
        Inode::new(
            StableAttr::new(ino, S_IFDIR, 0),
            Arc::new(NoopOps),
            false,
            Arc::new(NullNotifier),
        )
    }

    fn make_file(ino: u64) -> Inode {
        Inode::new(
            StableAttr::new(ino, S_IFREG, 0),
            Arc::new(NoopOps),
            false,
            Arc::new(NullNotifier),
        )
    }

    #[test]
    fn hard_link_equality_scenario() {
        // The same stable inode linked from two directories must resolve to
        // the same Inode object, with lookup_count incremented once per link.
        let root = make_dir(1);
        let dir1 = make_dir(2);
        let dir2 = make_dir(3);
        set_entry(&root, "dir1", &dir1);
        set_entry(&root, "dir2", &dir2);

        let file = make_file(7);
        add_new_child(&dir1, "file", &file);
        add_new_child(&dir2, "file", &file);

        assert_eq!(file.lookup_count(), 2);
        let parents = file.parents_snapshot();
        assert_eq!(parents.len(), 2);
        assert!(parents.iter().any(|p| p.name == "file" && Inode::ptr_eq(&p.parent, &dir1)));
        assert!(parents.iter().any(|p| p.name == "file" && Inode::ptr_eq(&p.parent, &dir2)));
    }

    #[test]
    fn forget_accounting_keeps_linked_node_alive() {
        // FORGET only touches lookup_count; it never removes parent links.
        let root = make_dir(1);
        let dir1 = make_dir(2);
        let dir2 = make_dir(3);
        set_entry(&root, "dir1", &dir1);
        set_entry(&root, "dir2", &dir2);
        let file = make_file(7);
        add_new_child(&dir1, "file", &file);
        add_new_child(&dir2, "file", &file);

        remove_ref(&file, 2);

        assert_eq!(file.lookup_count(), 0);
        assert_eq!(file.parents_snapshot().len(), 2, "unlink/rename remove links, not forget");
    }

    #[test]
    fn exchange_swaps_parent_links() {
        let root = make_dir(1);
        let x = make_file(10);
        let y = make_file(11);
        set_entry(&root, "a", &x);
        set_entry(&root, "b", &y);

        exchange_child(&root, "a", &root, "b").unwrap();

        let children = root.children_snapshot();
        let a = children.iter().find(|(n, _)| n == "a").unwrap();
        let b = children.iter().find(|(n, _)| n == "b").unwrap();
        assert!(Inode::ptr_eq(&a.1, &y));
        assert!(Inode::ptr_eq(&b.1, &x));

        assert!(x.parents_snapshot().iter().any(|p| p.name == "b"));
        assert!(!x.parents_snapshot().iter().any(|p| p.name == "a"));
        assert!(y.parents_snapshot().iter().any(|p| p.name == "a"));
        assert!(!y.parents_snapshot().iter().any(|p| p.name == "b"));
    }

    #[test]
    fn rename_moves_child_and_updates_links() {
        let root = make_dir(1);
        let p1 = make_dir(2);
        let p2 = make_dir(3);
        set_entry(&root, "p1", &p1);
        set_entry(&root, "p2", &p2);
        let f = make_file(10);
        set_entry(&p1, "n1", &f);

        mv_child(&p1, "n1", &p2, "n2", false).unwrap();

        assert!(p1.children_snapshot().is_empty());
        assert_eq!(p2.children_snapshot().len(), 1);
        let parents = f.parents_snapshot();
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].name, "n2");
        assert!(Inode::ptr_eq(&parents[0].parent, &p2));
    }

    #[test]
    fn rename_without_overwrite_rejects_existing_destination() {
        let root = make_dir(1);
        let a = make_file(10);
        let b = make_file(11);
        set_entry(&root, "a", &a);
        set_entry(&root, "b", &b);
        assert!(mv_child(&root, "a", &root, "b", false).is_err());
    }

    #[test]
    fn unlink_destroys_orphaned_non_persistent_node() {
        let root = make_dir(1);
        let g = make_file(20);
        set_entry(&root, "g", &g);
        let removed = rm_child(&root, "g");
        assert!(removed.is_some());
        assert!(g.parents_snapshot().is_empty());
    }

    #[test]
    fn unlink_keeps_node_alive_while_other_links_remain() {
        let root = make_dir(1);
        let dir1 = make_dir(2);
        let dir2 = make_dir(3);
        set_entry(&root, "dir1", &dir1);
        set_entry(&root, "dir2", &dir2);
        let f = make_file(10);
        set_entry(&dir1, "f", &f);
        set_entry(&dir2, "f", &f);

        rm_child(&dir1, "f");

        assert_eq!(f.parents_snapshot().len(), 1);
        assert!(f.parents_snapshot()[0].name == "f");
    }

    #[test]
    fn path_from_root_reconstructs_path() {
        let root = make_dir(1);
        let a = make_dir(2);
        let b = make_file(3);
        set_entry(&root, "a", &a);
        set_entry(&a, "b", &b);
        assert_eq!(b.path_from(&root), "a/b");
    }

    #[test]
    fn path_from_root_on_orphan_is_sentinel() {
        let root = make_dir(1);
        let f = make_file(2);
        // never attached to the tree
        assert_eq!(f.path_from(&root), DELETED_PATH);
    }

    #[test]
    fn directory_has_at_most_one_parent_by_construction() {
        // The API never offers a way to give a directory two parent links;
        // set_entry on a second parent would just orphan it from the first
        // once moved, never duplicate the link for a directory.
        let root = make_dir(1);
        let p1 = make_dir(2);
        let p2 = make_dir(3);
        let d = make_dir(4);
        set_entry(&root, "p1", &p1);
        set_entry(&root, "p2", &p2);
        set_entry(&p1, "d", &d);
        mv_child(&p1, "d", &p2, "d", false).unwrap();
        assert_eq!(d.parents_snapshot().len(), 1);
    }

    #[test]
    fn notify_entry_and_notify_content_delegate_to_notifier() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingNotifier {
            entry_calls: AtomicUsize,
            content_calls: AtomicUsize,
        }
        impl Notifier for CountingNotifier {
            fn notify_entry(&self, _parent: Ino, _name: &str) {
                self.entry_calls.fetch_add(1, Ordering::SeqCst);
            }
            fn notify_content(&self, _ino: Ino, _offset: i64, _len: i64) {
                self.content_calls.fetch_add(1, Ordering::SeqCst);
            }
            fn notify_delete(&self, _parent: Ino, _child: Ino, _name: &str) {}
        }

        let notifier = Arc::new(CountingNotifier {
            entry_calls: AtomicUsize::new(0),
            content_calls: AtomicUsize::new(0),
        });
        let file = Inode::new(StableAttr::new(5, S_IFREG, 0), Arc::new(NoopOps), false, notifier.clone());

        file.notify_entry("name");
        file.notify_content(0, 10);

        assert_eq!(notifier.entry_calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.content_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_set_entry_from_many_threads_is_consistent() {
        use std::thread;

        let root = Arc::new(make_dir(1));
        let mut handles = Vec::new();
        for i in 0..50u64 {
            let root = Arc::clone(&root);
            handles.push(thread::spawn(move || {
                let child = make_file(1000 + i);
                set_entry(&root, &format!("f{i}"), &child);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(root.children_snapshot().len(), 50);
    }
}
