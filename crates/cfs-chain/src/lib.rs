#![forbid(unsafe_code)]
//! The chain tree: reference-counted, versioned metadata/data nodes.
//!
//! A chain is a node in the copy-on-write tree, identified by its position
//! (parent plus key) and a block reference. The flush engine consumes
//! chains through the narrow surface here: flag test-and-set, upward
//! ONFLUSH propagation, CoW relocation (`modify`), check-code recompute,
//! and block-table insert/delete in a parent.
//!
//! # Locking
//!
//! Each chain carries two locks with distinct roles:
//!
//! - `core` — spin-style mutex protecting only the parent pointer and the
//!   ordered children collection. Held for pointer manipulation, never
//!   across a blocking acquisition.
//! - `content` — blocking exclusive lock over the block reference, data,
//!   and blockmap. Anything reading or rewriting content holds it.
//!
//! The flag word and the sticky error are atomics mutated without either
//! lock. Reference counts (`Arc`) are separate from locks: a reference
//! keeps a chain alive, a lock grants content access. To avoid lock-order
//! inversion, a thread holding a child's content lock must release it
//! before locking an ancestor; [`lock_parent_child`] packages the
//! release-then-relock-in-order discipline.

use bitflags::bitflags;
use cfs_block::Allocator;
use cfs_error::ErrorMask;
use cfs_trans::Pfs;
use cfs_types::{Blockref, BrefType, ChainKey, Tid, content_check};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

bitflags! {
    /// Chain state bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ChainFlags: u32 {
        /// Content is dirty and needs write-out.
        const MODIFIED    = 0x0001;
        /// The parent's block-table entry for this chain is stale.
        const UPDATE      = 0x0002;
        /// The subtree below contains dirty work.
        const ONFLUSH     = 0x0004;
        /// The subtree is being permanently removed.
        const DESTROY     = 0x0008;
        /// This chain currently occupies a slot in the parent's block table.
        const BLKMAPPED   = 0x0010;
        /// The occupied slot must be removed or changed (location moved).
        const BLKMAPUPD   = 0x0020;
        /// Root of a nested sub-filesystem.
        const PFSBOUNDARY = 0x0040;
        /// The volume header needs durable synchronization (device root only).
        const VOLUMESYNC  = 0x0080;
    }
}

impl ChainFlags {
    /// Bits that make a chain a candidate for the flush walk.
    pub const FLUSH_MASK: Self = Self::MODIFIED
        .union(Self::UPDATE)
        .union(Self::ONFLUSH)
        .union(Self::DESTROY);
}

/// Content guarded by the chain's blocking lock.
#[derive(Debug)]
pub struct ChainContent {
    pub bref: Blockref,
    pub data: Vec<u8>,
    /// Block table of children, present only on blockmap-bearing types.
    pub blockmap: BTreeMap<ChainKey, Blockref>,
}

#[derive(Debug, Default)]
struct ChainCore {
    parent: Option<Weak<Chain>>,
    children: BTreeMap<ChainKey, Arc<Chain>>,
}

/// A node in the copy-on-write tree.
#[derive(Debug)]
pub struct Chain {
    flags: AtomicU32,
    error: AtomicU32,
    pmp: Option<Arc<Pfs>>,
    core: Mutex<ChainCore>,
    content: Mutex<ChainContent>,
}

/// Tree destruction is iterative for the same reason the flush walk is:
/// chains can nest millions deep, and the default drop glue would
/// recurse once per level. Each node's children are drained into a
/// worklist before the node itself is released.
impl Drop for Chain {
    fn drop(&mut self) {
        let mut pending: Vec<Arc<Chain>> = std::mem::take(&mut self.core.get_mut().children)
            .into_values()
            .collect();
        while let Some(child) = pending.pop() {
            if let Some(mut child) = Arc::into_inner(child) {
                pending.extend(std::mem::take(&mut child.core.get_mut().children).into_values());
            }
        }
    }
}

impl Chain {
    /// Create a detached chain. `pmp` is the owning namespace, absent for
    /// the device-level roots.
    #[must_use]
    pub fn new(bref: Blockref, pmp: Option<Arc<Pfs>>) -> Arc<Self> {
        Arc::new(Self {
            flags: AtomicU32::new(0),
            error: AtomicU32::new(0),
            pmp,
            core: Mutex::new(ChainCore::default()),
            content: Mutex::new(ChainContent {
                bref,
                data: Vec::new(),
                blockmap: BTreeMap::new(),
            }),
        })
    }

    // ── Flags and sticky error ──────────────────────────────────────────

    #[must_use]
    pub fn flags(&self) -> ChainFlags {
        ChainFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Atomically set bits, returning the previous flags.
    pub fn set_flags(&self, bits: ChainFlags) -> ChainFlags {
        ChainFlags::from_bits_retain(self.flags.fetch_or(bits.bits(), Ordering::AcqRel))
    }

    /// Atomically clear bits, returning the previous flags.
    pub fn clear_flags(&self, bits: ChainFlags) -> ChainFlags {
        ChainFlags::from_bits_retain(self.flags.fetch_and(!bits.bits(), Ordering::AcqRel))
    }

    /// Sticky error from a prior I/O or validation failure.
    #[must_use]
    pub fn error(&self) -> ErrorMask {
        ErrorMask::from_bits(self.error.load(Ordering::Acquire))
    }

    /// Attach error bits (OR; sticky until a successful flush clears them).
    pub fn set_error(&self, mask: ErrorMask) {
        self.error.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    /// Clear the sticky error (successful re-validation or flush).
    pub fn clear_error(&self) {
        self.error.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn pmp(&self) -> Option<&Arc<Pfs>> {
        self.pmp.as_ref()
    }

    /// Whether this chain belongs to a mounted namespace. Boundary stops
    /// in the flush engine only apply to mounted namespaces.
    #[must_use]
    pub fn in_mounted_pfs(&self) -> bool {
        self.pmp.as_ref().is_some_and(|pfs| pfs.is_mounted())
    }

    // ── Topology ────────────────────────────────────────────────────────

    /// Current parent, if any. May change at any time once the core lock
    /// is released; callers detecting races compare with [`Chain::parent_is`].
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Chain>> {
        self.core.lock().parent.as_ref().and_then(Weak::upgrade)
    }

    /// Pointer-identity comparison of the current parent against a cached
    /// ancestor reference.
    #[must_use]
    pub fn parent_is(&self, cached: Option<&Arc<Chain>>) -> bool {
        let core = self.core.lock();
        match (&core.parent, cached) {
            (None, None) => true,
            (Some(weak), Some(arc)) => weak.upgrade().is_some_and(|p| Arc::ptr_eq(&p, arc)),
            _ => false,
        }
    }

    /// Key of this chain inside its parent's collections.
    #[must_use]
    pub fn key(&self) -> ChainKey {
        self.content.lock().bref.key
    }

    /// Link `child` under `parent`. The child must be detached.
    pub fn link_child(parent: &Arc<Chain>, child: &Arc<Chain>) {
        let key = child.key();
        {
            let mut core = child.core.lock();
            debug_assert!(core.parent.is_none(), "child already linked");
            core.parent = Some(Arc::downgrade(parent));
        }
        parent.core.lock().children.insert(key, Arc::clone(child));
    }

    /// Detach `child` from `parent`. The child keeps its flags; a chain
    /// with UPDATE set but no parent is meaningless and the flush engine
    /// clears it rather than retrying.
    pub fn unlink_child(parent: &Arc<Chain>, child: &Arc<Chain>) {
        parent.core.lock().children.remove(&child.key());
        let mut core = child.core.lock();
        if core
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|p| Arc::ptr_eq(&p, parent))
        {
            core.parent = None;
        }
    }

    /// Move `child` from its current parent under `new_parent`.
    pub fn reparent(child: &Arc<Chain>, new_parent: &Arc<Chain>) {
        if let Some(old) = child.parent() {
            Self::unlink_child(&old, child);
        }
        Self::link_child(new_parent, child);
    }

    /// Snapshot the children in key order.
    ///
    /// Taken under the core lock; each returned reference keeps the child
    /// alive while the caller iterates without the lock, and the caller
    /// must re-verify parentage per child before acting on it.
    #[must_use]
    pub fn children_snapshot(&self) -> Vec<Arc<Chain>> {
        self.core.lock().children.values().cloned().collect()
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.core.lock().children.len()
    }

    // ── Dirty-state transitions ─────────────────────────────────────────

    /// Mark the subtree-dirty hint on this chain and every ancestor.
    ///
    /// Stops early once an already-flagged ancestor is found, since the
    /// path above it must already be marked.
    pub fn setflush(self: &Arc<Self>) {
        let mut cur = Arc::clone(self);
        loop {
            let prev = cur.set_flags(ChainFlags::ONFLUSH);
            if prev.contains(ChainFlags::ONFLUSH) {
                break;
            }
            match cur.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
        }
    }

    /// Copy-on-write modify: relocate to fresh space, bump the content
    /// version, and mark dirty. Takes the content lock.
    pub fn modify(
        self: &Arc<Self>,
        alloc: &dyn Allocator,
        mtid: Tid,
    ) -> Result<(), ErrorMask> {
        let mut content = self.content.lock();
        self.modify_locked(&mut content, alloc, mtid)
    }

    /// [`Chain::modify`] for callers already holding the content lock.
    ///
    /// A chain relocates at most once per dirty cycle: re-modifying an
    /// already-MODIFIED chain only absorbs a newer `mtid`. On allocation
    /// failure nothing is mutated; the caller records the error and the
    /// chain's dirty state is unchanged.
    pub fn modify_locked(
        self: &Arc<Self>,
        content: &mut ChainContent,
        alloc: &dyn Allocator,
        mtid: Tid,
    ) -> Result<(), ErrorMask> {
        if self.flags().contains(ChainFlags::MODIFIED) {
            self.set_flags(ChainFlags::UPDATE);
            if content.bref.modify_tid < mtid {
                content.bref.modify_tid = mtid;
            }
            return Ok(());
        }

        let new_off = alloc.alloc(content.bref.bytes)?;

        let prev = self.set_flags(ChainFlags::MODIFIED | ChainFlags::UPDATE);
        if !prev.contains(ChainFlags::MODIFIED) {
            if let Some(pfs) = &self.pmp {
                pfs.memory_inc();
            }
        }
        if prev.contains(ChainFlags::BLKMAPPED) && content.bref.data_off != new_off {
            self.set_flags(ChainFlags::BLKMAPUPD);
        }
        content.bref.data_off = new_off;
        if content.bref.modify_tid < mtid {
            content.bref.modify_tid = mtid;
        }
        Ok(())
    }

    /// Recompute the content check code into the bref.
    pub fn setcheck(content: &mut ChainContent) {
        content.bref.check = content_check(&content.data);
    }

    /// Lock the content.
    #[must_use]
    pub fn lock_content(&self) -> MutexGuard<'_, ChainContent> {
        self.content.lock()
    }

    /// Replace the chain's data (writer path helper).
    pub fn set_data(&self, data: Vec<u8>) {
        let mut content = self.content.lock();
        content.bref.bytes = u32::try_from(data.len()).unwrap_or(u32::MAX);
        content.data = data;
    }

    /// Current bref snapshot.
    #[must_use]
    pub fn bref(&self) -> Blockref {
        self.content.lock().bref.clone()
    }

    #[must_use]
    pub fn bref_type(&self) -> BrefType {
        self.content.lock().bref.typ
    }
}

/// Acquire parent and child content locks in the required order.
///
/// The caller must hold neither lock. Taking both through this function is
/// the only sanctioned way to hold a parent/child pair, which rules out
/// the child-then-ancestor inversion.
#[must_use]
pub fn lock_parent_child<'a>(
    parent: &'a Chain,
    child: &'a Chain,
) -> (MutexGuard<'a, ChainContent>, MutexGuard<'a, ChainContent>) {
    let parent_guard = parent.lock_content();
    let child_guard = child.lock_content();
    (parent_guard, child_guard)
}

/// Insert or replace the child's entry in the parent's block table.
///
/// The parent's content lock must be held. Sets BLKMAPPED on the child.
pub fn base_insert(parent_content: &mut ChainContent, child: &Chain, bref: &Blockref) {
    parent_content.blockmap.insert(bref.key, bref.clone());
    child.set_flags(ChainFlags::BLKMAPPED);
}

/// Remove the child's entry from the parent's block table.
///
/// The parent's content lock must be held. Clears both blockmap bits on
/// the child.
pub fn base_delete(parent_content: &mut ChainContent, child: &Chain, key: ChainKey) {
    parent_content.blockmap.remove(&key);
    child.clear_flags(ChainFlags::BLKMAPPED | ChainFlags::BLKMAPUPD);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::BumpAllocator;

    fn leaf(key: u64) -> Arc<Chain> {
        Chain::new(Blockref::new(BrefType::Data, ChainKey(key)), None)
    }

    fn indirect(key: u64) -> Arc<Chain> {
        Chain::new(Blockref::new(BrefType::Indirect, ChainKey(key)), None)
    }

    #[test]
    fn setflush_marks_ancestors() {
        let root = indirect(0);
        let mid = indirect(1);
        let child = leaf(2);
        Chain::link_child(&root, &mid);
        Chain::link_child(&mid, &child);

        child.setflush();
        assert!(child.flags().contains(ChainFlags::ONFLUSH));
        assert!(mid.flags().contains(ChainFlags::ONFLUSH));
        assert!(root.flags().contains(ChainFlags::ONFLUSH));
    }

    #[test]
    fn setflush_stops_at_flagged_ancestor() {
        let root = indirect(0);
        let mid = indirect(1);
        let child = leaf(2);
        Chain::link_child(&root, &mid);
        Chain::link_child(&mid, &child);

        // Pre-flag the middle node; the walk must still terminate and the
        // root above an already-flagged node can rely on a prior walk.
        mid.set_flags(ChainFlags::ONFLUSH);
        child.setflush();
        assert!(child.flags().contains(ChainFlags::ONFLUSH));
    }

    #[test]
    fn modify_relocates_and_marks_dirty() {
        let alloc = BumpAllocator::new(4096, 1 << 20);
        let chain = leaf(1);
        chain.set_data(vec![1, 2, 3]);
        let before = chain.bref();

        chain.modify(&alloc, Tid(9)).expect("modify");
        let after = chain.bref();
        assert!(chain.flags().contains(ChainFlags::MODIFIED | ChainFlags::UPDATE));
        assert_ne!(after.data_off, before.data_off);
        assert_eq!(after.modify_tid, Tid(9));
    }

    #[test]
    fn modify_of_mapped_chain_requests_slot_update() {
        let alloc = BumpAllocator::new(4096, 1 << 20);
        let parent = indirect(0);
        let chain = leaf(1);
        Chain::link_child(&parent, &chain);
        chain.modify(&alloc, Tid(1)).expect("first modify");
        {
            let mut pc = parent.lock_content();
            let bref = chain.bref();
            base_insert(&mut pc, &chain, &bref);
        }
        assert!(chain.flags().contains(ChainFlags::BLKMAPPED));

        // Committed dirty cycle: MODIFIED disposed, blockmap entry live.
        chain.clear_flags(ChainFlags::MODIFIED);
        chain.modify(&alloc, Tid(2)).expect("second modify");
        assert!(chain.flags().contains(ChainFlags::BLKMAPUPD));
    }

    #[test]
    fn modify_failure_leaves_state_unchanged() {
        let alloc = BumpAllocator::new(0, 1 << 20);
        alloc.force_enospc(true);
        let chain = leaf(1);
        let before = chain.bref();
        let err = chain.modify(&alloc, Tid(3)).expect_err("enospc");
        assert_eq!(err, ErrorMask::ENOSPC);
        assert_eq!(chain.bref(), before);
        assert!(chain.flags().is_empty());
    }

    #[test]
    fn modify_counts_dirty_once_per_transition() {
        let pfs = Arc::new(Pfs::new("p"));
        let alloc = BumpAllocator::new(0, 1 << 20);
        let chain = Chain::new(
            Blockref::new(BrefType::Data, ChainKey(1)),
            Some(Arc::clone(&pfs)),
        );
        chain.modify(&alloc, Tid(1)).expect("modify");
        chain.modify(&alloc, Tid(2)).expect("remodify");
        assert_eq!(pfs.dirty_count(), 1);
    }

    #[test]
    fn base_insert_and_delete_flag_discipline() {
        let parent = indirect(0);
        let child = leaf(5);
        Chain::link_child(&parent, &child);
        child.set_flags(ChainFlags::BLKMAPUPD);

        let bref = child.bref();
        {
            let mut pc = parent.lock_content();
            base_insert(&mut pc, &child, &bref);
            assert!(pc.blockmap.contains_key(&ChainKey(5)));
        }
        assert!(child.flags().contains(ChainFlags::BLKMAPPED));

        {
            let mut pc = parent.lock_content();
            base_delete(&mut pc, &child, ChainKey(5));
            assert!(pc.blockmap.is_empty());
        }
        assert!(!child
            .flags()
            .intersects(ChainFlags::BLKMAPPED | ChainFlags::BLKMAPUPD));
    }

    #[test]
    fn deep_tree_drops_without_recursion() {
        let root = indirect(0);
        let mut cursor = Arc::clone(&root);
        for depth in 1..100_000u64 {
            let next = indirect(depth);
            Chain::link_child(&cursor, &next);
            cursor = next;
        }
        drop(cursor);
        // The whole spine unwinds here; recursion would blow the stack.
        drop(root);
    }

    #[test]
    fn parent_is_detects_reparent_race() {
        let a = indirect(0);
        let b = indirect(1);
        let child = leaf(2);
        Chain::link_child(&a, &child);
        assert!(child.parent_is(Some(&a)));

        Chain::reparent(&child, &b);
        assert!(!child.parent_is(Some(&a)));
        assert!(child.parent_is(Some(&b)));
        assert_eq!(a.child_count(), 0);
        assert_eq!(b.child_count(), 1);
    }

    #[test]
    fn children_snapshot_is_key_ordered() {
        let parent = indirect(0);
        for key in [30_u64, 10, 20] {
            let child = leaf(key);
            Chain::link_child(&parent, &child);
        }
        let keys: Vec<u64> = parent
            .children_snapshot()
            .iter()
            .map(|c| c.key().0)
            .collect();
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[test]
    fn sticky_error_accumulates() {
        let chain = leaf(1);
        chain.set_error(ErrorMask::EIO);
        chain.set_error(ErrorMask::CHECK);
        assert_eq!(chain.error(), ErrorMask::EIO | ErrorMask::CHECK);
        chain.clear_error();
        assert!(chain.error().is_ok());
    }
}
