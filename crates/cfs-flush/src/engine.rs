//! Core flush walk: top-down search for dirty work, bottom-up commit.
//!
//! The walk is driven by an explicit worklist of frames instead of
//! recursion. A frame visits its chain twice: a `Descend` phase does the
//! cheap flag checks and queues the children, and a `Commit` phase runs
//! after every queued child has fully committed, finalizing this chain's
//! media state and propagating its block reference into the parent's
//! block table. The worklist is LIFO, so children always commit before
//! the parent's commit frame surfaces again.

use std::sync::Arc;

use bitflags::bitflags;

use cfs_chain::{base_delete, base_insert, lock_parent_child, Chain, ChainContent, ChainFlags};
use cfs_error::ErrorMask;
use cfs_types::{BrefType, Tid};

use crate::device::Device;

bitflags! {
    /// Mode flags for one flush pass. The chain handed to [`flush`] is
    /// always treated as the top of the pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlushFlags: u32 {
        /// Marks the entry chain as the top of the pass.
        const TOP        = 0x0001;
        /// Cross namespace and inode boundaries (device-wide recovery).
        const ALL        = 0x0002;
        /// Stop descending at inode boundaries below the top.
        const INODE_STOP = 0x0004;
        /// Filesystem-wide sync: inode block-table updates are not
        /// deferred, and the inode-index ranges of namespace roots are
        /// included in the walk.
        const FSSYNC     = 0x0008;
    }
}

// The worklist is heap-allocated; this budget only catches runaway or
// corrupted topologies.
const FLUSH_DEPTH_LIMIT: usize = 1 << 20;

#[derive(Debug)]
struct FlushInfo {
    error: ErrorMask,
    visited: u64,
}

#[derive(Clone)]
struct Frame {
    chain: Arc<Chain>,
    parent: Option<Arc<Chain>>,
    depth: usize,
    top: bool,
}

enum Phase {
    Descend,
    Commit {
        rescanned: bool,
        /// Cumulative error mask stashed when the scan under this chain
        /// began; `info.error` holds only scan-local bits until commit
        /// folds the stash back in.
        error_stash: ErrorMask,
    },
}

/// Flush the subtree rooted at `chain`.
///
/// Retries the whole pass when the top chain is reparented mid-flush,
/// refreshing the cached parent reference each time. Returns the
/// accumulated error mask; partial progress is kept and re-marked so a
/// later pass finds whatever could not be committed.
pub fn flush(dev: &Device, chain: &Arc<Chain>, flags: FlushFlags) -> ErrorMask {
    flush_with_limit(dev, chain, flags, FLUSH_DEPTH_LIMIT)
}

fn flush_with_limit(
    dev: &Device,
    chain: &Arc<Chain>,
    flags: FlushFlags,
    depth_limit: usize,
) -> ErrorMask {
    let mut info = FlushInfo {
        error: ErrorMask::NONE,
        visited: 0,
    };
    let mut parent = chain.parent();
    let mut loops: u64 = 0;
    loop {
        if !chain.parent_is(parent.as_ref()) {
            tracing::debug!(
                target: "cfs::flush",
                "flush top reparented; refreshing cached parent"
            );
            parent = chain.parent();
        }
        if !flush_core(dev, &mut info, chain, parent.clone(), flags, depth_limit) {
            break;
        }
        loops += 1;
        if loops % 1000 == 0 {
            tracing::warn!(
                target: "cfs::flush",
                loops,
                "flush retrying excessively; topology churn above the flush top"
            );
        }
    }
    tracing::debug!(
        target: "cfs::flush",
        visited = info.visited,
        error = %info.error,
        "flush pass done"
    );
    info.error
}

/// One full pass over the subtree. Returns `true` when the top chain was
/// reparented mid-pass and the caller should retry with a fresh parent.
fn flush_core(
    dev: &Device,
    info: &mut FlushInfo,
    chain: &Arc<Chain>,
    parent: Option<Arc<Chain>>,
    flags: FlushFlags,
    depth_limit: usize,
) -> bool {
    let mut retry = false;
    let mut stack: Vec<(Frame, Phase)> = vec![(
        Frame {
            chain: Arc::clone(chain),
            parent,
            depth: 0,
            top: true,
        },
        Phase::Descend,
    )];
    while let Some((frame, phase)) = stack.pop() {
        match phase {
            Phase::Descend => descend(dev, info, &mut stack, &frame, flags, depth_limit),
            Phase::Commit {
                rescanned,
                error_stash,
            } => {
                let lost = commit(dev, info, &mut stack, &frame, rescanned, error_stash, flags);
                if lost && frame.top {
                    retry = true;
                }
            }
        }
    }
    retry
}

fn push_children(stack: &mut Vec<(Frame, Phase)>, frame: &Frame) {
    // Reverse so the worklist pops children in key order.
    for child in frame.chain.children_snapshot().into_iter().rev() {
        stack.push((
            Frame {
                chain: child,
                parent: Some(Arc::clone(&frame.chain)),
                depth: frame.depth + 1,
                top: false,
            },
            Phase::Descend,
        ));
    }
}

fn descend(
    dev: &Device,
    info: &mut FlushInfo,
    stack: &mut Vec<(Frame, Phase)>,
    frame: &Frame,
    flags: FlushFlags,
    depth_limit: usize,
) {
    info.visited += 1;
    let chain = &frame.chain;

    if !frame.top {
        let Some(parent) = frame.parent.as_ref() else {
            return;
        };
        // Structural race: the child moved while we walked the snapshot.
        if !chain.parent_is(Some(parent)) {
            tracing::warn!(
                target: "cfs::flush",
                key = chain.key().0,
                "child reparented during flush scan; skipping"
            );
            return;
        }
        let err = chain.error();
        if !err.is_ok() {
            tracing::warn!(
                target: "cfs::flush",
                key = chain.key().0,
                error = %err,
                "skipping errored chain in flush scan"
            );
            info.error |= err;
            return;
        }
        if parent.flags().contains(ChainFlags::DESTROY) {
            chain.set_flags(ChainFlags::DESTROY);
        }
        // Inode-index entries on a namespace root only flush with the
        // filesystem-wide sync; re-mark the root so that sync finds them.
        let pbref = parent.bref();
        if pbref.is_pfsroot()
            && pbref.typ == BrefType::Inode
            && !chain.flags().contains(ChainFlags::DESTROY)
            && !flags.contains(FlushFlags::FSSYNC)
            && !dev.policy().inode_index_visible(chain.key())
        {
            if chain.flags().intersects(ChainFlags::FLUSH_MASK) {
                parent.setflush();
            }
            return;
        }
    }

    let cflags = chain.flags();
    if !cflags.intersects(ChainFlags::FLUSH_MASK) {
        return;
    }

    // Boundary stops apply to mounted namespaces only, never to the top
    // chain of the pass.
    if cflags.contains(ChainFlags::PFSBOUNDARY)
        && !flags.contains(FlushFlags::ALL)
        && !frame.top
        && chain.in_mounted_pfs()
    {
        if cflags.intersects(ChainFlags::ONFLUSH | ChainFlags::DESTROY | ChainFlags::MODIFIED) {
            if let Some(parent) = frame.parent.as_ref() {
                parent.setflush();
            }
        }
        return;
    }
    if chain.bref_type() == BrefType::Inode
        && flags.contains(FlushFlags::INODE_STOP)
        && !flags.contains(FlushFlags::ALL)
        && !frame.top
        && chain.in_mounted_pfs()
    {
        return;
    }

    if frame.depth >= depth_limit {
        tracing::warn!(
            target: "cfs::flush",
            depth = frame.depth,
            "flush depth budget exceeded; subtree left dirty"
        );
        info.error |= ErrorMask::TOO_DEEP;
        chain.setflush();
        return;
    }

    if cflags.intersects(ChainFlags::ONFLUSH | ChainFlags::DESTROY) {
        chain.clear_flags(ChainFlags::ONFLUSH);
        stack.push((
            frame.clone(),
            Phase::Commit {
                rescanned: false,
                error_stash: info.error,
            },
        ));
        info.error = ErrorMask::NONE;
        push_children(stack, frame);
    } else {
        // Only this chain's own state is dirty; nothing below to search.
        stack.push((
            frame.clone(),
            Phase::Commit {
                rescanned: true,
                error_stash: info.error,
            },
        ));
        info.error = ErrorMask::NONE;
    }
}

/// Finalize one chain after its children committed. Returns `true` when
/// the chain was reparented between the scan and the relock.
#[allow(clippy::too_many_arguments)]
fn commit(
    dev: &Device,
    info: &mut FlushInfo,
    stack: &mut Vec<(Frame, Phase)>,
    frame: &Frame,
    rescanned: bool,
    error_stash: ErrorMask,
    flags: FlushFlags,
) -> bool {
    let chain = &frame.chain;

    // New dirt may have been queued below while we were scanning; a
    // single rescan picks it up before this chain commits. The stash
    // stays put; `info.error` keeps accumulating scan-local bits.
    if !rescanned && chain.flags().contains(ChainFlags::ONFLUSH) {
        chain.clear_flags(ChainFlags::ONFLUSH);
        stack.push((
            frame.clone(),
            Phase::Commit {
                rescanned: true,
                error_stash,
            },
        ));
        push_children(stack, frame);
        return false;
    }

    // Any child error at all, new or repeated, re-marks this chain so
    // the stranded subtree stays discoverable by the next pass.
    if !info.error.is_ok() {
        chain.setflush();
    }
    info.error |= error_stash;

    let parent = frame.parent.as_ref();
    let mut parent_guard;
    let mut content;
    match parent {
        Some(p) => {
            let (pg, cg) = lock_parent_child(p, chain);
            parent_guard = Some(pg);
            content = cg;
        }
        None => {
            parent_guard = None;
            content = chain.lock_content();
        }
    }

    let key = content.bref.key.0;
    let chain_err = chain.error();
    let parent_err = parent.map_or(ErrorMask::NONE, |p| p.error());
    if !chain_err.is_ok() || !parent_err.is_ok() {
        tracing::warn!(
            target: "cfs::flush",
            key,
            error = %(chain_err | parent_err),
            "chain error during flush commit; state retained"
        );
        info.error |= chain_err;
        info.error |= parent_err;
        chain.setflush();
        return false;
    }

    // The topology may have shifted between the scan and this relock.
    if !chain.parent_is(parent) {
        tracing::warn!(target: "cfs::flush", key, "chain reparented before commit");
        return true;
    }

    if parent.is_some_and(|p| p.flags().contains(ChainFlags::DESTROY)) {
        chain.set_flags(ChainFlags::DESTROY);
    }

    if chain.flags().contains(ChainFlags::MODIFIED) {
        let sync_tid = dev.sync_tid();
        if content.bref.mirror_tid < sync_tid {
            content.bref.mirror_tid = sync_tid;
        }
        let destroyed = chain.flags().contains(ChainFlags::DESTROY);

        match content.bref.typ {
            // The volume and freemap roots live in the header, and data
            // block hashes are set by the write path.
            BrefType::Volume | BrefType::Freemap | BrefType::Data => {}
            BrefType::Indirect | BrefType::FreemapNode | BrefType::FreemapLeaf => {
                Chain::setcheck(&mut content);
            }
            BrefType::Dirent => {
                // Short dirents embed the name in the check area.
                if !content.data.is_empty() {
                    Chain::setcheck(&mut content);
                }
            }
            BrefType::Inode => {
                if content.bref.is_pfsroot() {
                    if let Some(pfs) = chain.pmp() {
                        // Cached namespace inode allocator position lives
                        // at the head of the inode data.
                        if content.data.len() >= 8 {
                            let tid = pfs.inode_tid();
                            content.data[..8].copy_from_slice(&tid.to_le_bytes());
                        }
                    }
                }
                Chain::setcheck(&mut content);
            }
        }

        // Write-out precedes flag disposal so a media error leaves the
        // chain dirty and the parent's block table untouched.
        if !destroyed
            && !matches!(content.bref.typ, BrefType::Volume | BrefType::Freemap)
            && content.bref.data_off != 0
            && !content.data.is_empty()
        {
            if let Err(err) = dev
                .backing()
                .write_all_at(content.bref.data_off, &content.data)
            {
                tracing::warn!(
                    target: "cfs::flush",
                    key,
                    data_off = content.bref.data_off,
                    error = %err,
                    "chain write-out failed"
                );
                info.error |= ErrorMask::EIO;
                chain.set_error(ErrorMask::EIO);
                chain.setflush();
                return false;
            }
        }

        chain.clear_flags(ChainFlags::MODIFIED);
        if let Some(pfs) = chain.pmp() {
            pfs.memory_wakeup(1);
        }

        match content.bref.typ {
            BrefType::Freemap => {
                // The header's own mirror_tid advances past the freemap
                // commit so the double update is crash-identifiable.
                dev.with_voldata(|vol| {
                    vol.freemap_tid = content.bref.mirror_tid;
                    vol.mirror_tid = Tid(vol.mirror_tid.0 + 1);
                });
            }
            BrefType::Volume => {
                // Hold the freemap root still while the header is staged.
                let _freeze = dev.fchain().lock_content();
                dev.stage_volsync(content.bref.mirror_tid);
                chain.set_flags(ChainFlags::VOLUMESYNC);
            }
            _ => {}
        }

        if destroyed {
            dev.dedup()
                .dedup_delete(content.bref.typ, content.bref.data_off, content.bref.bytes);
        }
    }

    if chain.flags().contains(ChainFlags::UPDATE) && parent.is_none() {
        chain.clear_flags(ChainFlags::UPDATE);
    }

    // Outside a filesystem-wide sync an inode's block-table entry stays
    // stale on purpose; only the fssync pass rewrites inode index state.
    if content.bref.typ == BrefType::Inode
        && flags.contains(FlushFlags::INODE_STOP)
        && !flags.contains(FlushFlags::FSSYNC)
        && !flags.contains(FlushFlags::ALL)
        && chain.in_mounted_pfs()
    {
        return false;
    }

    if chain.flags().contains(ChainFlags::UPDATE) {
        let (Some(p), Some(pg_guard)) = (parent, parent_guard.as_mut()) else {
            return false;
        };
        let pg: &mut ChainContent = &mut *pg_guard;
        chain.clear_flags(ChainFlags::UPDATE);

        if p.flags().contains(ChainFlags::DESTROY) {
            // Parent is going away with us in it; record recency, skip
            // the block table.
            if pg.bref.modify_tid < content.bref.modify_tid {
                pg.bref.modify_tid = content.bref.modify_tid;
            }
            chain.clear_flags(ChainFlags::BLKMAPPED | ChainFlags::BLKMAPUPD);
        } else if content.bref.typ == BrefType::Indirect && dev.policy().indirect_maintenance(p, chain)
        {
            // Slot handled out of band by the policy hook.
        } else {
            match p.modify_locked(pg, dev.allocator(), Tid(0)) {
                Err(err) => {
                    tracing::warn!(
                        target: "cfs::flush",
                        key,
                        error = %err,
                        "parent copy-on-write failed; keeping update pending"
                    );
                    info.error |= err;
                    chain.set_flags(ChainFlags::UPDATE);
                }
                Ok(()) => {
                    if pg.bref.modify_tid < content.bref.modify_tid {
                        pg.bref.modify_tid = content.bref.modify_tid;
                    }
                    if pg.bref.mirror_tid < content.bref.mirror_tid {
                        pg.bref.mirror_tid = content.bref.mirror_tid;
                    }
                    if !pg.bref.typ.can_hold_blockmap() {
                        tracing::warn!(
                            target: "cfs::flush",
                            typ = ?pg.bref.typ,
                            "parent type cannot hold a block table"
                        );
                        info.error |= ErrorMask::ASSERT;
                    } else {
                        let cflags = chain.flags();
                        if cflags.contains(ChainFlags::BLKMAPUPD) {
                            if cflags.contains(ChainFlags::BLKMAPPED) {
                                base_delete(pg, chain, content.bref.key);
                            } else {
                                chain.clear_flags(ChainFlags::BLKMAPUPD);
                            }
                        }
                        if !chain.flags().contains(ChainFlags::BLKMAPPED) {
                            base_insert(pg, chain, &content.bref);
                        }
                    }
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::MemoryByteDevice;
    use cfs_types::{Blockref, ChainKey};

    fn device() -> Arc<Device> {
        Device::new(Arc::new(MemoryByteDevice::new(1 << 20)))
    }

    #[test]
    fn clean_chain_is_a_noop() {
        let dev = device();
        let chain = Chain::new(Blockref::new(BrefType::Indirect, ChainKey(1)), None);
        let err = flush(&dev, &chain, FlushFlags::TOP);
        assert!(err.is_ok());
        assert!(chain.flags().is_empty());
    }

    #[test]
    fn modified_leaf_commits_and_writes() {
        let dev = device();
        let chain = Chain::new(
            Blockref::new(BrefType::Data, ChainKey(ChainKey::VISIBLE | 1)),
            None,
        );
        chain.set_data(vec![0xAB; 64]);
        chain.modify(dev.allocator(), Tid(5)).expect("modify");
        let off = chain.bref().data_off;

        let err = flush(&dev, &chain, FlushFlags::TOP);
        assert!(err.is_ok());
        assert!(!chain.flags().contains(ChainFlags::MODIFIED));
        // No parent, so the pending table update was discarded.
        assert!(!chain.flags().contains(ChainFlags::UPDATE));

        let mut buf = vec![0u8; 64];
        dev.backing().read_exact_at(off, &mut buf).expect("read");
        assert_eq!(buf, vec![0xAB; 64]);
    }

    #[test]
    fn depth_budget_breach_reports_too_deep() {
        let dev = device();
        let root = Chain::new(Blockref::new(BrefType::Indirect, ChainKey(0)), None);
        let mut cursor = Arc::clone(&root);
        for depth in 1..10u64 {
            let next = Chain::new(Blockref::new(BrefType::Indirect, ChainKey(depth)), None);
            Chain::link_child(&cursor, &next);
            cursor = next;
        }
        cursor.set_data(vec![0x11; 64]);
        cursor.modify(dev.allocator(), Tid(1)).expect("modify");
        cursor.setflush();

        let err = flush_with_limit(&dev, &root, FlushFlags::TOP, 4);
        assert!(err.contains(ErrorMask::TOO_DEEP));
        assert!(cursor.flags().contains(ChainFlags::MODIFIED));
        // The pass re-marks the spine so a later pass can reach the work.
        assert!(root.flags().contains(ChainFlags::ONFLUSH));

        let err = flush(&dev, &root, FlushFlags::TOP);
        assert!(err.is_ok());
        assert!(!cursor.flags().contains(ChainFlags::MODIFIED));
    }

    #[test]
    fn non_table_parent_yields_assert_error() {
        let dev = device();
        let parent = Chain::new(Blockref::new(BrefType::Data, ChainKey(0)), None);
        let child = Chain::new(Blockref::new(BrefType::Data, ChainKey(1)), None);
        Chain::link_child(&parent, &child);
        child.set_data(vec![0x22; 32]);
        child.modify(dev.allocator(), Tid(1)).expect("modify");
        child.setflush();

        let err = flush(&dev, &parent, FlushFlags::TOP);
        assert!(err.contains(ErrorMask::ASSERT));
        assert!(parent.lock_content().blockmap.is_empty());
    }
}
