//! Sync driver: the per-inode flush entry point a filesystem sync calls.
//!
//! Layers the device-wide work on top of the subtree flush: after the
//! requested inode's subtree commits, the super-root topology, the
//! freemap root, and the volume root are flushed under a device flush
//! transaction, the backing device is fsynced, and the staged volume
//! header is written to the next redundant slot.

use std::sync::Arc;

use cfs_chain::{Chain, ChainFlags};
use cfs_error::ErrorMask;
use cfs_trans::TransFlags;

use crate::device::Device;
use crate::engine::{flush, FlushFlags};

/// One flush request against an inode chain.
#[derive(Clone)]
pub struct FlushRequest {
    /// The inode chain to flush.
    pub chain: Arc<Chain>,
    /// Stop at inode boundaries below the top (per-inode sync).
    pub inode_stop: bool,
    /// Filesystem-wide sync semantics (inode index included, inode
    /// block-table updates not deferred).
    pub fssync: bool,
    /// Run the device-wide passes and write the volume header. Only
    /// honored when `chain` is a namespace root.
    pub volhdr: bool,
}

/// Execute a flush request, returning the first aggregated failure.
///
/// The volume header is only written when every flush pass and the
/// device fsync succeeded; a header write failure is terminal for this
/// call and surfaces as the result, leaving the volume-sync state for
/// the next sync to retry.
pub fn inode_flush(dev: &Device, req: &FlushRequest) -> cfs_error::Result<()> {
    let mut xflags = FlushFlags::TOP;
    if req.inode_stop {
        xflags |= FlushFlags::INODE_STOP;
    }
    if req.fssync {
        xflags |= FlushFlags::FSSYNC;
    }

    let mut flush_error = ErrorMask::NONE;
    if req.chain.flags().intersects(ChainFlags::FLUSH_MASK) {
        if let Some(parent) = req.chain.parent() {
            parent.setflush();
        }
        flush_error |= flush(dev, &req.chain, xflags);
    }

    let ispfsroot = req.chain.flags().contains(ChainFlags::PFSBOUNDARY);
    if !req.volhdr || !ispfsroot {
        return result_from(flush_error);
    }

    // Device-wide passes run under their own flush transaction on the
    // super-root namespace.
    dev.spmp().trans_init(TransFlags::ISFLUSH);
    let sync_tid = dev.advance_sync_tid();
    tracing::debug!(
        target: "cfs::flush",
        sync_tid = %sync_tid,
        pfs = dev.spmp().name(),
        "device flush transaction begins"
    );

    if dev.sroot().flags().intersects(ChainFlags::FLUSH_MASK) {
        flush_error |= flush(
            dev,
            dev.sroot(),
            FlushFlags::TOP | FlushFlags::INODE_STOP | FlushFlags::FSSYNC,
        );
    }
    if dev.fchain().flags().intersects(ChainFlags::FLUSH_MASK) {
        dev.voldata_modify();
        flush_error |= flush(dev, dev.fchain(), FlushFlags::TOP);
    }
    if dev.vchain().flags().intersects(ChainFlags::FLUSH_MASK) {
        flush_error |= flush(dev, dev.vchain(), FlushFlags::TOP);
    }

    let mut sync_error = ErrorMask::NONE;
    if let Err(err) = dev.backing().sync() {
        tracing::warn!(target: "cfs::flush", error = %err, "device fsync failed during flush");
        sync_error |= ErrorMask::EIO;
    }

    if dev.vchain().flags().contains(ChainFlags::VOLUMESYNC) {
        if flush_error.is_ok() && sync_error.is_ok() {
            if let Err(err) = dev.volume_header_sync() {
                tracing::warn!(target: "cfs::flush", error = %err, "volume header write failed");
                sync_error |= ErrorMask::EIO;
            }
        } else {
            tracing::warn!(
                target: "cfs::flush",
                flush_error = %flush_error,
                sync_error = %sync_error,
                "skipping volume header write after flush errors"
            );
        }
    }

    dev.spmp().trans_done(TransFlags::ISFLUSH);

    result_from(flush_error | sync_error)
}

fn result_from(mask: ErrorMask) -> cfs_error::Result<()> {
    if mask.is_ok() {
        Ok(())
    } else {
        Err(mask.into())
    }
}
