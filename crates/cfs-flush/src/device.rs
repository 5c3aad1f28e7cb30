use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use cfs_block::{BumpAllocator, ByteDevice, DedupIndex};
use cfs_chain::{Chain, ChainFlags};
use cfs_error::Result;
use cfs_trans::Pfs;
use cfs_types::{
    Blockref, BrefFlags, BrefType, ChainKey, InodeNum, Tid, VolumeHeader, VOLHDR_BYTES,
    VOLHDR_COUNT, VOLHDR_STRIDE,
};

use crate::policy::{DefaultFlushPolicy, FlushPolicy};

/// Device-level flush state.
///
/// Owns the three detached roots of the cascade topology — the volume
/// chain, the freemap chain, and the super-root inode under which all
/// namespace roots hang — plus the live volume header (`voldata`), the
/// crash-consistent staging copy (`volsync`) folded from `voldata` when
/// the volume chain commits, and the round-robin slot cursor for the
/// redundant header writes.
///
/// Lock order inside: chain content locks before `voldata`, `voldata`
/// before `volsync`, `volsync` before the slot cursor.
pub struct Device {
    backing: Arc<dyn ByteDevice>,
    alloc: BumpAllocator,
    dedup: DedupIndex,
    policy: Arc<dyn FlushPolicy>,
    spmp: Arc<Pfs>,
    vchain: Arc<Chain>,
    fchain: Arc<Chain>,
    sroot: Arc<Chain>,
    voldata: Mutex<VolumeHeader>,
    volsync: Mutex<VolumeHeader>,
    volhdrno: Mutex<usize>,
    sync_tid: AtomicU64,
}

impl Device {
    pub fn new(backing: Arc<dyn ByteDevice>) -> Arc<Self> {
        Self::with_policy(backing, Arc::new(DefaultFlushPolicy))
    }

    pub fn with_policy(backing: Arc<dyn ByteDevice>, policy: Arc<dyn FlushPolicy>) -> Arc<Self> {
        let volu_size = backing.len_bytes();
        let header_zone = (VOLHDR_COUNT as u64) * VOLHDR_STRIDE;
        let alloc = BumpAllocator::new(header_zone.min(volu_size), volu_size);

        let spmp = Arc::new(Pfs::new("spmp"));
        let vchain = Chain::new(Blockref::new(BrefType::Volume, ChainKey(0)), None);
        let fchain = Chain::new(Blockref::new(BrefType::Freemap, ChainKey(0)), None);

        let mut sroot_bref = Blockref::new(BrefType::Inode, ChainKey(ChainKey::VISIBLE));
        sroot_bref.flags |= BrefFlags::PFSROOT;
        let sroot = Chain::new(sroot_bref, Some(Arc::clone(&spmp)));
        sroot.set_data(vec![0u8; 128]);
        Chain::link_child(&vchain, &sroot);

        let mut voldata = VolumeHeader::new(volu_size);
        voldata.update_crcs();
        let volsync = voldata.clone();

        Arc::new(Self {
            backing,
            alloc,
            dedup: DedupIndex::new(),
            policy,
            spmp,
            vchain,
            fchain,
            sroot,
            voldata: Mutex::new(voldata),
            volsync: Mutex::new(volsync),
            volhdrno: Mutex::new(0),
            sync_tid: AtomicU64::new(1),
        })
    }

    /// Create a namespace rooted at a fresh PFS-root inode chain linked
    /// under the super-root.
    pub fn create_pfs(&self, name: &str, inum: InodeNum) -> (Arc<Pfs>, Arc<Chain>) {
        let pfs = Arc::new(Pfs::new(name));
        let mut bref = Blockref::new(BrefType::Inode, ChainKey(ChainKey::VISIBLE | inum.0));
        bref.flags |= BrefFlags::PFSROOT;
        let chain = Chain::new(bref, Some(Arc::clone(&pfs)));
        chain.set_flags(ChainFlags::PFSBOUNDARY);
        chain.set_data(vec![0u8; 128]);
        Chain::link_child(&self.sroot, &chain);
        (pfs, chain)
    }

    #[must_use]
    pub fn backing(&self) -> &Arc<dyn ByteDevice> {
        &self.backing
    }

    #[must_use]
    pub fn allocator(&self) -> &BumpAllocator {
        &self.alloc
    }

    #[must_use]
    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    #[must_use]
    pub fn policy(&self) -> &dyn FlushPolicy {
        self.policy.as_ref()
    }

    /// Namespace backing the device-wide flush transaction.
    #[must_use]
    pub fn spmp(&self) -> &Arc<Pfs> {
        &self.spmp
    }

    #[must_use]
    pub fn vchain(&self) -> &Arc<Chain> {
        &self.vchain
    }

    #[must_use]
    pub fn fchain(&self) -> &Arc<Chain> {
        &self.fchain
    }

    #[must_use]
    pub fn sroot(&self) -> &Arc<Chain> {
        &self.sroot
    }

    /// The device-global transaction id stamped into `mirror_tid` of every
    /// chain committed by the current flush pass.
    #[must_use]
    pub fn sync_tid(&self) -> Tid {
        Tid(self.sync_tid.load(Ordering::Acquire))
    }

    /// Advance the device-global id for a new flush pass. Never regresses.
    pub fn advance_sync_tid(&self) -> Tid {
        Tid(self.sync_tid.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Mark the volume root dirty ahead of a freemap or topology commit
    /// that will fold new tids into the header.
    pub fn voldata_modify(&self) {
        self.vchain.set_flags(ChainFlags::MODIFIED);
    }

    #[must_use]
    pub fn voldata_snapshot(&self) -> VolumeHeader {
        self.voldata.lock().clone()
    }

    #[must_use]
    pub fn volsync_snapshot(&self) -> VolumeHeader {
        self.volsync.lock().clone()
    }

    /// Slot the most recent header write landed in.
    #[must_use]
    pub fn volhdrno(&self) -> usize {
        *self.volhdrno.lock()
    }

    pub(crate) fn with_voldata<R>(&self, f: impl FnOnce(&mut VolumeHeader) -> R) -> R {
        f(&mut self.voldata.lock())
    }

    /// Fold the live header into the staging copy. Called with the volume
    /// chain's content lock held, after its `mirror_tid` was absorbed.
    pub(crate) fn stage_volsync(&self, absorb_mirror: Tid) {
        let mut voldata = self.voldata.lock();
        if voldata.mirror_tid < absorb_mirror {
            voldata.mirror_tid = absorb_mirror;
        }
        voldata.update_crcs();
        *self.volsync.lock() = voldata.clone();
    }

    /// Write the staged header to the next redundant slot.
    ///
    /// Slots advance round-robin and wrap to slot 0 when the device is too
    /// small to hold the next one. The volume-sync flag is cleared before
    /// the write; an I/O failure here is terminal for the sync call, not
    /// retried.
    pub fn volume_header_sync(&self) -> Result<()> {
        let header = self.volsync.lock().clone();
        let mut slot = self.volhdrno.lock();
        let mut next = (*slot + 1) % VOLHDR_COUNT;
        if VolumeHeader::slot_offset(next) + VOLHDR_BYTES as u64 > header.volu_size {
            next = 0;
        }
        self.vchain.clear_flags(ChainFlags::VOLUMESYNC);
        tracing::debug!(
            target: "cfs::flush",
            slot = next,
            mirror_tid = %header.mirror_tid,
            freemap_tid = %header.freemap_tid,
            "writing volume header"
        );
        self.backing
            .write_all_at(VolumeHeader::slot_offset(next), &header.encode())?;
        *slot = next;
        Ok(())
    }
}
