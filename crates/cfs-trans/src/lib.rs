#![forbid(unsafe_code)]
//! Per-namespace transaction manager.
//!
//! A namespace ([`Pfs`]) carries a single transaction word combining a
//! live-transaction count with flush/bufcache/waiting bits. Flush
//! transactions are mutually exclusive with each other; ordinary and
//! buffer-cache transactions never block on anything (buffer-cache
//! transactions must always be admitted to avoid deadlocks against
//! memory-reclaim paths). The word lives behind a mutex/condvar pair:
//! the state transitions are those of the original compare-and-swap loops,
//! with the sleep/wakeup-on-word mapped onto the condvar.
//!
//! None of the operations fail; a conflicting flush only blocks `begin`
//! until it completes.

use bitflags::bitflags;
use cfs_types::{InodeNum, Tid};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

bitflags! {
    /// Transaction mode bits, stored in the high byte of the state word.
    ///
    /// `WAITING` is engine-internal: it records that a blocked flush
    /// `begin` is sleeping on the word and must be woken.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TransFlags: u32 {
        /// Flush transaction. Interlocks against other flush transactions.
        const ISFLUSH  = 0x8000_0000;
        /// Buffer-cache-originated transaction. Never interlocks.
        const BUFCACHE = 0x4000_0000;
        /// Run the deferred work queue when the transaction completes.
        const SIDEQ    = 0x2000_0000;
        /// A flush `begin` is blocked on the word.
        const WAITING  = 0x1000_0000;
    }
}

/// Low bits of the state word: the live-transaction count.
pub const TRANS_MASK: u32 = 0x00FF_FFFF;

/// A filesystem namespace: transaction state plus the per-namespace
/// version counters.
///
/// Created once at mount, shared (`Arc`) by every writer and the flusher,
/// and dropped only at unmount.
#[derive(Debug)]
pub struct Pfs {
    name: String,
    state: Mutex<u32>,
    sync_wait: Condvar,
    /// Namespace-local logical version counter (next value to issue).
    modify_tid: AtomicU64,
    /// Inode number counter; not serialized against begin/end.
    inode_tid: AtomicU64,
    mounted: AtomicBool,
    /// Dirty-metadata accounting for writer throttling.
    dirty_count: Mutex<u64>,
    dirty_wait: Condvar,
}

impl Pfs {
    /// One-time setup of transaction state for a namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(0),
            sync_wait: Condvar::new(),
            modify_tid: AtomicU64::new(1),
            inode_tid: AtomicU64::new(1),
            mounted: AtomicBool::new(false),
            dirty_count: Mutex::new(0),
            dirty_wait: Condvar::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this namespace is mounted. The flush engine only honors
    /// PFS/inode boundary stops for mounted namespaces; an unmounted PFS
    /// has nothing monitoring its chains, so the device flush must carry
    /// it along.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::Release);
    }

    /// Begin a transaction.
    ///
    /// A flush transaction blocks while another flush transaction is
    /// inside; ordinary and buffer-cache transactions are always admitted
    /// immediately.
    pub fn trans_init(&self, flags: TransFlags) {
        let mut state = self.state.lock();
        loop {
            if flags.contains(TransFlags::ISFLUSH) && *state & TransFlags::ISFLUSH.bits() != 0 {
                *state |= TransFlags::WAITING.bits();
                tracing::trace!(
                    target: "cfs::trans",
                    pfs = %self.name,
                    "flush transaction blocked on active flush"
                );
                self.sync_wait.wait(&mut state);
                continue;
            }
            *state = (*state | (flags.bits() & !TransFlags::WAITING.bits())) + 1;
            break;
        }
    }

    /// End a transaction.
    ///
    /// Wakes waiters when a flush transaction finishes, or on the 2→1
    /// transition of the count while a flush transaction is pending (the
    /// blocked flush may be waiting for ordinary transactions to drain).
    pub fn trans_done(&self, flags: TransFlags) {
        let mut state = self.state.lock();
        let oflags = *state;
        debug_assert!(oflags & TRANS_MASK != 0, "trans_done without trans_init");

        let mut nflags = (oflags - 1) & !(flags.bits() & !TRANS_MASK);
        if flags.contains(TransFlags::ISFLUSH) {
            nflags &= !TransFlags::WAITING.bits();
        }
        if oflags & (TransFlags::ISFLUSH.bits() | TRANS_MASK)
            == (TransFlags::ISFLUSH.bits() | 2)
        {
            nflags &= !TransFlags::WAITING.bits();
        }
        *state = nflags;
        if (oflags ^ nflags) & TransFlags::WAITING.bits() != 0 {
            self.sync_wait.notify_all();
        }
    }

    /// Issue a new namespace-local version for a secondary unit of work
    /// nested inside an already-open transaction. There is no matching
    /// "sub done".
    pub fn trans_sub(&self) -> Tid {
        Tid(self.modify_tid.fetch_add(1, Ordering::Relaxed))
    }

    /// Obtain a new, unique inode number (not serialized by the caller).
    pub fn trans_new_inode_num(&self) -> InodeNum {
        InodeNum(self.inode_tid.fetch_add(1, Ordering::Relaxed))
    }

    /// Current inode-allocator head, cached into the namespace root
    /// inode when it commits.
    #[must_use]
    pub fn inode_tid(&self) -> u64 {
        self.inode_tid.load(Ordering::Relaxed)
    }

    /// Set transaction flags outside the begin/end protocol.
    pub fn trans_set_flags(&self, flags: TransFlags) {
        let mut state = self.state.lock();
        *state |= flags.bits();
    }

    /// Asynchronously clear transaction flags. If `WAITING` is in the mask
    /// and was previously set, wakes any waiters.
    pub fn trans_clear_flags(&self, flags: TransFlags) {
        let mut state = self.state.lock();
        let oflags = *state;
        let nflags = oflags & !flags.bits();
        *state = nflags;
        if (oflags ^ nflags) & TransFlags::WAITING.bits() != 0 {
            self.sync_wait.notify_all();
        }
    }

    /// Assert that a strategy (buffer I/O) call is permitted here.
    /// Currently always permissive, including during flushes.
    pub fn trans_assert_strategy(&self) {}

    /// Current transaction word (test observation).
    #[must_use]
    pub fn trans_state(&self) -> u32 {
        *self.state.lock()
    }

    // ── Dirty-metadata accounting ───────────────────────────────────────

    /// Record a chain transitioning to dirty.
    pub fn memory_inc(&self) {
        *self.dirty_count.lock() += 1;
    }

    /// Record dirty chains being retired and wake throttled writers.
    ///
    /// Invoked by the flush engine whenever a chain's MODIFIED state is
    /// disposed of.
    pub fn memory_wakeup(&self, retired: u64) {
        let mut count = self.dirty_count.lock();
        *count = count.saturating_sub(retired);
        self.dirty_wait.notify_all();
    }

    /// Throttle a writer while the dirty-chain count exceeds `limit`.
    pub fn memory_wait(&self, limit: u64) {
        let mut count = self.dirty_count.lock();
        while *count > limit {
            self.dirty_wait.wait(&mut count);
        }
    }

    /// Current dirty-chain count (test observation).
    #[must_use]
    pub fn dirty_count(&self) -> u64 {
        *self.dirty_count.lock()
    }
}
