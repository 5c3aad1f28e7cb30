#![forbid(unsafe_code)]
//! Backing-storage interfaces consumed by the flush engine.
//!
//! Provides the `ByteDevice` trait with file-backed and in-memory
//! implementations, the block `Allocator` used for copy-on-write
//! relocation, and the dedup-candidacy index whose ranges are invalidated
//! when destroyed chains are committed.

use cfs_error::{CfsError, ErrorMask, Result};
use cfs_types::BrefType;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64, what: &str) -> Result<()> {
    let end = offset
        .checked_add(u64::try_from(len).map_err(|_| {
            CfsError::Format(format!("{what} length overflows u64: len={len}"))
        })?)
        .ok_or_else(|| CfsError::Format(format!("{what} range overflows u64: offset={offset}")))?;
    if end > device_len {
        return Err(CfsError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CfsError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Used by the engine tests and as the backing store for scratch volumes.
/// Writes and syncs can be failed on demand to exercise the terminal-error
/// paths of the volume-header synchronizer.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_sync: AtomicBool,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            fail_writes: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
        }
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent syncs fail with an I/O error.
    pub fn fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::Relaxed);
    }

    /// Copy out a byte range (test observation).
    #[must_use]
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = offset.saturating_add(len).min(bytes.len());
        bytes.get(offset..end).map(<[u8]>::to_vec).unwrap_or_default()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "read")?;
        let offset = usize::try_from(offset)
            .map_err(|_| CfsError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(CfsError::Io(std::io::Error::other("injected write failure")));
        }
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "write")?;
        let offset = usize::try_from(offset)
            .map_err(|_| CfsError::Format("offset does not fit usize".to_owned()))?;
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.fail_sync.load(Ordering::Relaxed) {
            return Err(CfsError::Io(std::io::Error::other("injected sync failure")));
        }
        Ok(())
    }
}

/// Block allocator used for copy-on-write relocation.
///
/// Failure is reported as an [`ErrorMask`] rather than a `CfsError` because
/// the flush engine records it and continues the walk; it never unwinds.
pub trait Allocator: Send + Sync {
    /// Allocate `bytes` of device space, returning the byte offset.
    fn alloc(&self, bytes: u32) -> std::result::Result<u64, ErrorMask>;
}

/// Append-only bump allocator.
///
/// Space reclamation is a bulkfree concern and out of scope; the allocator
/// only has to hand out fresh, non-overlapping offsets so relocated chains
/// observably move. Exhaustion can also be forced for fault-injection.
#[derive(Debug)]
pub struct BumpAllocator {
    next: AtomicU64,
    limit: u64,
    force_enospc: AtomicBool,
}

impl BumpAllocator {
    #[must_use]
    pub fn new(base: u64, limit: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
            limit,
            force_enospc: AtomicBool::new(false),
        }
    }

    /// Make subsequent allocations fail with `ErrorMask::ENOSPC`.
    pub fn force_enospc(&self, fail: bool) {
        self.force_enospc.store(fail, Ordering::Relaxed);
    }
}

impl Allocator for BumpAllocator {
    fn alloc(&self, bytes: u32) -> std::result::Result<u64, ErrorMask> {
        if self.force_enospc.load(Ordering::Relaxed) {
            return Err(ErrorMask::ENOSPC);
        }
        // Round to 64-byte granules so offsets stay distinguishable even
        // for zero-length metadata chains.
        let granule = u64::from(bytes.max(1)).next_multiple_of(64);
        let off = self.next.fetch_add(granule, Ordering::Relaxed);
        if off.saturating_add(granule) > self.limit {
            tracing::warn!(
                target: "cfs::block",
                off,
                granule,
                limit = self.limit,
                "allocator exhausted"
            );
            return Err(ErrorMask::ENOSPC);
        }
        Ok(off)
    }
}

/// Dedup-candidacy index keyed by device byte range.
///
/// The buffer/dedup layer proper is an external collaborator; the flush
/// engine only needs to *remove* ranges when a destroyed chain is committed
/// so doomed data is never used as a dedup source and any still-dirty
/// buffer for the range can be dropped instead of written back.
#[derive(Debug, Default)]
pub struct DedupIndex {
    ranges: Mutex<BTreeMap<u64, u32>>,
    invalidations: AtomicU64,
}

impl DedupIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a range as a dedup candidate.
    pub fn insert(&self, data_off: u64, bytes: u32) {
        if bytes == 0 {
            return;
        }
        self.ranges.lock().insert(data_off, bytes);
    }

    /// Remove a destroyed chain's old range from dedup candidacy.
    pub fn dedup_delete(&self, typ: BrefType, data_off: u64, bytes: u32) {
        let removed = self.ranges.lock().remove(&data_off).is_some();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            target: "cfs::block",
            ?typ,
            data_off,
            bytes,
            removed,
            "dedup range invalidated"
        );
    }

    /// Whether a range starting at `data_off` is currently a candidate.
    #[must_use]
    pub fn contains(&self, data_off: u64) -> bool {
        self.ranges.lock().contains_key(&data_off)
    }

    /// Total invalidations issued (test observation).
    #[must_use]
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trips() {
        let dev = MemoryByteDevice::new(4096);
        dev.write_all_at(128, &[7_u8; 64]).expect("write");
        let mut buf = [0_u8; 64];
        dev.read_exact_at(128, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 64]);
    }

    #[test]
    fn memory_device_rejects_out_of_bounds() {
        let dev = MemoryByteDevice::new(256);
        let err = dev.write_all_at(250, &[0_u8; 16]).expect_err("oob write");
        assert!(matches!(err, CfsError::Format(_)));
    }

    #[test]
    fn memory_device_write_fault_injection() {
        let dev = MemoryByteDevice::new(256);
        dev.fail_writes(true);
        let err = dev.write_all_at(0, &[1_u8; 8]).expect_err("injected");
        assert_eq!(err.to_errno(), libc::EIO);
        dev.fail_writes(false);
        dev.write_all_at(0, &[1_u8; 8]).expect("write after clear");
    }

    #[test]
    fn file_device_round_trips() {
        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.as_file().set_len(8192).expect("set_len");
        let dev = FileByteDevice::open(tmp.path()).expect("open");
        assert_eq!(dev.len_bytes(), 8192);

        dev.write_all_at(4096, &[3_u8; 512]).expect("write");
        dev.sync().expect("sync");
        let mut buf = [0_u8; 512];
        dev.read_exact_at(4096, &mut buf).expect("read");
        assert_eq!(buf, [3_u8; 512]);
    }

    #[test]
    fn bump_allocator_hands_out_distinct_offsets() {
        let alloc = BumpAllocator::new(1024, 1024 * 1024);
        let a = alloc.alloc(100).expect("a");
        let b = alloc.alloc(100).expect("b");
        assert_ne!(a, b);
        assert!(b >= a + 100);
    }

    #[test]
    fn bump_allocator_reports_exhaustion_as_mask() {
        let alloc = BumpAllocator::new(0, 128);
        alloc.alloc(64).expect("fits");
        let err = alloc.alloc(128).expect_err("exhausted");
        assert_eq!(err, ErrorMask::ENOSPC);

        let alloc = BumpAllocator::new(0, 1024 * 1024);
        alloc.force_enospc(true);
        assert_eq!(alloc.alloc(1).expect_err("forced"), ErrorMask::ENOSPC);
    }

    #[test]
    fn dedup_index_invalidation() {
        let dedup = DedupIndex::new();
        dedup.insert(0x1000, 512);
        assert!(dedup.contains(0x1000));
        dedup.dedup_delete(BrefType::Data, 0x1000, 512);
        assert!(!dedup.contains(0x1000));
        assert_eq!(dedup.invalidation_count(), 1);
    }
}
