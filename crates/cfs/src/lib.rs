#![forbid(unsafe_code)]
//! CascadeFS public API facade.
//!
//! Re-exports the transaction and flush machinery through one crate so
//! downstream consumers depend on a single stable surface.

pub use cfs_block::{
    Allocator, BumpAllocator, ByteDevice, DedupIndex, FileByteDevice, MemoryByteDevice,
};
pub use cfs_chain::{
    base_delete, base_insert, lock_parent_child, Chain, ChainContent, ChainFlags,
};
pub use cfs_error::{CfsError, ErrorMask, Result};
pub use cfs_flush::{
    flush, inode_flush, DefaultFlushPolicy, Device, FlushFlags, FlushPolicy, FlushRequest,
};
pub use cfs_trans::{Pfs, TransFlags, TRANS_MASK};
pub use cfs_types::{
    Blockref, BrefFlags, BrefType, ChainKey, InodeNum, Tid, VolumeHeader, VolumeHeaderError,
    VOLHDR_BYTES, VOLHDR_COUNT, VOLHDR_STRIDE, VOLUME_MAGIC,
};
