#![forbid(unsafe_code)]
//! Core types shared by the CascadeFS transaction and flush engine.
//!
//! Everything here is plain data: identifier newtypes, block references,
//! and the volume header snapshot the flush synchronizer writes to the
//! redundant header slots. Locking and tree topology live in `cfs-chain`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical version number (transaction id).
///
/// `modify_tid` is namespace-local; `mirror_tid` is device-global and is
/// advanced only during a flush. Both are monotonically non-decreasing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Unique inode number, issued by the transaction manager.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeNum(pub u64);

/// Key identifying a chain within its parent's block table.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChainKey(pub u64);

impl ChainKey {
    /// High bit marking a visible directory-entry key on a namespace root.
    ///
    /// Keys without this bit belong to the inode index portion of the root
    /// and are excluded from non-full-sync flushes.
    pub const VISIBLE: u64 = 1 << 63;

    #[must_use]
    pub fn is_visible(self) -> bool {
        self.0 & Self::VISIBLE != 0
    }
}

/// Block reference type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrefType {
    /// File or directory inode. May be a namespace (PFS) root.
    Inode,
    /// Indirect block holding a block table of children.
    Indirect,
    /// Directory entry.
    Dirent,
    /// File data leaf.
    Data,
    /// Interior node of the free-space tree.
    FreemapNode,
    /// Leaf of the free-space tree.
    FreemapLeaf,
    /// Root of the free-space tree (the device's fchain).
    Freemap,
    /// Device-wide root (the device's vchain).
    Volume,
}

impl BrefType {
    /// Whether a chain of this type may carry a block table of children.
    ///
    /// The blockmap-update switch in the flush engine treats any other type
    /// appearing as a parent as an invariant violation.
    #[must_use]
    pub fn can_hold_blockmap(self) -> bool {
        matches!(
            self,
            Self::Inode | Self::Indirect | Self::FreemapNode | Self::Freemap | Self::Volume
        )
    }
}

bitflags! {
    /// Flags carried inside a block reference (on-disk visible).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BrefFlags: u8 {
        /// This inode is the root of a nested sub-filesystem (PFS).
        const PFSROOT = 0x01;
    }
}

/// On-disk descriptor for a chain: location, type, check code, versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blockref {
    pub typ: BrefType,
    pub flags: BrefFlags,
    /// Number of key bits spanned by this reference's key range.
    pub keybits: u8,
    pub key: ChainKey,
    /// Byte offset of the referenced block on the device. Zero means
    /// "not yet allocated" (a freshly created, never-flushed chain).
    pub data_off: u64,
    /// Size of the referenced block in bytes.
    pub bytes: u32,
    /// Namespace-local content version.
    pub modify_tid: Tid,
    /// Device-global flush version. Never regresses.
    pub mirror_tid: Tid,
    /// CRC-32C of the referenced content.
    pub check: u32,
}

impl Blockref {
    #[must_use]
    pub fn new(typ: BrefType, key: ChainKey) -> Self {
        Self {
            typ,
            flags: BrefFlags::empty(),
            keybits: 0,
            key,
            data_off: 0,
            bytes: 0,
            modify_tid: Tid(0),
            mirror_tid: Tid(0),
            check: 0,
        }
    }

    #[must_use]
    pub fn is_pfsroot(&self) -> bool {
        self.flags.contains(BrefFlags::PFSROOT)
    }
}

/// Compute the CRC-32C check code for a chain's content.
#[must_use]
pub fn content_check(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Number of redundant volume-header slots at the front of the device.
pub const VOLHDR_COUNT: usize = 4;

/// Byte stride between volume-header slots.
pub const VOLHDR_STRIDE: u64 = 64 * 1024;

/// Encoded size of a volume header.
pub const VOLHDR_BYTES: usize = 512;

/// Volume magic: `b"CASCFSV1"`.
pub const VOLUME_MAGIC: u64 = u64::from_be_bytes(*b"CASCFSV1");

const ICRC_SECT0_RANGE: std::ops::Range<usize> = 0..64;
const ICRC_SECT1_RANGE: std::ops::Range<usize> = 64..128;
const ICRC_VH_RANGE: std::ops::Range<usize> = 0..504;
const ICRC_SECT0_OFF: usize = 496;
const ICRC_SECT1_OFF: usize = 500;
const ICRC_VH_OFF: usize = 504;

/// In-memory image of the volume header.
///
/// The flush engine maintains two copies on the device object: the live
/// header (`voldata`) mutated while flushing, and the staging snapshot
/// (`volsync`) that is durably written to a header slot once the roots have
/// been committed. Only the fields this engine touches are modeled; the
/// volume root's block table lives in the volume chain itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHeader {
    pub magic: u64,
    pub version: u32,
    /// Total size of the volume in bytes, as reported by the device.
    pub volu_size: u64,
    /// Device-global flush version of the main topology.
    pub mirror_tid: Tid,
    /// Device-global flush version of the free-space tree.
    pub freemap_tid: Tid,
    /// Section check codes: [0] identity/geometry, [1] version fields.
    pub icrc_sects: [u32; 2],
    /// Whole-header check code.
    pub icrc_volheader: u32,
}

impl VolumeHeader {
    #[must_use]
    pub fn new(volu_size: u64) -> Self {
        Self {
            magic: VOLUME_MAGIC,
            version: 1,
            volu_size,
            mirror_tid: Tid(0),
            freemap_tid: Tid(0),
            icrc_sects: [0; 2],
            icrc_volheader: 0,
        }
    }

    /// Serialize to the fixed on-disk layout. CRC fields are written as
    /// currently stored; call [`update_crcs`](Self::update_crcs) first when
    /// producing a durable image.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; VOLHDR_BYTES];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[16..24].copy_from_slice(&self.volu_size.to_le_bytes());
        buf[64..72].copy_from_slice(&self.mirror_tid.0.to_le_bytes());
        buf[72..80].copy_from_slice(&self.freemap_tid.0.to_le_bytes());
        buf[ICRC_SECT0_OFF..ICRC_SECT0_OFF + 4].copy_from_slice(&self.icrc_sects[0].to_le_bytes());
        buf[ICRC_SECT1_OFF..ICRC_SECT1_OFF + 4].copy_from_slice(&self.icrc_sects[1].to_le_bytes());
        buf[ICRC_VH_OFF..ICRC_VH_OFF + 4].copy_from_slice(&self.icrc_volheader.to_le_bytes());
        buf
    }

    /// Parse an on-disk header image. Does not verify check codes; use
    /// [`verify`](Self::verify).
    pub fn decode(buf: &[u8]) -> Result<Self, VolumeHeaderError> {
        if buf.len() < VOLHDR_BYTES {
            return Err(VolumeHeaderError::Truncated { got: buf.len() });
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().expect("slice length"));
        if magic != VOLUME_MAGIC {
            return Err(VolumeHeaderError::BadMagic { got: magic });
        }
        Ok(Self {
            magic,
            version: u32::from_le_bytes(buf[8..12].try_into().expect("slice length")),
            volu_size: u64::from_le_bytes(buf[16..24].try_into().expect("slice length")),
            mirror_tid: Tid(u64::from_le_bytes(
                buf[64..72].try_into().expect("slice length"),
            )),
            freemap_tid: Tid(u64::from_le_bytes(
                buf[72..80].try_into().expect("slice length"),
            )),
            icrc_sects: [
                u32::from_le_bytes(
                    buf[ICRC_SECT0_OFF..ICRC_SECT0_OFF + 4]
                        .try_into()
                        .expect("slice length"),
                ),
                u32::from_le_bytes(
                    buf[ICRC_SECT1_OFF..ICRC_SECT1_OFF + 4]
                        .try_into()
                        .expect("slice length"),
                ),
            ],
            icrc_volheader: u32::from_le_bytes(
                buf[ICRC_VH_OFF..ICRC_VH_OFF + 4]
                    .try_into()
                    .expect("slice length"),
            ),
        })
    }

    /// Recompute the two section check codes and the whole-header check
    /// code from the current field values.
    ///
    /// The whole-header code covers everything through the section codes
    /// (excluding only itself), so any single-field corruption is caught
    /// by at least one code.
    pub fn update_crcs(&mut self) {
        let mut image = self.encode();
        self.icrc_sects[0] = crc32c::crc32c(&image[ICRC_SECT0_RANGE]);
        self.icrc_sects[1] = crc32c::crc32c(&image[ICRC_SECT1_RANGE]);
        image[ICRC_SECT0_OFF..ICRC_SECT0_OFF + 4].copy_from_slice(&self.icrc_sects[0].to_le_bytes());
        image[ICRC_SECT1_OFF..ICRC_SECT1_OFF + 4].copy_from_slice(&self.icrc_sects[1].to_le_bytes());
        self.icrc_volheader = crc32c::crc32c(&image[ICRC_VH_RANGE]);
    }

    /// Verify all three check codes against the field values.
    #[must_use]
    pub fn verify(&self) -> bool {
        let mut copy = self.clone();
        copy.update_crcs();
        copy.icrc_sects == self.icrc_sects && copy.icrc_volheader == self.icrc_volheader
    }

    /// Byte offset of header slot `slot`.
    #[must_use]
    pub fn slot_offset(slot: usize) -> u64 {
        slot as u64 * VOLHDR_STRIDE
    }
}

/// Errors from decoding a volume header image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeHeaderError {
    Truncated { got: usize },
    BadMagic { got: u64 },
}

impl fmt::Display for VolumeHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { got } => {
                write!(f, "volume header truncated: got {got} of {VOLHDR_BYTES} bytes")
            }
            Self::BadMagic { got } => {
                write!(f, "bad volume magic {got:#018x} (expected {VOLUME_MAGIC:#018x})")
            }
        }
    }
}

impl std::error::Error for VolumeHeaderError {}
