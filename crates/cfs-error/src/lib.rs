#![forbid(unsafe_code)]
//! Error types for CascadeFS.
//!
//! # Error Taxonomy
//!
//! CascadeFS uses a two-layer error model:
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Flush engine | [`ErrorMask`] | Sticky, OR-combinable error bits accumulated across a flush walk |
//! | API | [`CfsError`] | User-facing errors for the sync caller and API consumers |
//!
//! The flush engine never aborts a walk on the first failure: every visited
//! subtree contributes its error bits into a cumulative [`ErrorMask`] so as
//! much of the tree as possible still reaches durable state. The mask
//! converts to a [`CfsError`] at the driver boundary, where the most severe
//! bit wins.
//!
//! `cfs-error` has no dependency on the sibling crates (no cyclic deps);
//! crate-internal errors convert into `CfsError` at their crate boundaries.

use std::fmt;
use thiserror::Error;

/// OR-combinable flush error bits.
///
/// Sticky: once attached to a chain the bits survive until the chain is
/// successfully flushed. Bits propagate upward by OR-combination into the
/// flush walk's cumulative error, and the engine re-marks failed chains as
/// still needing flush rather than losing their dirty state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorMask(u32);

impl ErrorMask {
    pub const NONE: Self = Self(0);
    /// Media I/O failure.
    pub const EIO: Self = Self(0x0001);
    /// Content check-code mismatch.
    pub const CHECK: Self = Self(0x0002);
    /// Allocation failure while preparing a block relocation.
    pub const ENOSPC: Self = Self(0x0004);
    /// The flush worklist exceeded its frame budget (tree too deep).
    pub const TOO_DEEP: Self = Self(0x0008);
    /// Programmer-invariant violation (e.g. a non-blockmap-bearing chain
    /// appearing as a blockmap parent). Unrecoverable for the subtree, but
    /// never aborts the process.
    pub const ASSERT: Self = Self(0x0010);

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ErrorMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ErrorMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "ok");
        }
        let mut sep = "";
        for (bit, name) in [
            (Self::EIO, "eio"),
            (Self::CHECK, "check"),
            (Self::ENOSPC, "enospc"),
            (Self::TOO_DEEP, "too-deep"),
            (Self::ASSERT, "assert"),
        ] {
            if self.contains(bit) {
                write!(f, "{sep}{name}")?;
                sep = "|";
            }
        }
        let known = Self::EIO.0 | Self::CHECK.0 | Self::ENOSPC.0 | Self::TOO_DEEP.0 | Self::ASSERT.0;
        if self.0 & !known != 0 {
            write!(f, "{sep}{:#x}", self.0 & !known)?;
        }
        Ok(())
    }
}

/// Unified user-facing error type for CascadeFS operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Aggregated flush failure, carrying the accumulated error bits.
    #[error("flush failed: {mask}")]
    Flush { mask: ErrorMask },

    /// Metadata check-code mismatch at a known device offset.
    #[error("corrupt metadata at offset {offset:#x}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// Structurally invalid on-disk format (bad magic, bad geometry).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// No free blocks available.
    #[error("no space left on device")]
    NoSpace,

    /// Flush worklist frame budget exceeded.
    #[error("chain topology too deep to flush")]
    TooDeep,

    /// Internal invariant violated; the affected subtree was abandoned.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Filesystem is mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl CfsError {
    /// Convert this error into a POSIX errno suitable for surfacing a
    /// failed `sync`/`fsync` to the caller.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm, so a
    /// new variant is a compile error until its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Flush { mask } => {
                if mask.contains(ErrorMask::ENOSPC) {
                    libc::ENOSPC
                } else {
                    libc::EIO
                }
            }
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::TooDeep => libc::EIO,
            Self::Invariant(_) => libc::EIO,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

impl From<ErrorMask> for CfsError {
    /// Collapse an accumulated mask into a user-facing error.
    ///
    /// Must not be called with an empty mask; success is `Ok(())`, not an
    /// error value.
    fn from(mask: ErrorMask) -> Self {
        debug_assert!(!mask.is_ok());
        if mask.contains(ErrorMask::TOO_DEEP) {
            Self::TooDeep
        } else if mask == ErrorMask::ENOSPC {
            Self::NoSpace
        } else {
            Self::Flush { mask }
        }
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_or_combination_accumulates() {
        let mut mask = ErrorMask::NONE;
        assert!(mask.is_ok());
        mask |= ErrorMask::EIO;
        mask |= ErrorMask::ENOSPC;
        assert!(mask.contains(ErrorMask::EIO));
        assert!(mask.contains(ErrorMask::ENOSPC));
        assert!(!mask.contains(ErrorMask::CHECK));
        assert_eq!(mask, ErrorMask::EIO | ErrorMask::ENOSPC);
    }

    #[test]
    fn mask_display_lists_bits() {
        assert_eq!(ErrorMask::NONE.to_string(), "ok");
        assert_eq!((ErrorMask::EIO | ErrorMask::CHECK).to_string(), "eio|check");
        assert_eq!(ErrorMask::TOO_DEEP.to_string(), "too-deep");
    }

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CfsError, libc::c_int)> = vec![
            (CfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                CfsError::Flush {
                    mask: ErrorMask::EIO,
                },
                libc::EIO,
            ),
            (
                CfsError::Flush {
                    mask: ErrorMask::ENOSPC,
                },
                libc::ENOSPC,
            ),
            (
                CfsError::Corruption {
                    offset: 0x1000,
                    detail: "bad check".into(),
                },
                libc::EIO,
            ),
            (CfsError::Format("bad magic".into()), libc::EINVAL),
            (CfsError::NoSpace, libc::ENOSPC),
            (CfsError::TooDeep, libc::EIO),
            (CfsError::Invariant("test".into()), libc::EIO),
            (CfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = CfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn mask_conversion_picks_most_specific_variant() {
        assert!(matches!(CfsError::from(ErrorMask::ENOSPC), CfsError::NoSpace));
        assert!(matches!(
            CfsError::from(ErrorMask::TOO_DEEP | ErrorMask::EIO),
            CfsError::TooDeep
        ));
        assert!(matches!(
            CfsError::from(ErrorMask::EIO | ErrorMask::CHECK),
            CfsError::Flush { .. }
        ));
    }
}
