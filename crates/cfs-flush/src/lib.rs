#![forbid(unsafe_code)]
//! Transaction-scoped flush engine for the cascade topology.
//!
//! A flush pass walks a dirty subtree top-down looking for work, then
//! commits bottom-up: every child's media state is finalized before its
//! parent's block table is rewritten, so the under-construction on-media
//! tree is consistent at every step. A crash between passes loses at most
//! the unflushed transactions; it never produces a half-updated parent
//! pointing at stale children.
//!
//! The walk itself is an explicit worklist ([`engine`]), not recursion, so
//! tree depth is bounded by heap rather than thread stack. Concurrency
//! follows the chain locking rules: the engine holds at most a
//! parent/child content pair at a time, acquired parent-first.
//!
//! [`Device`] owns the device-level roots (volume chain, freemap chain,
//! super-root inode) plus the staged volume header; [`inode_flush`] is the
//! driver a filesystem sync calls, layering the device-wide passes and the
//! redundant volume-header write on top of the per-inode flush.

mod device;
mod driver;
mod engine;
mod policy;

pub use device::Device;
pub use driver::{inode_flush, FlushRequest};
pub use engine::{flush, FlushFlags};
pub use policy::{DefaultFlushPolicy, FlushPolicy};
