use std::sync::Arc;

use cfs_chain::Chain;
use cfs_types::ChainKey;

/// Pluggable decisions the core walk delegates to the embedding
/// filesystem.
///
/// Both hooks are called while the engine holds the parent/child content
/// locks for the commit in progress; implementations must not lock either
/// chain's content themselves.
pub trait FlushPolicy: Send + Sync {
    /// Maintenance hook for an indirect chain whose slot in `parent` is
    /// about to be rewritten. Returning `true` means the hook disposed of
    /// the slot out of band (e.g. collapsed the indirect block away) and
    /// the normal delete/insert is skipped.
    fn indirect_maintenance(&self, parent: &Arc<Chain>, chain: &Arc<Chain>) -> bool {
        let _ = (parent, chain);
        false
    }

    /// Whether `key` on a namespace root inode lies in the visible
    /// directory-entry range. Keys outside it belong to the inode index
    /// and are only flushed by the filesystem-wide sync.
    fn inode_index_visible(&self, key: ChainKey) -> bool {
        key.is_visible()
    }
}

/// Default policy: no indirect-block collapse, visibility straight from
/// the key's namespace bit.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFlushPolicy;

impl FlushPolicy for DefaultFlushPolicy {}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_types::Blockref;
    use cfs_types::BrefType;

    #[test]
    fn default_policy_uses_key_visibility() {
        let policy = DefaultFlushPolicy;
        assert!(policy.inode_index_visible(ChainKey(ChainKey::VISIBLE | 7)));
        assert!(!policy.inode_index_visible(ChainKey(7)));
    }

    #[test]
    fn default_policy_never_collapses() {
        let policy = DefaultFlushPolicy;
        let parent = Chain::new(Blockref::new(BrefType::Inode, ChainKey(0)), None);
        let child = Chain::new(Blockref::new(BrefType::Indirect, ChainKey(1)), None);
        assert!(!policy.indirect_maintenance(&parent, &child));
    }
}
