//! Quorum tracking for one phase of one decree.

use std::collections::BTreeSet;

use crate::traits::Atlas;
use crate::types::HostId;

/// Set-builder over the peers that have replied in the current phase,
/// with the quorum test delegated to an atlas snapshot.
///
/// Each phase owns its own track; there is no global counter. The set grows
/// monotonically within a phase and is replaced wholesale by [`clear`].
///
/// [`clear`]: QuorumTrack::clear
pub struct QuorumTrack<T> {
    peers: BTreeSet<HostId>,
    atlas: T,
}

impl<T: Atlas> QuorumTrack<T> {
    #[must_use]
    pub fn new(atlas: T) -> Self {
        Self {
            peers: BTreeSet::new(),
            atlas,
        }
    }

    /// Record a reply from `peer`.
    pub fn add(&mut self, peer: HostId) {
        self.peers.insert(peer);
    }

    /// Whether the replied set forms a quorum under the atlas.
    #[must_use]
    pub fn quorum(&self) -> bool {
        self.atlas.quorum(&self.peers)
    }

    /// Forget all replies, starting a fresh phase.
    pub fn clear(&mut self) {
        self.peers = BTreeSet::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Majority;

    #[test]
    fn quorum_is_majority_of_atlas_peers() {
        let atlas = Majority::new([HostId(1), HostId(2), HostId(3)]);
        let mut track = QuorumTrack::new(atlas);

        assert!(!track.quorum());
        track.add(HostId(1));
        assert!(!track.quorum());
        track.add(HostId(1));
        assert!(!track.quorum());
        track.add(HostId(3));
        assert!(track.quorum());

        track.clear();
        assert!(!track.quorum());
    }

    #[test]
    fn strangers_do_not_count() {
        let atlas = Majority::new([HostId(1), HostId(2), HostId(3)]);
        let mut track = QuorumTrack::new(atlas);
        track.add(HostId(8));
        track.add(HostId(9));
        assert!(!track.quorum());
    }
}
