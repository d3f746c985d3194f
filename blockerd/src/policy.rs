// ABOUTME: decides which socket peers may use the privileged service.
// ABOUTME: trusts root, the daemon's own uid and an explicit allowlist; unknown peers are refused.

use std::collections::BTreeSet;

use crate::audit::PeerCredentials;

const ROOT_UID: u32 = 0;

#[derive(Debug, Clone)]
pub struct CallerPolicy {
    allowed: BTreeSet<u32>,
}

impl CallerPolicy {
    pub fn new(own_uid: u32, extra: &[u32]) -> Self {
        let mut allowed: BTreeSet<u32> = extra.iter().copied().collect();
        allowed.insert(ROOT_UID);
        allowed.insert(own_uid);
        Self { allowed }
    }

    /// Allows exactly `uids`, without the implicit root and self entries.
    pub fn only(uids: &[u32]) -> Self {
        Self {
            allowed: uids.iter().copied().collect(),
        }
    }

    pub fn allowed_uids(&self) -> Vec<u32> {
        self.allowed.iter().copied().collect()
    }

    pub fn allows(&self, peer: Option<&PeerCredentials>) -> bool {
        match peer {
            Some(peer) => self.allowed.contains(&peer.uid),
            None => false,
        }
    }
}
