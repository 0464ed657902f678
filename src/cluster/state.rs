use crate::config::NodeAddr;

/// This node's belief about who the master is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterRole {
    /// No belief yet.
    Unknown,
    Follower(NodeAddr),
    SelfMaster,
}

impl std::fmt::Display for MasterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterRole::Unknown => write!(f, "unknown"),
            MasterRole::Follower(master) => write!(f, "follower of {master}"),
            MasterRole::SelfMaster => write!(f, "master"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncProgress {
    NotStarted,
    InFlight,
    Done,
}

/// Mastership state, owned by the node and changed only through the
/// transitions below.
///
/// `epoch` increases whenever an inbound PING is handled. An election round
/// records the epoch when it starts and may only promote this node if no PING
/// arrived in the meantime.
#[derive(Debug)]
pub struct ClusterState {
    me: NodeAddr,
    has_peers: bool,
    master: Option<NodeAddr>,
    epoch: u64,
    sync: SyncProgress,
}

impl ClusterState {
    pub fn new(me: NodeAddr, has_peers: bool) -> Self {
        Self {
            me,
            has_peers,
            master: None,
            epoch: 0,
            sync: SyncProgress::NotStarted,
        }
    }

    pub fn role(&self) -> MasterRole {
        match &self.master {
            None => MasterRole::Unknown,
            Some(master) if *master == self.me => MasterRole::SelfMaster,
            Some(master) => MasterRole::Follower(master.clone()),
        }
    }

    /// A node with no belief yet, or with no peers, acts as master.
    pub fn is_master(&self) -> bool {
        !self.has_peers || !matches!(self.role(), MasterRole::Follower(_))
    }

    pub fn master(&self) -> Option<&NodeAddr> {
        self.master.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn sync_progress(&self) -> SyncProgress {
        self.sync
    }

    /// Election-loop completion. Returns true if this node just became master.
    pub fn complete_round(&mut self, started_at: u64) -> bool {
        if started_at != self.epoch {
            return false;
        }
        let changed = self.master.as_ref() != Some(&self.me);
        self.master = Some(self.me.clone());
        changed
    }

    /// Inbound PING seen: any in-flight round is now stale.
    pub fn interrupt(&mut self) {
        self.epoch += 1;
    }

    /// Adopt `master` after accepting its PING or discovering it.
    /// Returns true if a sync should be started.
    pub fn follow(&mut self, master: NodeAddr) -> bool {
        self.master = Some(master);
        if self.sync == SyncProgress::NotStarted {
            self.sync = SyncProgress::InFlight;
            true
        } else {
            false
        }
    }

    pub fn finish_sync(&mut self, ok: bool) {
        self.sync = if ok {
            SyncProgress::Done
        } else {
            SyncProgress::NotStarted
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> NodeAddr {
        NodeAddr::new("127.0.0.1", 1)
    }

    fn other() -> NodeAddr {
        NodeAddr::new("127.0.0.1", 2)
    }

    #[test]
    fn unknown_node_acts_as_master() {
        let state = ClusterState::new(me(), true);
        assert_eq!(state.role(), MasterRole::Unknown);
        assert!(state.is_master());
    }

    #[test]
    fn follower_is_not_master() {
        let mut state = ClusterState::new(me(), true);
        state.follow(other());
        assert_eq!(state.role(), MasterRole::Follower(other()));
        assert!(!state.is_master());
    }

    #[test]
    fn node_without_peers_is_always_master() {
        let mut state = ClusterState::new(me(), false);
        state.follow(other());
        assert!(state.is_master());
    }

    #[test]
    fn completed_round_promotes_self() {
        let mut state = ClusterState::new(me(), true);
        state.follow(other());
        let epoch = state.epoch();
        assert!(state.complete_round(epoch));
        assert_eq!(state.role(), MasterRole::SelfMaster);
        // already master
        assert!(!state.complete_round(epoch));
    }

    #[test]
    fn interrupted_round_cannot_promote() {
        let mut state = ClusterState::new(me(), true);
        let epoch = state.epoch();
        state.interrupt();
        state.follow(other());
        assert!(!state.complete_round(epoch));
        assert_eq!(state.role(), MasterRole::Follower(other()));
    }

    #[test]
    fn sync_requested_once_until_it_fails() {
        let mut state = ClusterState::new(me(), true);
        assert!(state.follow(other()));
        assert!(!state.follow(other()));
        state.finish_sync(false);
        assert!(state.follow(other()));
        state.finish_sync(true);
        assert!(!state.follow(other()));
        assert_eq!(state.sync_progress(), SyncProgress::Done);
    }

    #[test]
    fn role_display() {
        assert_eq!(MasterRole::Unknown.to_string(), "unknown");
        assert_eq!(MasterRole::SelfMaster.to_string(), "master");
        assert_eq!(
            MasterRole::Follower(other()).to_string(),
            "follower of 127.0.0.1:2"
        );
    }
}
