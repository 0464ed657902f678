use crate::cluster::state::ClusterState;
use crate::config::NodeAddr;
use crate::protocol::{Ping, VersionVector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    /// The candidate is at least as fresh as us and is now our master.
    Accepted { start_sync: bool },
    /// The candidate reported an older version for some node we know.
    Rejected,
}

/// True if `theirs` reports any node we know with a strictly smaller version.
/// Nodes missing from `theirs` do not count against it.
pub fn is_stale(ours: &VersionVector, theirs: &VersionVector) -> bool {
    ours.iter().any(|(node, version)| {
        theirs
            .get(node)
            .is_some_and(|their_version| their_version < version)
    })
}

/// Handle an inbound PING against the local version vector.
pub fn handle_ping(state: &mut ClusterState, ours: &VersionVector, ping: &Ping) -> PingOutcome {
    state.interrupt();

    if is_stale(ours, &ping.versions) {
        tracing::debug!(
            candidate_host = %ping.host,
            candidate_port = ping.port,
            "Rejecting stale candidate"
        );
        return PingOutcome::Rejected;
    }

    let master = NodeAddr::new(ping.host.clone(), ping.port);
    let previous = state.master().cloned();
    let start_sync = state.follow(master.clone());
    if previous.as_ref() != Some(&master) {
        tracing::info!(master = %master, "Following new master");
    }
    PingOutcome::Accepted { start_sync }
}
