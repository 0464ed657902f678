use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EventerError;

/// Reachable address of a node. Its `host:port` rendering is the node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Node id used as the version vector key.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = EventerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| EventerError::Config(format!("expected host:port, got {s:?}")))?;
        if host.is_empty() {
            return Err(EventerError::Config(format!("missing host in {s:?}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EventerError::Config(format!("invalid port in {s:?}")))?;
        Ok(Self::new(host, port))
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: NodeAddr,
    pub peers: Vec<NodeAddr>,
    pub data_dir: PathBuf,
    pub max_log_size: usize,
    pub election_delay_min_ms: u64,
    pub election_delay_max_ms: u64,
    /// Floor for timeouts derived from the election delay.
    pub min_peer_timeout_ms: u64,
    /// Fixed timeout for one-shot NODE_INFO and SYNC requests.
    pub discovery_timeout_ms: u64,
    pub inbound_read_timeout_ms: u64,
    /// Skip unreachable peers during an election round instead of failing it.
    pub tolerate_unreachable_peers: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: NodeAddr::new("127.0.0.1", 9090),
            peers: Vec::new(),
            data_dir: PathBuf::from("./eventer-data"),
            max_log_size: 1000,
            election_delay_min_ms: 0,
            election_delay_max_ms: 2000,
            min_peer_timeout_ms: 50,
            discovery_timeout_ms: 1000,
            inbound_read_timeout_ms: 5000,
            tolerate_unreachable_peers: false,
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: NodeAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, peer: NodeAddr) -> Self {
        self.peers.push(peer);
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_election_delay(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_delay_min_ms = min_ms;
        self.election_delay_max_ms = max_ms;
        self
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn inbound_read_timeout(&self) -> Duration {
        Duration::from_millis(self.inbound_read_timeout_ms)
    }

    /// Parse a comma-separated `host:port` list, ignoring empty items.
    pub fn parse_peers(peers: &str) -> Result<Vec<NodeAddr>, EventerError> {
        peers
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(NodeAddr::from_str)
            .collect()
    }
}
