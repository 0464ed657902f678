//! Wire protocol: events, envelopes and their binary framing.

pub mod event;
pub mod message;

use std::collections::BTreeMap;

pub use event::{args, Event, EventArgs};
pub use message::{read_message, Message, MessageKind, NodeInfo, Payload, Ping, SyncRequest};

/// Node id -> timestamp of the latest accepted event from that node.
pub type VersionVector = BTreeMap<String, f64>;

/// Raw token accepting a PING or SYNC.
pub const TOKEN_OK: &[u8] = b"Ok";
/// Raw token rejecting a stale PING.
pub const TOKEN_FAILED: &[u8] = b"Failed";
