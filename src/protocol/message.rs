//! Envelope codec.
//!
//! Every envelope is laid out as (integers big-endian, u16 wide):
//!
//! ```text
//! [len(node_id):2][node_id][kind:2][len(payload):2][payload]
//! ```
//!
//! Payload bodies are JSON. Both the node id and the payload are capped at
//! 65535 bytes; oversized input is rejected at encode time.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{EventerError, Result};
use crate::protocol::event::Event;
use crate::protocol::VersionVector;

/// Largest node id or payload the u16 length prefixes can describe.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    NodeInfo = 1,
    NodeInfoResponse = 2,
    Event = 3,
    Ping = 4,
    Sync = 5,
}

impl TryFrom<u16> for MessageKind {
    type Error = EventerError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(MessageKind::NodeInfo),
            2 => Ok(MessageKind::NodeInfoResponse),
            3 => Ok(MessageKind::Event),
            4 => Ok(MessageKind::Ping),
            5 => Ok(MessageKind::Sync),
            other => Err(EventerError::MalformedMessage(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::NodeInfo => write!(f, "NODE_INFO"),
            MessageKind::NodeInfoResponse => write!(f, "NODE_INFO_RESPONSE"),
            MessageKind::Event => write!(f, "EVENT"),
            MessageKind::Ping => write!(f, "PING"),
            MessageKind::Sync => write!(f, "SYNC"),
        }
    }
}

/// Leadership claim: the candidate's version vector plus its reachable address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub versions: VersionVector,
    pub host: String,
    pub port: u16,
}

/// Request for the master to stream its log to `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub host: String,
    pub port: u16,
}

/// Reply to a NODE_INFO discovery request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub is_master: bool,
    /// Election delay of the replying node, in seconds.
    pub delay: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    NodeInfo,
    NodeInfoResponse(NodeInfo),
    Event(Event),
    Ping(Ping),
    Sync(SyncRequest),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::NodeInfo => MessageKind::NodeInfo,
            Payload::NodeInfoResponse(_) => MessageKind::NodeInfoResponse,
            Payload::Event(_) => MessageKind::Event,
            Payload::Ping(_) => MessageKind::Ping,
            Payload::Sync(_) => MessageKind::Sync,
        }
    }

    fn to_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Payload::NodeInfo => Vec::new(),
            Payload::NodeInfoResponse(info) => serde_json::to_vec(info)?,
            Payload::Event(event) => serde_json::to_vec(event)?,
            Payload::Ping(ping) => serde_json::to_vec(ping)?,
            Payload::Sync(sync) => serde_json::to_vec(sync)?,
        };
        Ok(body)
    }

    fn from_body(kind: MessageKind, body: &[u8]) -> Result<Self> {
        let malformed = |e: serde_json::Error| {
            EventerError::MalformedMessage(format!("bad {kind} payload: {e}"))
        };
        let payload = match kind {
            MessageKind::NodeInfo => {
                if !body.is_empty() {
                    return Err(EventerError::MalformedMessage(
                        "NODE_INFO carries no payload".to_string(),
                    ));
                }
                Payload::NodeInfo
            }
            MessageKind::NodeInfoResponse => {
                Payload::NodeInfoResponse(serde_json::from_slice(body).map_err(malformed)?)
            }
            MessageKind::Event => Payload::Event(serde_json::from_slice(body).map_err(malformed)?),
            MessageKind::Ping => Payload::Ping(serde_json::from_slice(body).map_err(malformed)?),
            MessageKind::Sync => Payload::Sync(serde_json::from_slice(body).map_err(malformed)?),
        };
        Ok(payload)
    }
}

/// A wire envelope. Constructed per send, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub node_id: String,
    pub payload: Payload,
}

impl Message {
    pub fn new(node_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            node_id: node_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.node_id.is_ascii() {
            return Err(EventerError::InvalidNodeId(self.node_id.clone()));
        }
        let node_id = self.node_id.as_bytes();
        if node_id.len() > MAX_FIELD_LEN {
            return Err(EventerError::NodeIdTooLong(node_id.len()));
        }

        let body = self.payload.to_body()?;
        check_len(body.len())?;

        let mut buf = Vec::with_capacity(6 + node_id.len() + body.len());
        buf.extend_from_slice(&(node_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(node_id);
        buf.extend_from_slice(&(self.kind() as u16).to_be_bytes());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;

        let node_id_len = take_u16(&mut cursor, "node id length")? as usize;
        let node_id = take(&mut cursor, node_id_len, "node id")?;
        let kind = take_u16(&mut cursor, "message kind")?;
        let body_len = take_u16(&mut cursor, "payload length")? as usize;
        let body = take(&mut cursor, body_len, "payload")?;

        if !cursor.is_empty() {
            return Err(EventerError::MalformedMessage(format!(
                "{} trailing bytes after payload",
                cursor.len()
            )));
        }

        Self::from_parts(node_id, kind, body)
    }

    fn from_parts(node_id: &[u8], kind: u16, body: &[u8]) -> Result<Self> {
        if !node_id.is_ascii() {
            return Err(EventerError::MalformedMessage(
                "node id is not ASCII".to_string(),
            ));
        }
        // ASCII is valid UTF-8
        let node_id = String::from_utf8_lossy(node_id).into_owned();
        let kind = MessageKind::try_from(kind)?;
        let payload = Payload::from_body(kind, body)?;
        Ok(Self { node_id, payload })
    }
}

/// Read exactly one envelope from a stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let node_id_len = reader.read_u16().await.map_err(truncated)? as usize;
    let mut node_id = vec![0u8; node_id_len];
    reader.read_exact(&mut node_id).await.map_err(truncated)?;
    let kind = reader.read_u16().await.map_err(truncated)?;
    let body_len = reader.read_u16().await.map_err(truncated)? as usize;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await.map_err(truncated)?;

    Message::from_parts(&node_id, kind, &body)
}

/// Reject a frame body that the u16 length prefix cannot describe.
pub fn check_len(size: usize) -> Result<()> {
    if size > MAX_FIELD_LEN {
        return Err(EventerError::PayloadTooLarge {
            size,
            max: MAX_FIELD_LEN,
        });
    }
    Ok(())
}

fn truncated(e: std::io::Error) -> EventerError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        EventerError::MalformedMessage("truncated envelope".to_string())
    } else {
        EventerError::Io(e)
    }
}

fn take_u16(cursor: &mut &[u8], what: &str) -> Result<u16> {
    let bytes = take(cursor, 2, what)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn take<'a>(cursor: &mut &'a [u8], n: usize, what: &str) -> Result<&'a [u8]> {
    if cursor.len() < n {
        return Err(EventerError::MalformedMessage(format!(
            "truncated {what}: need {n} bytes, have {}",
            cursor.len()
        )));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event::{args, EventArgs};
    use serde_json::Value;

    fn event_message(node_id: &str, event: Event) -> Message {
        Message::new(node_id, Payload::Event(event))
    }

    #[test]
    fn event_round_trip() {
        let event = Event::with_timestamp(
            1_700_000_000.123456,
            "test",
            args([("foo", Value::from("data")), ("n", Value::from(3))]),
        );
        let msg = event_message("node_1", event);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), MessageKind::Event);
    }

    #[test]
    fn ping_round_trip_with_empty_versions_and_host() {
        let msg = Message::new(
            "",
            Payload::Ping(Ping {
                versions: VersionVector::new(),
                host: String::new(),
                port: 0,
            }),
        );
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn ping_round_trip_preserves_float_versions() {
        let mut versions = VersionVector::new();
        versions.insert("a:1".to_string(), 1_712_345_678.000_001);
        versions.insert("b:2".to_string(), 0.1 + 0.2);
        let msg = Message::new(
            "a:1",
            Payload::Ping(Ping {
                versions,
                host: "a".to_string(),
                port: 1,
            }),
        );
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn sync_and_node_info_round_trip() {
        let sync = Message::new(
            "h:1",
            Payload::Sync(SyncRequest {
                host: "h".to_string(),
                port: 1,
            }),
        );
        assert_eq!(Message::decode(&sync.encode().unwrap()).unwrap(), sync);

        let request = Message::new("h:1", Payload::NodeInfo);
        let bytes = request.encode().unwrap();
        // empty payload still carries its length prefix
        assert_eq!(&bytes[bytes.len() - 2..], &[0, 0]);
        assert_eq!(Message::decode(&bytes).unwrap(), request);

        let response = Message::new(
            "h:2",
            Payload::NodeInfoResponse(NodeInfo {
                is_master: true,
                delay: 1.25,
            }),
        );
        assert_eq!(Message::decode(&response.encode().unwrap()).unwrap(), response);
    }

    #[test]
    fn header_layout_is_big_endian() {
        let msg = Message::new("ab", Payload::NodeInfo);
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, vec![0, 2, b'a', b'b', 0, 1, 0, 0]);
    }

    #[test]
    fn payload_near_limit_round_trips() {
        // JSON overhead for {"timestamp":1.5,"name":"big","args":{"s":"..."}}
        let overhead = serde_json::to_vec(&Event::with_timestamp(
            1.5,
            "big",
            args([("s", Value::from(""))]),
        ))
        .unwrap()
        .len();
        let filler = "x".repeat(MAX_FIELD_LEN - overhead);
        let event = Event::with_timestamp(1.5, "big", args([("s", Value::from(filler))]));
        let msg = event_message("n:1", event);
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 2 + 3 + 2 + 2 + MAX_FIELD_LEN);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn oversized_payload_fails_fast() {
        let filler = "x".repeat(MAX_FIELD_LEN);
        let event = Event::with_timestamp(1.0, "big", args([("s", Value::from(filler))]));
        let err = event_message("n:1", event).encode().unwrap_err();
        assert!(matches!(err, EventerError::PayloadTooLarge { .. }));
    }

    fn large_versions(entries: usize) -> VersionVector {
        (0..entries)
            .map(|i| (format!("10.0.0.1:{i:05}"), 1_700_000_000.5 + i as f64))
            .collect()
    }

    #[test]
    fn ping_near_limit_round_trips() {
        let mut ping = Ping {
            versions: large_versions(2_000),
            host: String::new(),
            port: 9090,
        };
        let base = serde_json::to_vec(&ping).unwrap().len();
        assert!(base < MAX_FIELD_LEN);
        ping.host = "h".repeat(MAX_FIELD_LEN - base);

        let msg = Message::new("n:1", Payload::Ping(ping));
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 2 + 3 + 2 + 2 + MAX_FIELD_LEN);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn sync_near_limit_round_trips() {
        let overhead = serde_json::to_vec(&SyncRequest {
            host: String::new(),
            port: 9090,
        })
        .unwrap()
        .len();
        let msg = Message::new(
            "n:1",
            Payload::Sync(SyncRequest {
                host: "h".repeat(MAX_FIELD_LEN - overhead),
                port: 9090,
            }),
        );
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 2 + 3 + 2 + 2 + MAX_FIELD_LEN);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn oversized_ping_fails_fast() {
        // ~30 bytes per entry puts this well past the limit
        let msg = Message::new(
            "n:1",
            Payload::Ping(Ping {
                versions: large_versions(3_000),
                host: "h".to_string(),
                port: 1,
            }),
        );
        let err = msg.encode().unwrap_err();
        assert!(matches!(
            err,
            EventerError::PayloadTooLarge { max: MAX_FIELD_LEN, .. }
        ));
    }

    #[test]
    fn oversized_or_non_ascii_node_id_fails() {
        let event = Event::with_timestamp(1.0, "e", EventArgs::new());
        let long_id = "n".repeat(MAX_FIELD_LEN + 1);
        assert!(matches!(
            event_message(&long_id, event.clone()).encode(),
            Err(EventerError::NodeIdTooLong(_))
        ));
        assert!(matches!(
            event_message("nöde", event).encode(),
            Err(EventerError::InvalidNodeId(_))
        ));
    }

    #[test]
    fn truncated_input_is_malformed() {
        let msg = Message::new(
            "node_1",
            Payload::Sync(SyncRequest {
                host: "h".to_string(),
                port: 9,
            }),
        );
        let bytes = msg.encode().unwrap();
        for cut in [0, 1, 5, 8, 9, bytes.len() - 1] {
            assert!(
                matches!(
                    Message::decode(&bytes[..cut]),
                    Err(EventerError::MalformedMessage(_))
                ),
                "cut at {cut} should be malformed"
            );
        }
    }

    #[test]
    fn trailing_bytes_and_unknown_kind_are_malformed() {
        let mut bytes = Message::new("n", Payload::NodeInfo).encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(EventerError::MalformedMessage(_))
        ));

        let unknown = vec![0, 1, b'n', 0, 9, 0, 0];
        assert!(matches!(
            Message::decode(&unknown),
            Err(EventerError::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn read_message_from_stream() {
        let msg = Message::new(
            "n:1",
            Payload::Sync(SyncRequest {
                host: "n".to_string(),
                port: 1,
            }),
        );
        let bytes = msg.encode().unwrap();
        let mut reader = bytes.as_slice();
        assert_eq!(read_message(&mut reader).await.unwrap(), msg);

        let mut short = &bytes[..bytes.len() - 3];
        assert!(matches!(
            read_message(&mut short).await,
            Err(EventerError::MalformedMessage(_))
        ));
    }
}
