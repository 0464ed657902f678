//! Persistent, bounded event log with its version vector.
//!
//! # File Format
//!
//! The storage directory holds two files:
//!
//! - `versions`: the version vector as a single JSON blob, rewritten in full
//!   on every mutation.
//! - `event.log`: a sequence of `[size:2][event json]` frames (size is a
//!   big-endian u16), read until end of file.
//!
//! A missing or unreadable file is not an error: the log starts empty and
//! immediately writes a fresh pair of files.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{EventerError, Result};
use crate::protocol::message::check_len;
use crate::protocol::{Event, VersionVector};

pub const DEFAULT_MAX_SIZE: usize = 1000;

const VERSIONS_FILE: &str = "versions";
const LOG_FILE: &str = "event.log";

#[derive(Debug)]
pub struct EventLog {
    versions_path: PathBuf,
    log_path: PathBuf,
    max_size: usize,
    versions: VersionVector,
    log: VecDeque<Event>,
    /// Set after a failed write: the files may not match memory.
    needs_rewrite: bool,
}

impl EventLog {
    /// Open the log stored under `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, max_size: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut event_log = Self {
            versions_path: dir.join(VERSIONS_FILE),
            log_path: dir.join(LOG_FILE),
            max_size: max_size.max(1),
            versions: VersionVector::new(),
            log: VecDeque::new(),
            needs_rewrite: false,
        };

        if event_log.versions_path.exists() && event_log.log_path.exists() {
            match event_log.load() {
                Ok(()) => {
                    tracing::debug!(
                        dir = %dir.display(),
                        events = event_log.log.len(),
                        "Event log restored"
                    );
                    return Ok(event_log);
                }
                Err(e) => {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %e,
                        "Event log unreadable, starting empty"
                    );
                    event_log.versions.clear();
                    event_log.log.clear();
                }
            }
        }

        event_log.store()?;
        Ok(event_log)
    }

    /// Accept `event` from `origin` unless it repeats the last version seen
    /// for that origin. Returns whether the event was appended.
    ///
    /// A failed write rolls the in-memory state back, so the event is only
    /// reported as accepted once it is on disk. Until a full rewrite succeeds
    /// every mutation rewrites both files.
    pub fn append(&mut self, origin: &str, event: Event) -> Result<bool> {
        if self.versions.get(origin) == Some(&event.timestamp) {
            return Ok(false);
        }

        let frame = encode_frame(&event)?;
        let previous = self.versions.insert(origin.to_string(), event.timestamp);
        self.log.push_back(event);
        let evicted = if self.log.len() > self.max_size {
            self.log.pop_front()
        } else {
            None
        };

        let persisted = if evicted.is_some() || self.needs_rewrite {
            self.store()
        } else {
            self.append_frame(&frame)
        };

        if let Err(e) = persisted {
            self.log.pop_back();
            if let Some(oldest) = evicted {
                self.log.push_front(oldest);
            }
            match previous {
                Some(version) => self.versions.insert(origin.to_string(), version),
                None => self.versions.remove(origin),
            };
            // best effort: bring the files back in line with memory
            self.needs_rewrite = self.store().is_err();
            tracing::warn!(
                path = %self.log_path.display(),
                error = %e,
                "Event log write failed, event not accepted"
            );
            return Err(e);
        }

        self.needs_rewrite = false;
        Ok(true)
    }

    /// True if an identical event is already logged.
    pub fn contains(&self, event: &Event) -> bool {
        self.log.iter().rev().any(|logged| logged == event)
    }

    /// Replace the whole state, e.g. with a snapshot taken from another node.
    pub fn restore(&mut self, versions: VersionVector, log: Vec<Event>) -> Result<()> {
        let skip = log.len().saturating_sub(self.max_size);
        self.versions = versions;
        self.log = log.into_iter().skip(skip).collect();
        let stored = self.store();
        self.needs_rewrite = stored.is_err();
        stored
    }

    pub fn versions(&self) -> &VersionVector {
        &self.versions
    }

    /// Accepted events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.log.iter()
    }

    /// Most recently accepted event.
    pub fn last(&self) -> Option<&Event> {
        self.log.back()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    fn load(&mut self) -> Result<()> {
        let raw_versions = fs::read(&self.versions_path)?;
        let versions: VersionVector = serde_json::from_slice(&raw_versions)?;

        let raw_log = fs::read(&self.log_path)?;
        let mut log = VecDeque::new();
        let mut cursor = raw_log.as_slice();
        while !cursor.is_empty() {
            if cursor.len() < 2 {
                return Err(EventerError::MalformedMessage(
                    "truncated log frame header".to_string(),
                ));
            }
            let size = u16::from_be_bytes([cursor[0], cursor[1]]) as usize;
            cursor = &cursor[2..];
            if cursor.len() < size {
                return Err(EventerError::MalformedMessage(
                    "truncated log frame".to_string(),
                ));
            }
            let (body, rest) = cursor.split_at(size);
            log.push_back(serde_json::from_slice::<Event>(body)?);
            cursor = rest;
        }

        while log.len() > self.max_size {
            log.pop_front();
        }

        self.versions = versions;
        self.log = log;
        Ok(())
    }

    /// Full rewrite of both files.
    fn store(&self) -> Result<()> {
        self.write_versions()?;

        let mut buf = Vec::new();
        for event in &self.log {
            buf.extend_from_slice(&encode_frame(event)?);
        }
        fs::write(&self.log_path, buf)?;
        Ok(())
    }

    fn append_frame(&self, frame: &[u8]) -> Result<()> {
        self.write_versions()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(frame)?;
        Ok(())
    }

    fn write_versions(&self) -> Result<()> {
        fs::write(&self.versions_path, serde_json::to_vec(&self.versions)?)?;
        Ok(())
    }
}

fn encode_frame(event: &Event) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(event)?;
    check_len(body.len())?;
    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{args, EventArgs};
    use serde_json::Value;
    use tempfile::tempdir;

    fn event(ts: f64) -> Event {
        Event::with_timestamp(ts, "test", args([("foo", Value::from("data"))]))
    }

    #[test]
    fn append_accepts_new_event() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        assert!(log.append("node_1", event(1.0)).unwrap());
        assert_eq!(log.len(), 1);
        assert_eq!(log.versions().get("node_1"), Some(&1.0));
    }

    #[test]
    fn duplicate_delivery_is_rejected() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        let e = event(42.5);
        assert!(log.append("node_1", e.clone()).unwrap());
        assert!(!log.append("node_1", e.clone()).unwrap());
        assert_eq!(log.len(), 1);

        // same timestamp from another origin is a different version
        assert!(log.append("node_2", e).unwrap());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn older_timestamp_is_still_accepted() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        assert!(log.append("node_1", event(2.0)).unwrap());
        assert!(log.append("node_1", event(1.0)).unwrap());
        assert_eq!(log.versions().get("node_1"), Some(&1.0));
    }

    #[test]
    fn max_size_evicts_oldest_first() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 3).unwrap();
        for i in 1..=5 {
            assert!(log.append("node_1", event(i as f64)).unwrap());
        }
        let kept: Vec<f64> = log.events().map(|e| e.timestamp).collect();
        assert_eq!(kept, vec![3.0, 4.0, 5.0]);
        drop(log);

        let reopened = EventLog::open(dir.path(), 3).unwrap();
        let kept: Vec<f64> = reopened.events().map(|e| e.timestamp).collect();
        assert_eq!(kept, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn failed_write_leaves_state_unchanged_and_retry_succeeds() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        assert!(log.append("node_1", event(1.0)).unwrap());

        // a directory where the log file should be makes every write fail
        let path = dir.path().join(LOG_FILE);
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(log.append("node_1", event(2.0)).is_err());
        assert_eq!(log.len(), 1);
        assert_eq!(log.versions().get("node_1"), Some(&1.0));
        assert!(log.append("node_2", event(3.0)).is_err());
        assert!(log.versions().get("node_2").is_none());

        fs::remove_dir(&path).unwrap();
        assert!(log.append("node_1", event(2.0)).unwrap());
        assert_eq!(log.len(), 2);
        drop(log);

        // the retry rewrote both files, including the event from before the failure
        let reopened = EventLog::open(dir.path(), 10).unwrap();
        let kept: Vec<f64> = reopened.events().map(|e| e.timestamp).collect();
        assert_eq!(kept, vec![1.0, 2.0]);
        assert_eq!(reopened.versions().get("node_1"), Some(&2.0));
    }

    #[test]
    fn failed_eviction_keeps_oldest_event() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 2).unwrap();
        log.append("node_1", event(1.0)).unwrap();
        log.append("node_1", event(2.0)).unwrap();

        let path = dir.path().join(LOG_FILE);
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(log.append("node_1", event(3.0)).is_err());
        let kept: Vec<f64> = log.events().map(|e| e.timestamp).collect();
        assert_eq!(kept, vec![1.0, 2.0]);
        assert_eq!(log.versions().get("node_1"), Some(&2.0));
    }

    #[test]
    fn contains_matches_whole_event() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        log.append("node_1", event(1.0)).unwrap();
        log.append("node_1", event(2.0)).unwrap();

        assert!(log.contains(&event(1.0)));
        assert!(!log.contains(&event(3.0)));
        let renamed = Event::with_timestamp(1.0, "other", args([("foo", Value::from("data"))]));
        assert!(!log.contains(&renamed));
    }

    #[test]
    fn store_and_reopen_round_trip() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        log.append("a:1", event(1_700_000_000.000_001)).unwrap();
        log.append("b:2", Event::with_timestamp(1_700_000_001.5, "other", EventArgs::new()))
            .unwrap();
        log.append("a:1", event(1_700_000_002.25)).unwrap();
        let versions = log.versions().clone();
        let events: Vec<Event> = log.events().cloned().collect();
        drop(log);

        let reopened = EventLog::open(dir.path(), 10).unwrap();
        assert_eq!(reopened.versions(), &versions);
        assert_eq!(reopened.events().cloned().collect::<Vec<_>>(), events);
        assert_eq!(reopened.last().unwrap().timestamp, 1_700_000_002.25);
    }

    #[test]
    fn corrupt_versions_file_resets_to_empty() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        log.append("node_1", event(1.0)).unwrap();
        drop(log);

        fs::write(dir.path().join(VERSIONS_FILE), b"{not json").unwrap();
        let log = EventLog::open(dir.path(), 10).unwrap();
        assert!(log.is_empty());
        assert!(log.versions().is_empty());

        // the reset state was persisted and loads cleanly
        let raw = fs::read(dir.path().join(VERSIONS_FILE)).unwrap();
        assert_eq!(raw, b"{}");
        assert_eq!(fs::read(dir.path().join(LOG_FILE)).unwrap().len(), 0);
    }

    #[test]
    fn truncated_log_frame_resets_to_empty() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        log.append("node_1", event(1.0)).unwrap();
        drop(log);

        let path = dir.path().join(LOG_FILE);
        let mut raw = fs::read(&path).unwrap();
        raw.truncate(raw.len() - 1);
        fs::write(&path, raw).unwrap();

        let log = EventLog::open(dir.path(), 10).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn missing_log_file_resets_to_empty() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        log.append("node_1", event(1.0)).unwrap();
        drop(log);

        fs::remove_file(dir.path().join(LOG_FILE)).unwrap();
        let log = EventLog::open(dir.path(), 10).unwrap();
        assert!(log.is_empty());
        assert!(log.versions().is_empty());
        assert!(dir.path().join(LOG_FILE).exists());
    }

    #[test]
    fn open_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let log = EventLog::open(&nested, 10).unwrap();
        assert!(log.is_empty());
        assert!(nested.join(VERSIONS_FILE).exists());
    }

    #[test]
    fn restore_replaces_state_and_persists() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 2).unwrap();
        log.append("node_1", event(1.0)).unwrap();

        let mut versions = VersionVector::new();
        versions.insert("master:1".to_string(), 30.0);
        log.restore(versions.clone(), vec![event(10.0), event(20.0), event(30.0)])
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.versions(), &versions);
        drop(log);

        let reopened = EventLog::open(dir.path(), 2).unwrap();
        let kept: Vec<f64> = reopened.events().map(|e| e.timestamp).collect();
        assert_eq!(kept, vec![20.0, 30.0]);
        assert_eq!(reopened.versions(), &versions);
    }

    #[test]
    fn oversized_event_is_rejected_without_mutation() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), 10).unwrap();
        let big = Event::with_timestamp(
            1.0,
            "big",
            args([("s", Value::from("x".repeat(70_000)))]),
        );
        assert!(matches!(
            log.append("node_1", big),
            Err(EventerError::PayloadTooLarge { .. })
        ));
        assert!(log.is_empty());
        assert!(log.versions().is_empty());
    }

    #[test]
    fn last_is_none_when_empty() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), 10).unwrap();
        assert!(log.last().is_none());
    }
}
