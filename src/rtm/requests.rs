//! Outstanding-request correlation.
//!
//! Every outbound PDU that expects an acknowledgement is recorded here under
//! its request id; the matching `.../ok` or `.../error` takes the record
//! back out. Ids are allocated from one process-global monotonic counter
//! shared with pings, so an id observed anywhere in the protocol is unique.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::pdu::Pdu;
use super::RequestCallbacksRef;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next request id.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// One request awaiting its acknowledgement.
pub struct RequestRecord {
    pub kind: RequestKind,
    pub channel: String,
    pub pdu: Pdu,
    pub issued_at: Instant,
    /// Encoded size, for byte accounting at write completion.
    pub wire_bytes: usize,
    pub callbacks: Option<RequestCallbacksRef>,
}

/// Map of open request ids to their records.
#[derive(Default)]
pub struct RequestTracker {
    open: HashMap<u64, RequestRecord>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issued request. Panics if the id is already tracked; ids
    /// are globally unique, so a duplicate means corrupted bookkeeping.
    pub fn insert(&mut self, id: u64, record: RequestRecord) {
        let previous = self.open.insert(id, record);
        assert!(previous.is_none(), "duplicate request id {id}");
    }

    /// Look at an open request without disposing of it.
    pub fn get(&self, id: u64) -> Option<&RequestRecord> {
        self.open.get(&id)
    }

    /// Take an open request out of the tracker.
    pub fn take(&mut self, id: u64) -> Option<RequestRecord> {
        self.open.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn clear(&mut self) {
        self.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtm::pdu::publish_pdu;

    fn record(kind: RequestKind, channel: &str) -> RequestRecord {
        RequestRecord {
            kind,
            channel: channel.to_string(),
            pdu: publish_pdu(0, channel, serde_json::json!({})),
            issued_at: Instant::now(),
            wire_bytes: 0,
            callbacks: None,
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        let c = next_request_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_insert_take_round_trip() {
        let mut tracker = RequestTracker::new();
        let id = next_request_id();

        tracker.insert(id, record(RequestKind::Publish, "c"));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(id).is_some());

        let taken = tracker.take(id).unwrap();
        assert_eq!(taken.kind, RequestKind::Publish);
        assert_eq!(taken.channel, "c");
        assert!(tracker.is_empty());

        // A second take finds nothing.
        assert!(tracker.take(id).is_none());
    }

    #[test]
    fn test_size_decreases_by_one_per_ack() {
        let mut tracker = RequestTracker::new();
        let ids: Vec<u64> = (0..4).map(|_| next_request_id()).collect();
        for id in &ids {
            tracker.insert(*id, record(RequestKind::Subscribe, "s"));
        }

        for (n, id) in ids.iter().enumerate() {
            assert_eq!(tracker.len(), 4 - n);
            tracker.take(*id).unwrap();
            assert_eq!(tracker.len(), 4 - n - 1);
        }
    }

    #[test]
    #[should_panic(expected = "duplicate request id")]
    fn test_duplicate_insert_panics() {
        let mut tracker = RequestTracker::new();
        let id = next_request_id();
        tracker.insert(id, record(RequestKind::Publish, "a"));
        tracker.insert(id, record(RequestKind::Publish, "b"));
    }
}
