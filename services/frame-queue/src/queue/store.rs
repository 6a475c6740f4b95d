//! Pending frame records, indexed by id and by admission sequence.

use super::lease::Lease;
use super::sanitize::SanitizedFrame;
use crate::clock::EpochMillis;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use uuid::Uuid;

/// Hard ceiling on pending records.
pub const MAX_QUEUE_ITEMS: usize = 200_000;

/// Errors raised while admitting a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("Queue full ({capacity} pending records)")]
    QueueFull { capacity: usize },
}

impl AdmitError {
    pub fn reason(&self) -> &'static str {
        match self {
            AdmitError::QueueFull { .. } => "queue_full",
        }
    }
}

/// One admitted frame.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Opaque unique id (`rf-<uuid>`)
    pub id: String,
    /// Admission sequence, strictly increasing
    pub seq: u64,
    /// Admission time
    pub created_at: EpochMillis,
    /// Current lease, if any
    pub claim: Option<Lease>,
    /// Number of leases ever granted on this record
    pub attempts: u32,
    pub payload: SanitizedFrame,
}

/// Id index plus sequence-ordered record map.
///
/// Records live in a `BTreeMap` keyed by sequence number, so in-order
/// iteration is the FIFO claim order and removal keeps both indices exact.
#[derive(Debug)]
pub struct QueueStore {
    records: BTreeMap<u64, FrameRecord>,
    seq_by_id: HashMap<String, u64>,
    last_seq: u64,
    capacity: usize,
}

impl QueueStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            seq_by_id: HashMap::new(),
            last_seq: 0,
            capacity,
        }
    }

    /// Admit a sanitized frame, assigning it an id and the next sequence.
    ///
    /// A full queue leaves the store untouched.
    pub fn admit(
        &mut self,
        payload: SanitizedFrame,
        now: EpochMillis,
    ) -> Result<&FrameRecord, AdmitError> {
        if self.records.len() >= self.capacity {
            return Err(AdmitError::QueueFull {
                capacity: self.capacity,
            });
        }

        let id = self.next_id();
        self.last_seq += 1;
        let seq = self.last_seq;

        self.seq_by_id.insert(id.clone(), seq);
        self.records.insert(
            seq,
            FrameRecord {
                id,
                seq,
                created_at: now,
                claim: None,
                attempts: 0,
                payload,
            },
        );
        Ok(&self.records[&seq])
    }

    pub fn get(&self, id: &str) -> Option<&FrameRecord> {
        self.seq_by_id
            .get(id)
            .and_then(|seq| self.records.get(seq))
    }

    pub fn remove(&mut self, id: &str) -> Option<FrameRecord> {
        let seq = self.seq_by_id.remove(id)?;
        self.records.remove(&seq)
    }

    /// Records in ascending sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &FrameRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FrameRecord> {
        self.records.values_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest sequence number handed out so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    fn next_id(&self) -> String {
        loop {
            let id = format!("rf-{}", Uuid::new_v4().simple());
            if !self.seq_by_id.contains_key(&id) {
                return id;
            }
        }
    }
}
