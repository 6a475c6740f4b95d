//! Ownership-checked acknowledgment of processed frames.

use super::store::{FrameRecord, QueueStore};
use crate::clock::EpochMillis;
use serde::{Deserialize, Serialize};

/// Per-id outcome of an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Record deleted.
    Acked,
    /// Another consumer holds an active lease; record kept.
    Denied,
    /// No such record.
    Missing,
}

/// Totals for one ack batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckSummary {
    pub acked: usize,
    pub missing: usize,
    pub denied: usize,
    pub requested: usize,
}

/// Decide what an ack by `consumer` does to `record`.
///
/// An empty consumer acks unconditionally. A record with no active lease has
/// no owner to protect, so any consumer may ack it.
pub fn classify(record: Option<&FrameRecord>, consumer: &str, now: EpochMillis) -> AckOutcome {
    let Some(record) = record else {
        return AckOutcome::Missing;
    };
    match &record.claim {
        Some(lease)
            if !consumer.is_empty() && lease.is_active(now) && !lease.is_held_by(consumer) =>
        {
            AckOutcome::Denied
        }
        _ => AckOutcome::Acked,
    }
}

/// Acknowledge a batch of ids on behalf of `consumer`.
///
/// Blank ids are skipped but still count towards `requested`.
pub fn ack_many<S: AsRef<str>>(
    store: &mut QueueStore,
    ids: &[S],
    consumer: &str,
    now: EpochMillis,
) -> AckSummary {
    let mut summary = AckSummary {
        requested: ids.len(),
        ..Default::default()
    };

    for raw in ids {
        let id = raw.as_ref().trim();
        if id.is_empty() {
            continue;
        }
        match classify(store.get(id), consumer, now) {
            AckOutcome::Acked => {
                store.remove(id);
                summary.acked += 1;
            }
            AckOutcome::Denied => summary.denied += 1,
            AckOutcome::Missing => summary.missing += 1,
        }
    }

    summary
}
