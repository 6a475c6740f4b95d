//! Queue statistics.

use super::lease::expire_stale_claims;
use super::store::QueueStore;
use crate::clock::EpochMillis;
use serde::{Deserialize, Serialize};

/// Lifetime counters. Reset only when the process restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounters {
    pub accepted: u64,
    pub deduped: u64,
    pub acked: u64,
    pub claimed: u64,
    pub rejected: u64,
    pub last_push_at: Option<EpochMillis>,
    pub last_claim_at: Option<EpochMillis>,
    pub last_ack_at: Option<EpochMillis>,
    pub last_seq: u64,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_count: usize,
    pub claimed_count: usize,
    pub unclaimed_count: usize,
    pub oldest_created_at: Option<EpochMillis>,
    pub newest_created_at: Option<EpochMillis>,
    pub stats: QueueCounters,
}

/// Build a fresh snapshot. Stale leases are expired first so the claimed
/// count never includes a lapsed lease.
pub fn snapshot(store: &mut QueueStore, counters: &QueueCounters, now: EpochMillis) -> QueueStats {
    expire_stale_claims(store, now);

    let mut claimed_count = 0;
    let mut oldest: Option<EpochMillis> = None;
    let mut newest: Option<EpochMillis> = None;

    for record in store.iter() {
        if record.claim.as_ref().is_some_and(|lease| lease.is_active(now)) {
            claimed_count += 1;
        }
        oldest = Some(oldest.map_or(record.created_at, |t| t.min(record.created_at)));
        newest = Some(newest.map_or(record.created_at, |t| t.max(record.created_at)));
    }

    let queue_count = store.len();
    QueueStats {
        queue_count,
        claimed_count,
        unclaimed_count: queue_count - claimed_count,
        oldest_created_at: oldest,
        newest_created_at: newest,
        stats: QueueCounters {
            last_seq: store.last_seq(),
            ..counters.clone()
        },
    }
}
