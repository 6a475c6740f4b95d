//! Consumer leases over queued frames.
//!
//! A lease gives one consumer exclusive processing rights on a record until
//! `claim_until`. Leases are never renewed; once one lapses the record goes
//! back to the claimable pool and any consumer may take it.

use super::sanitize::SanitizedFrame;
use super::store::QueueStore;
use crate::clock::EpochMillis;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_CLAIM_LIMIT: usize = 1;
pub const MAX_CLAIM_LIMIT: usize = 500;
pub const DEFAULT_CLAIM_LIMIT: usize = 100;

pub const MIN_LEASE: Duration = Duration::from_secs(5);
pub const MAX_LEASE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Longest consumer name kept on a lease.
pub const MAX_CONSUMER_LEN: usize = 80;
pub const DEFAULT_CONSUMER: &str = "be";

/// An exclusive, time-bounded claim on one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub consumer: String,
    pub claimed_at: EpochMillis,
    pub claim_until: EpochMillis,
    /// Grants so far on the record, this one included
    pub attempts: u32,
}

impl Lease {
    pub fn is_active(&self, now: EpochMillis) -> bool {
        self.claim_until > now
    }

    pub fn is_held_by(&self, consumer: &str) -> bool {
        self.consumer == consumer
    }
}

/// Detached copy of a record handed to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedFrame {
    pub id: String,
    pub seq: u64,
    pub created_at: EpochMillis,
    pub claim: Lease,
    pub payload: SanitizedFrame,
}

pub fn clamp_claim_limit(requested: Option<u64>, default: usize) -> usize {
    let limit = match requested {
        Some(n) if n > 0 => usize::try_from(n).unwrap_or(MAX_CLAIM_LIMIT),
        _ => default,
    };
    limit.clamp(MIN_CLAIM_LIMIT, MAX_CLAIM_LIMIT)
}

pub fn clamp_lease(requested_ms: Option<u64>, default: Duration) -> Duration {
    let lease = match requested_ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => default,
    };
    lease.clamp(MIN_LEASE, MAX_LEASE)
}

/// Trim and bound a consumer name; blank names fall back to `default`.
pub fn normalize_consumer(raw: Option<&str>, default: &str) -> String {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    let name = if trimmed.is_empty() { default } else { trimmed };
    name.chars().take(MAX_CONSUMER_LEN).collect()
}

/// Clear every lease whose window has closed. Attempts stay on the record.
pub fn expire_stale_claims(store: &mut QueueStore, now: EpochMillis) -> usize {
    let mut expired = 0;
    for record in store.iter_mut() {
        if record.claim.as_ref().is_some_and(|lease| !lease.is_active(now)) {
            record.claim = None;
            expired += 1;
        }
    }
    expired
}

/// Lease up to `limit` unclaimed records to `consumer`, oldest first.
pub fn claim_many(
    store: &mut QueueStore,
    limit: usize,
    consumer: &str,
    lease: Duration,
    now: EpochMillis,
) -> Vec<ClaimedFrame> {
    expire_stale_claims(store, now);

    let lease_ms = lease.as_millis() as u64;
    let mut claimed = Vec::with_capacity(limit.min(store.len()));

    for record in store.iter_mut() {
        if claimed.len() >= limit {
            break;
        }
        if record.claim.is_some() {
            continue;
        }

        record.attempts += 1;
        let lease = Lease {
            consumer: consumer.to_string(),
            claimed_at: now,
            claim_until: now.saturating_add(lease_ms),
            attempts: record.attempts,
        };
        record.claim = Some(lease.clone());

        claimed.push(ClaimedFrame {
            id: record.id.clone(),
            seq: record.seq,
            created_at: record.created_at,
            claim: lease,
            payload: record.payload.clone(),
        });
    }

    claimed
}
