//! Raw frame work queue.
//!
//! Agents push scraped table frames; consumers claim them under a lease,
//! process them, and acknowledge them. Delivery is at-least-once: a frame
//! whose lease lapses without an ack becomes claimable again.
//!
//! ## Locking contract
//!
//! A [`FrameQueue`] owns one mutex guarding the record store, the dedup
//! window and the counters together. Every public operation takes the lock
//! once, samples the clock once, and releases the lock on return, so no
//! operation ever observes another one half-applied. Claim scans, stats and
//! capacity checks all walk the whole collection, which is why the lock is
//! not split per record.

pub mod ack;
pub mod dedup;
pub mod lease;
pub mod sanitize;
pub mod stats;
pub mod store;

use crate::clock::{Clock, EpochMillis, SystemClock};
use crate::config::QueueConfig;
use ack::AckSummary;
use dedup::DedupWindow;
use lease::ClaimedFrame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stats::{QueueCounters, QueueStats};
use std::sync::Arc;
use std::time::Duration;
use store::QueueStore;
use tracing::{debug, warn};

/// Most items accepted in one push call.
pub const MAX_PUSH_ITEMS: usize = 200;
/// Most ids accepted in one ack call.
pub const MAX_ACK_IDS: usize = 1000;

const DEDUP_REASON: &str = "recent_key";

/// Tunables for a queue instance.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    pub default_recent_ttl: Duration,
    pub default_lease: Duration,
    pub default_claim_limit: usize,
    pub default_consumer: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: store::MAX_QUEUE_ITEMS,
            default_recent_ttl: dedup::DEFAULT_RECENT_TTL,
            default_lease: lease::DEFAULT_LEASE,
            default_claim_limit: lease::DEFAULT_CLAIM_LIMIT,
            default_consumer: lease::DEFAULT_CONSUMER.to_string(),
        }
    }
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            capacity: config.capacity,
            default_recent_ttl: config.default_recent_ttl(),
            default_lease: config.default_lease(),
            default_claim_limit: config.default_claim_limit,
            default_consumer: config.default_consumer.clone(),
        }
    }
}

/// Summary of one admitted frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedFrame {
    pub id: String,
    pub seq: u64,
    pub frame_key: String,
    pub round_key: String,
    pub id_table: String,
    pub id_round: Option<i64>,
    pub logs_len: u64,
    pub created_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupedFrame {
    pub frame_key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedFrame {
    pub reason: String,
    pub frame_key: String,
}

/// Per-item result of a push batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub accepted: Vec<AcceptedFrame>,
    pub deduped: Vec<DedupedFrame>,
    pub rejected: Vec<RejectedFrame>,
    pub accepted_count: usize,
    pub deduped_count: usize,
    pub rejected_count: usize,
}

/// Claim parameters as supplied by a consumer; unset fields use defaults.
#[derive(Debug, Clone, Default)]
pub struct ClaimRequest {
    pub limit: Option<u64>,
    pub consumer: Option<String>,
    pub claim_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    pub count: usize,
    pub consumer: String,
    pub claim_ms: u64,
    pub items: Vec<ClaimedFrame>,
}

#[derive(Debug)]
struct QueueState {
    store: QueueStore,
    dedup: DedupWindow,
    counters: QueueCounters,
}

/// In-memory frame queue with dedup, leases and ownership-checked acks.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl FrameQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                store: QueueStore::new(settings.capacity),
                dedup: DedupWindow::new(),
                counters: QueueCounters::default(),
            }),
            clock,
            settings,
        }
    }

    pub fn now_ms(&self) -> EpochMillis {
        self.clock.now_ms()
    }

    /// Admit a batch of raw payloads.
    ///
    /// Each item is classified on its own: invalid items are rejected,
    /// keys seen within `recent_ttl_ms` are deduped, and items arriving at a
    /// full queue are rejected with `queue_full`.
    pub fn push(&self, items: &[Value], recent_ttl_ms: Option<u64>) -> PushOutcome {
        let ttl = dedup::clamp_recent_ttl(recent_ttl_ms, self.settings.default_recent_ttl);

        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        let QueueState {
            store,
            dedup,
            counters,
        } = &mut *state;

        dedup.prune(ttl, now);
        lease::expire_stale_claims(store, now);

        let mut outcome = PushOutcome::default();

        for raw in items {
            let item = match sanitize::sanitize_payload(raw, now) {
                Ok(item) => item,
                Err(e) => {
                    counters.rejected += 1;
                    outcome.rejected.push(RejectedFrame {
                        reason: e.reason().to_string(),
                        frame_key: e.frame_key().to_string(),
                    });
                    continue;
                }
            };

            if dedup.is_recently_seen(&item.frame_key) {
                counters.deduped += 1;
                outcome.deduped.push(DedupedFrame {
                    frame_key: item.frame_key,
                    reason: DEDUP_REASON.to_string(),
                });
                continue;
            }

            let frame_key = item.frame_key.clone();
            match store.admit(item, now) {
                Ok(record) => {
                    outcome.accepted.push(AcceptedFrame {
                        id: record.id.clone(),
                        seq: record.seq,
                        frame_key: record.payload.frame_key.clone(),
                        round_key: record.payload.round_key.clone(),
                        id_table: record.payload.id_table.clone(),
                        id_round: record.payload.id_round,
                        logs_len: record.payload.logs_len,
                        created_at: record.created_at,
                    });
                    dedup.record_seen(&frame_key, now);
                    counters.accepted += 1;
                }
                Err(e) => {
                    if !outcome.rejected.iter().any(|r| r.reason == e.reason()) {
                        warn!(capacity = store.capacity(), "Frame queue full, rejecting pushes");
                    }
                    counters.rejected += 1;
                    outcome.rejected.push(RejectedFrame {
                        reason: e.reason().to_string(),
                        frame_key,
                    });
                }
            }
        }

        counters.last_push_at = Some(now);
        counters.last_seq = store.last_seq();

        outcome.accepted_count = outcome.accepted.len();
        outcome.deduped_count = outcome.deduped.len();
        outcome.rejected_count = outcome.rejected.len();

        metrics::counter!("frame_queue.accepted").increment(outcome.accepted_count as u64);
        metrics::counter!("frame_queue.deduped").increment(outcome.deduped_count as u64);
        metrics::counter!("frame_queue.rejected").increment(outcome.rejected_count as u64);
        metrics::gauge!("frame_queue.depth").set(store.len() as f64);
        metrics::gauge!("frame_queue.dedup_keys").set(dedup.len() as f64);

        debug!(
            items = items.len(),
            accepted = outcome.accepted_count,
            deduped = outcome.deduped_count,
            rejected = outcome.rejected_count,
            depth = store.len(),
            dedup_keys = dedup.len(),
            "Processed frame push"
        );

        outcome
    }

    /// Lease up to `limit` unclaimed frames to a consumer, oldest first.
    pub fn claim(&self, request: ClaimRequest) -> ClaimOutcome {
        let limit = lease::clamp_claim_limit(request.limit, self.settings.default_claim_limit);
        let lease_for = lease::clamp_lease(request.claim_ms, self.settings.default_lease);
        let consumer =
            lease::normalize_consumer(request.consumer.as_deref(), &self.settings.default_consumer);

        let mut state = self.state.lock();
        let now = self.clock.now_ms();

        let items = lease::claim_many(&mut state.store, limit, &consumer, lease_for, now);

        state.counters.claimed += items.len() as u64;
        state.counters.last_claim_at = Some(now);

        metrics::counter!("frame_queue.claimed").increment(items.len() as u64);

        debug!(
            consumer = %consumer,
            limit = limit,
            claimed = items.len(),
            lease_ms = lease_for.as_millis() as u64,
            "Processed frame claim"
        );

        ClaimOutcome {
            count: items.len(),
            consumer,
            claim_ms: lease_for.as_millis() as u64,
            items,
        }
    }

    /// Acknowledge processed frames. An absent or blank consumer skips the
    /// ownership check.
    pub fn ack<S: AsRef<str>>(&self, ids: &[S], consumer: Option<&str>) -> AckSummary {
        let consumer: String = consumer
            .map(str::trim)
            .unwrap_or_default()
            .chars()
            .take(lease::MAX_CONSUMER_LEN)
            .collect();

        let mut state = self.state.lock();
        let now = self.clock.now_ms();

        let summary = ack::ack_many(&mut state.store, ids, &consumer, now);

        if summary.acked > 0 {
            state.counters.acked += summary.acked as u64;
            state.counters.last_ack_at = Some(now);
        }

        metrics::counter!("frame_queue.acked").increment(summary.acked as u64);
        metrics::counter!("frame_queue.denied").increment(summary.denied as u64);
        metrics::gauge!("frame_queue.depth").set(state.store.len() as f64);

        if summary.denied > 0 {
            warn!(
                consumer = %consumer,
                denied = summary.denied,
                "Ack denied for frames leased to another consumer"
            );
        }
        debug!(
            consumer = %consumer,
            acked = summary.acked,
            missing = summary.missing,
            denied = summary.denied,
            "Processed frame ack"
        );

        summary
    }

    /// Current queue statistics, computed fresh on every call.
    pub fn stats(&self) -> QueueStats {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        let QueueState {
            store, counters, ..
        } = &mut *state;
        stats::snapshot(store, counters, now)
    }
}
