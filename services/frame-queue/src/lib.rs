//! Tablespy Frame Queue
//!
//! Relay between table tracking agents and the backend workers that turn raw
//! table frames into game state. Agents push frames as they scrape them;
//! workers claim batches under a time-limited lease and acknowledge them once
//! processed.
//!
//! ## Features
//!
//! - **Idempotent Admission**: every frame is sanitized and keyed; a key seen
//!   within the caller's dedup window is not admitted twice
//! - **Lease-Based Claiming**: frames are handed out oldest first and become
//!   claimable again when a lease lapses without an ack
//! - **Ownership-Checked Acks**: a consumer cannot acknowledge a frame that is
//!   actively leased to someone else
//! - **Agent Coordination**: the agent's active table list and a single
//!   refresh command slot are kept on disk and shared with the dashboard
//!
//! ## Architecture
//!
//! ```text
//!  Tracking Agent                                      Backend Workers
//! ┌──────────────┐  push     ┌──────────────┐  claim  ┌──────────────┐
//! │ raw frames   │──────────▶│ FrameQueue   │◀───────│ consumer c1  │
//! └──────────────┘           │  sanitize    │  ack    │ consumer c2  │
//!        │                   │  dedup       │◀───────│              │
//!        │ active list       │  leases      │         └──────────────┘
//!        ▼                   └──────────────┘
//! ┌──────────────┐                  │
//! │ ActiveTables │                  ▼
//! │ RefreshCmds  │           ┌──────────────┐
//! │ (state dir)  │           │ stats/health │
//! └──────────────┘           └──────────────┘
//! ```
//!
//! The queue itself is held in memory only; a restart drops pending frames
//! and agents resend them.

pub mod active_tables;
pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod persist;
pub mod queue;
pub mod refresh_command;

pub use active_tables::{ActiveTables, ActiveTablesDoc, TablesMeta};
pub use api::{create_router, start_api_server, ApiError, AppState};
pub use auth::AgentAuth;
pub use clock::{Clock, EpochMillis, ManualClock, SystemClock};
pub use config::Config;
pub use queue::ack::AckSummary;
pub use queue::stats::QueueStats;
pub use queue::{ClaimOutcome, ClaimRequest, FrameQueue, PushOutcome, QueueSettings};
pub use refresh_command::{CommandStatus, RefreshCommand, RefreshCommands};
