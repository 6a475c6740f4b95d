//! Single-slot refresh command handed from the dashboard to the agent.
//!
//! The dashboard asks for a refresh of the table list; the agent polls for a
//! pending command, runs it, and reports `started` and then a terminal
//! status. Only the newest command is kept.

use crate::clock::{Clock, EpochMillis};
use crate::persist::{read_json, write_json_atomic, StateError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const COMMAND_SOURCE: &str = "api";

/// Lifecycle of a refresh command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Started,
    Completed,
    Failed,
    Skipped,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Started => "started",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Skipped
        )
    }
}

impl FromStr for CommandStatus {
    type Err = ();

    /// Statuses an agent may report. `pending` is only ever set by the service.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "started" => Ok(CommandStatus::Started),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            "skipped" => Ok(CommandStatus::Skipped),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCommand {
    pub id: String,
    pub status: CommandStatus,
    pub requested_at: EpochMillis,
    pub updated_at: EpochMillis,
    pub requested_by: String,
    pub agent_id: Option<String>,
    pub note: Option<String>,
    pub error: Option<String>,
    pub online_count: Option<i64>,
    pub last_run_id: Option<String>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<EpochMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<EpochMillis>,
}

/// Fields an agent may attach to a status report.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub agent_id: Option<String>,
    pub note: Option<String>,
    pub error: Option<String>,
    pub last_run_id: Option<String>,
    pub online_count: Option<i64>,
}

/// Persisted slot contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshSnapshot {
    pub command: Option<RefreshCommand>,
    pub updated_at: EpochMillis,
}

/// File-backed refresh command slot.
pub struct RefreshCommands {
    path: PathBuf,
    slot: Mutex<RefreshSnapshot>,
    clock: Arc<dyn Clock>,
}

impl RefreshCommands {
    pub fn load(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, StateError> {
        let path = path.into();
        let slot = match read_json::<RefreshSnapshot>(&path) {
            Some(slot) => slot,
            None => {
                let slot = RefreshSnapshot::default();
                write_json_atomic(&path, &slot)?;
                slot
            }
        };

        Ok(Self {
            path,
            slot: Mutex::new(slot),
            clock,
        })
    }

    pub fn snapshot(&self) -> RefreshSnapshot {
        self.slot.lock().clone()
    }

    pub fn current(&self) -> Option<RefreshCommand> {
        self.slot.lock().command.clone()
    }

    pub fn pending(&self) -> Option<RefreshCommand> {
        self.slot
            .lock()
            .command
            .clone()
            .filter(|cmd| cmd.status == CommandStatus::Pending)
    }

    /// Return the pending command if there is one, otherwise create one.
    ///
    /// The flag is `true` when an existing command was reused. Both steps run
    /// under the slot lock so concurrent requests never create two commands.
    pub fn pending_or_create(
        &self,
        requested_by: &str,
    ) -> Result<(RefreshCommand, bool), StateError> {
        let mut slot = self.slot.lock();
        if let Some(cmd) = slot
            .command
            .as_ref()
            .filter(|cmd| cmd.status == CommandStatus::Pending)
        {
            return Ok((cmd.clone(), true));
        }
        self.create_locked(&mut slot, requested_by)
            .map(|cmd| (cmd, false))
    }

    fn create_locked(
        &self,
        slot: &mut RefreshSnapshot,
        requested_by: &str,
    ) -> Result<RefreshCommand, StateError> {
        let now = self.clock.now_ms();
        let requested_by = match requested_by.trim() {
            "" => "frontend",
            name => name,
        };
        let command = RefreshCommand {
            id: format!("cmd-{}", Uuid::new_v4().simple()),
            status: CommandStatus::Pending,
            requested_at: now,
            updated_at: now,
            requested_by: requested_by.to_string(),
            agent_id: None,
            note: None,
            error: None,
            online_count: None,
            last_run_id: None,
            source: COMMAND_SOURCE.to_string(),
            started_at: None,
            finished_at: None,
        };

        slot.command = Some(command.clone());
        slot.updated_at = now;
        write_json_atomic(&self.path, &*slot)?;

        info!(
            command_id = %command.id,
            requested_by = %command.requested_by,
            "Refresh command created"
        );
        Ok(command)
    }

    /// Apply an agent status report to the command with `id`.
    ///
    /// Returns `Ok(None)` when the slot holds a different command or none.
    pub fn update_status(
        &self,
        id: &str,
        status: CommandStatus,
        patch: StatusPatch,
    ) -> Result<Option<RefreshCommand>, StateError> {
        let now = self.clock.now_ms();
        let mut slot = self.slot.lock();

        let Some(cmd) = slot.command.as_mut().filter(|cmd| !id.is_empty() && cmd.id == id) else {
            return Ok(None);
        };

        cmd.status = status;
        cmd.updated_at = now;
        if let Some(agent_id) = non_empty(patch.agent_id) {
            cmd.agent_id = Some(agent_id);
        }
        if let Some(note) = non_empty(patch.note) {
            cmd.note = Some(note);
        }
        cmd.error = non_empty(patch.error);
        if let Some(run_id) = non_empty(patch.last_run_id) {
            cmd.last_run_id = Some(run_id);
        }
        if patch.online_count.is_some() {
            cmd.online_count = patch.online_count;
        }
        if status == CommandStatus::Started && cmd.started_at.is_none() {
            cmd.started_at = Some(now);
        }
        if status.is_terminal() {
            cmd.finished_at = Some(now);
        }

        let updated = cmd.clone();
        slot.updated_at = now;
        write_json_atomic(&self.path, &*slot)?;

        info!(
            command_id = %updated.id,
            status = updated.status.as_str(),
            "Refresh command updated"
        );
        Ok(Some(updated))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn slot(dir: &TempDir) -> (RefreshCommands, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let commands =
            RefreshCommands::load(dir.path().join("refresh_command.json"), clock.clone()).unwrap();
        (commands, clock)
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(" Started ".parse::<CommandStatus>(), Ok(CommandStatus::Started));
        assert_eq!("FAILED".parse::<CommandStatus>(), Ok(CommandStatus::Failed));
        assert!("pending".parse::<CommandStatus>().is_err());
        assert!("done".parse::<CommandStatus>().is_err());
    }

    #[test]
    fn test_first_request_makes_pending_command() {
        let dir = TempDir::new().unwrap();
        let (commands, _) = slot(&dir);
        assert!(commands.pending().is_none());

        let cmd = commands.pending_or_create("  ").unwrap().0;

        assert!(cmd.id.starts_with("cmd-"));
        assert_eq!(cmd.requested_by, "frontend");
        assert_eq!(cmd.source, "api");
        assert_eq!(commands.pending(), Some(cmd.clone()));
        assert_eq!(commands.snapshot().updated_at, 1_000);
    }

    #[test]
    fn test_lifecycle_stamps_times() {
        let dir = TempDir::new().unwrap();
        let (commands, clock) = slot(&dir);
        let cmd = commands.pending_or_create("dashboard").unwrap().0;

        clock.advance(10);
        let started = commands
            .update_status(
                &cmd.id,
                CommandStatus::Started,
                StatusPatch {
                    agent_id: Some("agent-1".to_string()),
                    error: Some("stale".to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(started.started_at, Some(1_010));
        assert_eq!(started.agent_id.as_deref(), Some("agent-1"));
        assert!(commands.pending().is_none());

        clock.advance(10);
        let done = commands
            .update_status(
                &cmd.id,
                CommandStatus::Completed,
                StatusPatch {
                    online_count: Some(12),
                    last_run_id: Some("run-3".to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(done.started_at, Some(1_010));
        assert_eq!(done.finished_at, Some(1_020));
        assert_eq!(done.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(done.error, None);
        assert_eq!(done.online_count, Some(12));
        assert_eq!(commands.current(), Some(done));
    }

    #[test]
    fn test_update_unknown_id_is_none() {
        let dir = TempDir::new().unwrap();
        let (commands, _) = slot(&dir);
        assert_eq!(
            commands
                .update_status("cmd-x", CommandStatus::Started, StatusPatch::default())
                .unwrap(),
            None
        );

        commands.pending_or_create("dashboard").unwrap();
        assert_eq!(
            commands
                .update_status("cmd-x", CommandStatus::Started, StatusPatch::default())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_pending_or_create_reuses_pending() {
        let dir = TempDir::new().unwrap();
        let (commands, _) = slot(&dir);

        let (first, reused) = commands.pending_or_create("dashboard").unwrap();
        assert!(!reused);
        let (again, reused) = commands.pending_or_create("someone-else").unwrap();
        assert!(reused);
        assert_eq!(again, first);

        commands
            .update_status(&first.id, CommandStatus::Skipped, StatusPatch::default())
            .unwrap();
        let (next, reused) = commands.pending_or_create("dashboard").unwrap();
        assert!(!reused);
        assert_ne!(next.id, first.id);
    }

    #[test]
    fn test_slot_survives_reload() {
        let dir = TempDir::new().unwrap();
        let (commands, clock) = slot(&dir);
        let cmd = commands.pending_or_create("dashboard").unwrap().0;

        let reloaded =
            RefreshCommands::load(dir.path().join("refresh_command.json"), clock).unwrap();
        assert_eq!(reloaded.pending(), Some(cmd));
    }
}
