use std::sync::Arc;

use crate::db::models::WorkspaceState;
use crate::db::{Database, WorkspaceLock};
use crate::error::{Error, Result};

/// Allowed workspace state transitions.
pub fn can_transition(from: WorkspaceState, to: WorkspaceState) -> bool {
    use WorkspaceState::*;
    matches!(
        (from, to),
        (Created, Planning)
            | (Planning, PlanDone)
            | (Planning, Failed)
            | (PlanDone, WaitingApply)
            | (PlanDone, Planning)
            | (WaitingApply, Applying)
            | (WaitingApply, Planning)
            | (WaitingApply, Completed)
            | (Applying, Completed)
            | (Applying, Failed)
            | (Failed, Planning)
            | (Completed, Planning)
    )
}

/// Workspace state machine and advisory lock.
pub struct LifecycleController {
    db: Arc<Database>,
}

impl LifecycleController {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn state(&self, workspace_id: &str) -> Result<WorkspaceState> {
        Ok(self.db.get_workspace(workspace_id)?.state)
    }

    /// Move the workspace to `to`, refusing locked workspaces and
    /// transitions outside the table.
    pub fn transition(&self, workspace_id: &str, to: WorkspaceState) -> Result<()> {
        let workspace = self.db.get_workspace(workspace_id)?;
        if workspace.is_locked {
            return Err(Error::LockHeld(format!(
                "workspace {} is locked by {}: {}",
                workspace_id,
                workspace.locked_by.as_deref().unwrap_or("unknown"),
                workspace.lock_reason
            )));
        }
        if !can_transition(workspace.state, to) {
            return Err(Error::IllegalTransition {
                from: workspace.state.to_string(),
                to: to.to_string(),
            });
        }
        self.db.set_workspace_state(workspace_id, to)?;
        tracing::info!(workspace_id = %workspace_id, from = %workspace.state, to = %to, "Workspace state changed");
        Ok(())
    }

    /// Best-effort transition used while a task runs: ignores the lock and
    /// skips (with a warning) transitions outside the table.
    pub fn advance(&self, workspace_id: &str, to: WorkspaceState) -> bool {
        let from = match self.state(workspace_id) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(workspace_id = %workspace_id, error = %e, "Failed to read workspace state");
                return false;
            }
        };
        if from == to {
            return true;
        }
        if !can_transition(from, to) {
            tracing::warn!(workspace_id = %workspace_id, from = %from, to = %to, "Skipping illegal workspace transition");
            return false;
        }
        match self.db.set_workspace_state(workspace_id, to) {
            Ok(()) => {
                tracing::debug!(workspace_id = %workspace_id, from = %from, to = %to, "Workspace state advanced");
                true
            }
            Err(e) => {
                tracing::warn!(workspace_id = %workspace_id, error = %e, "Failed to advance workspace state");
                false
            }
        }
    }

    /// Advance through each state of `path` in order.
    pub fn advance_through(&self, workspace_id: &str, path: &[WorkspaceState]) {
        for state in path {
            self.advance(workspace_id, *state);
        }
    }

    // ─── Advisory Lock ──────────────────────────────────────────────────────

    pub fn lock(&self, workspace_id: &str, holder: &str, reason: &str) -> Result<()> {
        self.db.lock_workspace(workspace_id, holder, reason)
    }

    /// Release the lock. With `holder`, only that holder's lock is released.
    pub fn unlock(&self, workspace_id: &str, holder: Option<&str>) -> Result<bool> {
        self.db.unlock_workspace(workspace_id, holder)
    }

    pub fn acquire(&self, workspace_id: &str, holder: &str, reason: &str) -> Result<WorkspaceLock> {
        WorkspaceLock::acquire(&self.db, workspace_id, holder, reason)
    }

    pub fn is_locked(&self, workspace_id: &str) -> Result<bool> {
        self.db.is_workspace_locked(workspace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkspaceState::*;

    #[test]
    fn test_transition_table() {
        assert!(can_transition(Created, Planning));
        assert!(can_transition(WaitingApply, Completed));
        assert!(!can_transition(Created, Applying));
        assert!(!can_transition(Applying, Planning));
        assert!(!can_transition(Completed, Failed));
    }
}
