use std::sync::Arc;

use super::Database;
use crate::error::Result;

/// Workspace advisory lock held for the lifetime of the guard.
///
/// Dropping the guard releases the lock; [`WorkspaceLock::retain`] leaves it
/// in place for an operator to clear. The guard must not be dropped while
/// the caller still holds a connection guard from the same [`Database`].
pub struct WorkspaceLock {
    db: Arc<Database>,
    workspace_id: String,
    holder: String,
    released: bool,
}

impl WorkspaceLock {
    /// Acquire the lock. Fails with `LockHeldByOther` if anyone holds it.
    pub fn acquire(db: &Arc<Database>, workspace_id: &str, holder: &str, reason: &str) -> Result<Self> {
        db.lock_workspace(workspace_id, holder, reason)?;
        Ok(Self {
            db: Arc::clone(db),
            workspace_id: workspace_id.to_string(),
            holder: holder.to_string(),
            released: false,
        })
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Keep the lock after the guard goes away, recording why.
    pub fn retain(mut self, reason: &str) -> Result<()> {
        self.released = true;
        self.db.set_lock_reason(&self.workspace_id, reason)?;
        tracing::warn!(
            workspace_id = %self.workspace_id,
            holder = %self.holder,
            reason = %reason,
            "Workspace lock retained"
        );
        Ok(())
    }

    /// Release the lock explicitly, surfacing any database error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.db.unlock_workspace(&self.workspace_id, Some(&self.holder))?;
        Ok(())
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.db.unlock_workspace(&self.workspace_id, Some(&self.holder)) {
            tracing::error!(workspace_id = %self.workspace_id, error = %e, "Failed to release workspace lock");
        }
    }
}
