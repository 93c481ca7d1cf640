use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;
use serde_json::Value;

use crate::db::models::{drift_status, takeover_status, ResourceDrift, ResourceLock, TakeoverRequest};
use crate::db::users::lookup_username;
use crate::db::{now, parse_timestamp, timestamp, Database};
use crate::error::{Error, Result};

/// Locks without a heartbeat for this long are expired.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a takeover request waits for an answer.
pub const TAKEOVER_WINDOW: Duration = Duration::from_secs(35);
/// Retention for expired drafts and settled takeover requests.
pub const HISTORY_RETENTION_DAYS: i64 = 7;

const OPTIMISTIC: &str = "optimistic";

/// Another session editing the same resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditorInfo {
    pub user_id: String,
    pub user_name: String,
    pub session_id: String,
    pub is_same_user: bool,
    pub is_current_session: bool,
    pub last_heartbeat: String,
    pub seconds_since_heartbeat: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartEditing {
    pub lock: ResourceLock,
    pub other_editors: Vec<EditorInfo>,
    pub drift: Option<ResourceDrift>,
    /// The draft was based on an older revision than the current one.
    pub version_conflict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditingStatus {
    pub is_locked: bool,
    pub current_version: i64,
    pub editors: Vec<EditorInfo>,
}

/// Counts removed by one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EditingSweep {
    pub locks: usize,
    pub drafts: usize,
    pub requests_expired: usize,
    pub requests_pruned: usize,
}

fn cutoff(age: Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
    timestamp(Utc::now() - age)
}

fn days_ago(days: i64) -> String {
    timestamp(Utc::now() - chrono::Duration::days(days))
}

fn seconds_since(ts: &str) -> i64 {
    parse_timestamp(ts)
        .map(|at| (Utc::now() - at).num_seconds().max(0))
        .unwrap_or(0)
}

fn is_request_expired(request: &TakeoverRequest) -> bool {
    request.expires_at.as_str() <= now().as_str()
}

// ─── Service ────────────────────────────────────────────────────────────────

/// Soft per-session locks, drafts and takeover requests on editable resources.
pub struct EditingService {
    db: Arc<Database>,
}

impl EditingService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn current_version(&self, resource_id: i64) -> Result<i64> {
        Ok(self.db.get_workspace_resource(resource_id)?.current_version)
    }

    fn find_lock(&self, resource_id: i64, session_id: &str) -> Result<Option<ResourceLock>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM resource_locks WHERE resource_id = ?1 AND session_id = ?2",
            ResourceLock::COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![resource_id, session_id], ResourceLock::from_row)
            .optional()?)
    }

    /// Live locks on the resource, deleting expired ones on the way.
    fn live_locks(&self, resource_id: i64) -> Result<Vec<(ResourceLock, String)>> {
        let conn = self.db.conn()?;
        let expired = conn.execute(
            "DELETE FROM resource_locks WHERE resource_id = ?1 AND last_heartbeat < ?2",
            params![resource_id, cutoff(LOCK_TIMEOUT)],
        )?;
        if expired > 0 {
            tracing::debug!(resource_id, expired, "Dropped expired editing locks");
        }
        let sql = format!(
            "SELECT {} FROM resource_locks WHERE resource_id = ?1 ORDER BY created_at, id",
            ResourceLock::COLUMNS
        );
        let locks = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![resource_id], ResourceLock::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        let mut out = Vec::with_capacity(locks.len());
        for lock in locks {
            let name = lookup_username(&conn, &lock.editing_user_id)?
                .unwrap_or_else(|| lock.editing_user_id.clone());
            out.push((lock, name));
        }
        Ok(out)
    }

    fn editor(lock: &ResourceLock, name: String, user_id: &str, session_id: &str) -> EditorInfo {
        EditorInfo {
            user_id: lock.editing_user_id.clone(),
            user_name: name,
            session_id: lock.session_id.clone(),
            is_same_user: lock.editing_user_id == user_id,
            is_current_session: lock.session_id == session_id,
            last_heartbeat: lock.last_heartbeat.clone(),
            seconds_since_heartbeat: seconds_since(&lock.last_heartbeat),
        }
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    /// Take (or refresh) this session's lock and report who else is editing
    /// and whether the user has an unfinished draft.
    pub fn start_editing(&self, resource_id: i64, user_id: &str, session_id: &str) -> Result<StartEditing> {
        let current = self.current_version(resource_id)?;

        let drift = self.latest_active_drift(resource_id, user_id)?;
        let version_conflict = drift.as_ref().is_some_and(|d| d.base_version < current);

        {
            let conn = self.db.conn()?;
            let ts = now();
            conn.execute(
                "INSERT INTO resource_locks (resource_id, session_id, editing_user_id, lock_type,
                    version, last_heartbeat, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(resource_id, session_id) DO UPDATE SET
                    editing_user_id = excluded.editing_user_id,
                    version = excluded.version,
                    last_heartbeat = excluded.last_heartbeat",
                params![resource_id, session_id, user_id, OPTIMISTIC, current, ts],
            )?;
        }

        let lock = self
            .find_lock(resource_id, session_id)?
            .ok_or_else(|| Error::internal("editing lock vanished after upsert"))?;
        let other_editors = self
            .live_locks(resource_id)?
            .into_iter()
            .filter(|(l, _)| l.session_id != session_id)
            .map(|(l, name)| Self::editor(&l, name, user_id, session_id))
            .collect::<Vec<_>>();

        tracing::debug!(
            resource_id,
            user_id = %user_id,
            session_id = %session_id,
            others = other_editors.len(),
            has_drift = drift.is_some(),
            "Editing started"
        );
        Ok(StartEditing {
            lock,
            other_editors,
            drift,
            version_conflict,
        })
    }

    pub fn heartbeat(&self, resource_id: i64, user_id: &str, session_id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        let ts = now();
        let changed = conn.execute(
            "UPDATE resource_locks SET last_heartbeat = ?4
             WHERE resource_id = ?1 AND editing_user_id = ?2 AND session_id = ?3",
            params![resource_id, user_id, session_id, ts],
        )?;
        if changed == 0 {
            return Err(Error::NotEditing {
                resource_id,
                session_id: session_id.to_string(),
            });
        }
        conn.execute(
            "UPDATE resource_drifts SET last_heartbeat = ?4
             WHERE resource_id = ?1 AND user_id = ?2 AND session_id = ?3 AND status = ?5",
            params![resource_id, user_id, session_id, ts, drift_status::ACTIVE],
        )?;
        Ok(())
    }

    /// Drop this session's lock. Its draft stays.
    pub fn end_editing(&self, resource_id: i64, user_id: &str, session_id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "DELETE FROM resource_locks
             WHERE resource_id = ?1 AND editing_user_id = ?2 AND session_id = ?3",
            params![resource_id, user_id, session_id],
        )?;
        Ok(())
    }

    pub fn editing_status(&self, resource_id: i64, user_id: &str, session_id: &str) -> Result<EditingStatus> {
        let current_version = self.current_version(resource_id)?;
        let editors: Vec<EditorInfo> = self
            .live_locks(resource_id)?
            .into_iter()
            .map(|(l, name)| Self::editor(&l, name, user_id, session_id))
            .collect();
        Ok(EditingStatus {
            is_locked: !editors.is_empty(),
            current_version,
            editors,
        })
    }

    // ─── Drafts ─────────────────────────────────────────────────────────────

    fn latest_active_drift(&self, resource_id: i64, user_id: &str) -> Result<Option<ResourceDrift>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM resource_drifts
             WHERE resource_id = ?1 AND user_id = ?2 AND status = ?3
             ORDER BY updated_at DESC, id DESC LIMIT 1",
            ResourceDrift::COLUMNS
        );
        Ok(conn
            .query_row(
                &sql,
                params![resource_id, user_id, drift_status::ACTIVE],
                ResourceDrift::from_row,
            )
            .optional()?)
    }

    fn find_drift(&self, resource_id: i64, user_id: &str, session_id: &str) -> Result<Option<ResourceDrift>> {
        let conn = self.db.conn()?;
        find_drift_in(&conn, resource_id, user_id, session_id)
    }

    /// Upsert the session's draft, based on the current revision.
    pub fn save_drift(
        &self,
        resource_id: i64,
        user_id: &str,
        session_id: &str,
        content: &Value,
    ) -> Result<ResourceDrift> {
        let base_version = self.current_version(resource_id)?;
        {
            let conn = self.db.conn()?;
            let ts = now();
            conn.execute(
                "INSERT INTO resource_drifts (resource_id, user_id, session_id, content, base_version,
                    status, last_heartbeat, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)
                 ON CONFLICT(resource_id, user_id, session_id) DO UPDATE SET
                    content = excluded.content,
                    base_version = excluded.base_version,
                    status = excluded.status,
                    last_heartbeat = excluded.last_heartbeat,
                    updated_at = excluded.updated_at",
                params![
                    resource_id,
                    user_id,
                    session_id,
                    content.to_string(),
                    base_version,
                    drift_status::ACTIVE,
                    ts
                ],
            )?;
        }
        self.find_drift(resource_id, user_id, session_id)?
            .ok_or_else(|| Error::internal("draft vanished after upsert"))
    }

    /// The session's active draft and whether it is behind the current revision.
    pub fn get_drift(
        &self,
        resource_id: i64,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<(ResourceDrift, bool)>> {
        let Some(drift) = self
            .find_drift(resource_id, user_id, session_id)?
            .filter(|d| d.status == drift_status::ACTIVE)
        else {
            return Ok(None);
        };
        let current = self.current_version(resource_id)?;
        let conflict = drift.base_version < current;
        Ok(Some((drift, conflict)))
    }

    pub fn delete_drift(&self, resource_id: i64, user_id: &str, session_id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "DELETE FROM resource_drifts WHERE resource_id = ?1 AND user_id = ?2 AND session_id = ?3",
            params![resource_id, user_id, session_id],
        )?;
        Ok(())
    }

    // ─── Takeover ───────────────────────────────────────────────────────────

    pub fn request_takeover(
        &self,
        resource_id: i64,
        requester_user_id: &str,
        requester_session: &str,
        target_session: &str,
    ) -> Result<TakeoverRequest> {
        let target = self
            .find_lock(resource_id, target_session)?
            .ok_or_else(|| Error::not_found("editing session", target_session))?;

        let conn = self.db.conn()?;
        let requester_name = lookup_username(&conn, requester_user_id)?
            .unwrap_or_else(|| requester_user_id.to_string());
        let window = chrono::Duration::from_std(TAKEOVER_WINDOW)
            .unwrap_or_else(|_| chrono::Duration::seconds(35));
        let expires_at = timestamp(Utc::now() + window);
        let ts = now();
        conn.execute(
            "INSERT INTO takeover_requests (resource_id, requester_user_id, requester_name,
                requester_session, target_user_id, target_session, is_same_user, status,
                expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                resource_id,
                requester_user_id,
                requester_name,
                requester_session,
                target.editing_user_id,
                target_session,
                requester_user_id == target.editing_user_id,
                takeover_status::PENDING,
                expires_at,
                ts
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        tracing::info!(
            request_id = id,
            resource_id,
            requester = %requester_user_id,
            target_session = %target_session,
            "Takeover requested"
        );
        self.get_request(id)
    }

    pub fn get_request(&self, request_id: i64) -> Result<TakeoverRequest> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM takeover_requests WHERE id = ?1",
            TakeoverRequest::COLUMNS
        );
        conn.query_row(&sql, params![request_id], TakeoverRequest::from_row)
            .optional()?
            .ok_or_else(|| Error::not_found("takeover request", request_id))
    }

    /// Unanswered, unexpired requests aimed at `target_session`.
    pub fn pending_requests(&self, target_session: &str) -> Result<Vec<TakeoverRequest>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM takeover_requests
             WHERE target_session = ?1 AND status = ?2 AND expires_at > ?3
             ORDER BY created_at DESC, id DESC",
            TakeoverRequest::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![target_session, takeover_status::PENDING, now()],
                TakeoverRequest::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Settle a still-pending request.
    fn set_request_status(&self, request_id: i64, status: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE takeover_requests SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
            params![request_id, status, now(), takeover_status::PENDING],
        )?;
        Ok(())
    }

    /// Answer a pending request. An expired request is approved implicitly
    /// and the late answer is refused.
    pub fn respond_to_takeover(&self, request_id: i64, approved: bool) -> Result<TakeoverRequest> {
        let request = self.get_request(request_id)?;
        if request.status != takeover_status::PENDING {
            return Err(Error::Conflict(format!(
                "takeover request {} is already {}",
                request_id, request.status
            )));
        }
        if is_request_expired(&request) {
            self.resolve_expired(&request)?;
            return Err(Error::Conflict(format!(
                "takeover request {} expired",
                request_id
            )));
        }

        if approved {
            self.take_over(&request)?;
            tracing::info!(request_id, resource_id = request.resource_id, "Takeover approved");
        } else {
            self.set_request_status(request_id, takeover_status::REJECTED)?;
            tracing::info!(request_id, resource_id = request.resource_id, "Takeover rejected");
        }
        self.get_request(request_id)
    }

    /// Current state of a request. A pending request past its deadline is
    /// settled as approved.
    pub fn takeover_status(&self, request_id: i64) -> Result<TakeoverRequest> {
        let request = self.get_request(request_id)?;
        if request.status == takeover_status::PENDING && is_request_expired(&request) {
            self.resolve_expired(&request)?;
            return self.get_request(request_id);
        }
        Ok(request)
    }

    fn resolve_expired(&self, request: &TakeoverRequest) -> Result<()> {
        match self.take_over(request) {
            Ok(()) => {
                tracing::info!(request_id = request.id, "Takeover approved on timeout");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(request_id = request.id, error = %e, "Timeout takeover failed");
                self.set_request_status(request.id, takeover_status::EXPIRED)
            }
        }
    }

    /// Approve the request and hand the resource to the requester's
    /// session in one transaction.
    fn take_over(&self, request: &TakeoverRequest) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let answered = tx.execute(
            "UPDATE takeover_requests SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
            params![
                request.id,
                takeover_status::APPROVED,
                now(),
                takeover_status::PENDING
            ],
        )?;
        if answered == 0 {
            return Err(Error::Conflict(format!(
                "takeover request {} was answered concurrently",
                request.id
            )));
        }
        hand_over(&tx, request)?;
        tx.commit()?;
        Ok(())
    }

    // ─── Sweeps ─────────────────────────────────────────────────────────────

    pub fn cleanup_expired_locks(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM resource_locks WHERE last_heartbeat < ?1",
            params![cutoff(LOCK_TIMEOUT)],
        )?;
        if removed > 0 {
            tracing::info!(removed, "Cleaned up expired editing locks");
        }
        Ok(removed)
    }

    pub fn cleanup_old_drifts(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let removed = conn.execute(
            "DELETE FROM resource_drifts WHERE status = ?1 AND updated_at < ?2",
            params![drift_status::EXPIRED, days_ago(HISTORY_RETENTION_DAYS)],
        )?;
        if removed > 0 {
            tracing::info!(removed, "Cleaned up old drafts");
        }
        Ok(removed)
    }

    /// Mark stale pending requests expired and prune settled history.
    pub fn cleanup_expired_requests(&self) -> Result<(usize, usize)> {
        let conn = self.db.conn()?;
        let ts = now();
        let expired = conn.execute(
            "UPDATE takeover_requests SET status = ?1, updated_at = ?2
             WHERE status = ?3 AND expires_at < ?2",
            params![takeover_status::EXPIRED, ts, takeover_status::PENDING],
        )?;
        let pruned = conn.execute(
            "DELETE FROM takeover_requests WHERE status IN (?1, ?2, ?3) AND created_at < ?4",
            params![
                takeover_status::APPROVED,
                takeover_status::REJECTED,
                takeover_status::EXPIRED,
                days_ago(HISTORY_RETENTION_DAYS)
            ],
        )?;
        if expired + pruned > 0 {
            tracing::info!(expired, pruned, "Cleaned up takeover requests");
        }
        Ok((expired, pruned))
    }

    pub fn sweep(&self) -> Result<EditingSweep> {
        let locks = self.cleanup_expired_locks()?;
        let drafts = self.cleanup_old_drifts()?;
        let (requests_expired, requests_pruned) = self.cleanup_expired_requests()?;
        Ok(EditingSweep {
            locks,
            drafts,
            requests_expired,
            requests_pruned,
        })
    }
}

fn find_drift_in(
    conn: &rusqlite::Connection,
    resource_id: i64,
    user_id: &str,
    session_id: &str,
) -> Result<Option<ResourceDrift>> {
    let sql = format!(
        "SELECT {} FROM resource_drifts WHERE resource_id = ?1 AND user_id = ?2 AND session_id = ?3",
        ResourceDrift::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![resource_id, user_id, session_id], ResourceDrift::from_row)
        .optional()?)
}

/// Replace every lock with the requester's, expire the old session's
/// drafts and carry the requester's own draft over to the new session.
fn hand_over(tx: &Transaction<'_>, request: &TakeoverRequest) -> Result<()> {
    let ts = now();
    tx.execute(
        "DELETE FROM resource_locks WHERE resource_id = ?1",
        params![request.resource_id],
    )?;
    tx.execute(
        "INSERT INTO resource_locks (resource_id, session_id, editing_user_id, lock_type, version,
            last_heartbeat, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
        params![
            request.resource_id,
            request.requester_session,
            request.requester_user_id,
            OPTIMISTIC,
            ts
        ],
    )?;
    tx.execute(
        "UPDATE resource_drifts SET status = ?3, updated_at = ?4
         WHERE resource_id = ?1 AND session_id = ?2 AND status = ?5",
        params![
            request.resource_id,
            request.target_session,
            drift_status::EXPIRED,
            ts,
            drift_status::ACTIVE
        ],
    )?;

    let old = find_drift_in(
        tx,
        request.resource_id,
        &request.requester_user_id,
        &request.target_session,
    )?;
    let existing = find_drift_in(
        tx,
        request.resource_id,
        &request.requester_user_id,
        &request.requester_session,
    )?;
    if let (Some(old), None) = (old, existing) {
        tx.execute(
            "INSERT INTO resource_drifts (resource_id, user_id, session_id, content, base_version,
                status, last_heartbeat, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)",
            params![
                request.resource_id,
                request.requester_user_id,
                request.requester_session,
                old.content.to_string(),
                old.base_version,
                drift_status::ACTIVE,
                ts
            ],
        )?;
    }
    Ok(())
}
