use std::fmt;
use std::str::FromStr;

use rusqlite::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{json_column, json_or_empty};
use crate::error::Error;

// ─── Workspace ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub workspace_id: String,
    pub name: String,
    pub description: String,
    pub execution_mode: String,
    pub terraform_version: String,
    pub workdir: String,
    pub max_retries: i64,
    pub auto_apply: bool,
    pub provider_config: Option<Value>,
    pub tf_code: Option<Value>,
    pub source_path: Option<String>,
    pub tags: Value,
    pub system_variables: Value,
    pub state: WorkspaceState,
    pub is_locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub lock_reason: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Workspace {
    pub(crate) const COLUMNS: &'static str = "id, workspace_id, name, description, execution_mode, \
        terraform_version, workdir, max_retries, auto_apply, provider_config, tf_code, source_path, \
        tags, system_variables, state, is_locked, locked_by, locked_at, lock_reason, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let state: String = row.get(14)?;
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            execution_mode: row.get(4)?,
            terraform_version: row.get(5)?,
            workdir: row.get(6)?,
            max_retries: row.get(7)?,
            auto_apply: row.get(8)?,
            provider_config: json_column(row.get(9)?),
            tf_code: json_column(row.get(10)?),
            source_path: row.get(11)?,
            tags: json_or_empty(row.get(12)?),
            system_variables: json_or_empty(row.get(13)?),
            state: state.parse().unwrap_or(WorkspaceState::Created),
            is_locked: row.get(15)?,
            locked_by: row.get(16)?,
            locked_at: row.get(17)?,
            lock_reason: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }

    /// Whether a provider configuration with at least one entry is bound.
    pub fn has_provider_config(&self) -> bool {
        match &self.provider_config {
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    /// Per-workspace `TF_LOG` override from `system_variables`.
    pub fn log_level_override(&self) -> Option<String> {
        self.system_variables
            .get("TF_LOG")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }
}

/// Input for creating a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWorkspace {
    pub name: String,
    pub description: String,
    pub execution_mode: String,
    pub terraform_version: String,
    pub max_retries: i64,
    pub auto_apply: bool,
    pub provider_config: Option<Value>,
    pub tf_code: Option<Value>,
    pub source_path: Option<String>,
    pub tags: Option<Value>,
    pub system_variables: Option<Value>,
}

impl NewWorkspace {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            execution_mode: "local".to_string(),
            ..Default::default()
        }
    }
}

/// Workspace lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Created,
    Planning,
    PlanDone,
    WaitingApply,
    Applying,
    Completed,
    Failed,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Created => "created",
            WorkspaceState::Planning => "planning",
            WorkspaceState::PlanDone => "plan_done",
            WorkspaceState::WaitingApply => "waiting_apply",
            WorkspaceState::Applying => "applying",
            WorkspaceState::Completed => "completed",
            WorkspaceState::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => WorkspaceState::Created,
            "planning" => WorkspaceState::Planning,
            "plan_done" => WorkspaceState::PlanDone,
            "waiting_apply" => WorkspaceState::WaitingApply,
            "applying" => WorkspaceState::Applying,
            "completed" => WorkspaceState::Completed,
            "failed" => WorkspaceState::Failed,
            other => return Err(Error::Validation(format!("unknown workspace state: {}", other))),
        })
    }
}

// ─── State Versions ─────────────────────────────────────────────────────────

/// One row of the append-only state history. `content` is only populated
/// by single-version reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVersion {
    pub id: i64,
    pub workspace_id: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub checksum: String,
    pub size_bytes: i64,
    pub lineage: String,
    pub serial: i64,
    pub is_imported: bool,
    pub import_source: Option<String>,
    pub is_rollback: bool,
    pub rollback_from_version: Option<i64>,
    pub description: String,
    pub created_by: Option<String>,
    pub created_by_name: Option<String>,
    pub task_id: Option<i64>,
    pub created_at: String,
}

impl StateVersion {
    /// Column list without `content`; callers append it when needed.
    pub(crate) const COLUMNS: &'static str = "id, workspace_id, version, checksum, size_bytes, lineage, \
        serial, is_imported, import_source, is_rollback, rollback_from_version, description, \
        created_by, task_id, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            version: row.get(2)?,
            content: None,
            checksum: row.get(3)?,
            size_bytes: row.get(4)?,
            lineage: row.get(5)?,
            serial: row.get(6)?,
            is_imported: row.get(7)?,
            import_source: row.get(8)?,
            is_rollback: row.get(9)?,
            rollback_from_version: row.get(10)?,
            description: row.get(11)?,
            created_by: row.get(12)?,
            created_by_name: None,
            task_id: row.get(13)?,
            created_at: row.get(14)?,
        })
    }
}

/// Import source values.
pub mod import_source {
    pub const USER_UPLOAD: &str = "user_upload";
    pub const ROLLBACK: &str = "rollback";
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub workspace_id: String,
    pub task_type: String,
    pub status: String,
    pub stage: String,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration: Option<i64>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
    pub plan_output: Option<String>,
    pub apply_output: Option<String>,
    pub plan_json: Option<String>,
    pub plan_hash: Option<String>,
    pub plan_task_id: Option<i64>,
    pub changes_add: i64,
    pub changes_change: i64,
    pub changes_destroy: i64,
    pub apply_confirmed_by: Option<String>,
    pub apply_confirmed_at: Option<String>,
}

impl Task {
    /// Column list without the `plan_data` blob.
    pub(crate) const COLUMNS: &'static str = "id, workspace_id, task_type, status, stage, description, \
        created_by, created_at, started_at, completed_at, duration, retry_count, max_retries, \
        error_message, plan_output, apply_output, plan_json, plan_hash, plan_task_id, changes_add, \
        changes_change, changes_destroy, apply_confirmed_by, apply_confirmed_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            task_type: row.get(2)?,
            status: row.get(3)?,
            stage: row.get(4)?,
            description: row.get(5)?,
            created_by: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            duration: row.get(10)?,
            retry_count: row.get(11)?,
            max_retries: row.get(12)?,
            error_message: row.get(13)?,
            plan_output: row.get(14)?,
            apply_output: row.get(15)?,
            plan_json: row.get(16)?,
            plan_hash: row.get(17)?,
            plan_task_id: row.get(18)?,
            changes_add: row.get(19)?,
            changes_change: row.get(20)?,
            changes_destroy: row.get(21)?,
            apply_confirmed_by: row.get(22)?,
            apply_confirmed_at: row.get(23)?,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            task_status::SUCCESS | task_status::APPLIED | task_status::FAILED | task_status::CANCELLED
        )
    }

    /// A plan_and_apply task parked at `apply_pending` that somebody confirmed.
    pub fn is_confirmed_apply(&self) -> bool {
        self.status == task_status::APPLY_PENDING && self.apply_confirmed_at.is_some()
    }
}

/// Task status values.
pub mod task_status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const APPLY_PENDING: &str = "apply_pending";
    pub const SUCCESS: &str = "success";
    pub const APPLIED: &str = "applied";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";
}

/// Task type values.
pub mod task_type {
    pub const PLAN: &str = "plan";
    pub const APPLY: &str = "apply";
    pub const PLAN_AND_APPLY: &str = "plan_and_apply";
    pub const DRIFT_CHECK: &str = "drift_check";
}

/// One resource-level change extracted from plan JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub address: String,
    pub resource_type: String,
    pub resource_name: String,
    pub module_address: Option<String>,
    pub action: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

// ─── Resource Index ─────────────────────────────────────────────────────────

/// A row of the resource inventory projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedResource {
    pub id: i64,
    pub workspace_id: String,
    pub terraform_address: Option<String>,
    pub resource_type: String,
    pub resource_name: String,
    pub resource_mode: String,
    pub index_key: Option<String>,
    pub cloud_resource_id: Option<String>,
    pub cloud_resource_name: Option<String>,
    pub cloud_resource_arn: Option<String>,
    pub description: Option<String>,
    pub module_path: String,
    pub module_depth: i64,
    pub parent_module_path: String,
    pub root_module_name: String,
    pub attributes: Option<Value>,
    pub tags: Option<Value>,
    pub provider: String,
    pub cloud_provider: Option<String>,
    pub cloud_region: Option<String>,
    pub source_type: String,
    pub external_source_id: Option<String>,
    pub primary_key_value: Option<String>,
    pub state_version_id: Option<i64>,
    pub last_synced_at: String,
    pub created_at: String,
    #[serde(skip)]
    pub embedding: Option<Vec<u8>>,
    pub embedding_text: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_updated_at: Option<String>,
}

impl IndexedResource {
    pub(crate) const COLUMNS: &'static str = "id, workspace_id, terraform_address, resource_type, \
        resource_name, resource_mode, index_key, cloud_resource_id, cloud_resource_name, \
        cloud_resource_arn, description, module_path, module_depth, parent_module_path, \
        root_module_name, attributes, tags, provider, cloud_provider, cloud_region, source_type, \
        external_source_id, primary_key_value, state_version_id, last_synced_at, created_at, \
        embedding, embedding_text, embedding_model, embedding_updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            terraform_address: row.get(2)?,
            resource_type: row.get(3)?,
            resource_name: row.get(4)?,
            resource_mode: row.get(5)?,
            index_key: row.get(6)?,
            cloud_resource_id: row.get(7)?,
            cloud_resource_name: row.get(8)?,
            cloud_resource_arn: row.get(9)?,
            description: row.get(10)?,
            module_path: row.get(11)?,
            module_depth: row.get(12)?,
            parent_module_path: row.get(13)?,
            root_module_name: row.get(14)?,
            attributes: json_column(row.get(15)?),
            tags: json_column(row.get(16)?),
            provider: row.get(17)?,
            cloud_provider: row.get(18)?,
            cloud_region: row.get(19)?,
            source_type: row.get(20)?,
            external_source_id: row.get(21)?,
            primary_key_value: row.get(22)?,
            state_version_id: row.get(23)?,
            last_synced_at: row.get(24)?,
            created_at: row.get(25)?,
            embedding: row.get(26)?,
            embedding_text: row.get(27)?,
            embedding_model: row.get(28)?,
            embedding_updated_at: row.get(29)?,
        })
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub module_path: String,
    pub module_name: String,
    pub module_key: Option<String>,
    pub parent_path: String,
    pub depth: i64,
    pub resource_count: i64,
    pub total_resource_count: i64,
    pub child_module_count: i64,
}

/// Embedding task status values.
pub mod embedding_status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
}

// ─── Variables ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub id: i64,
    pub variable_id: String,
    pub workspace_id: String,
    pub key: String,
    pub version: i64,
    pub value: String,
    pub variable_type: String,
    pub value_format: String,
    pub sensitive: bool,
    pub description: String,
    pub is_deleted: bool,
    pub created_by: Option<String>,
    pub created_at: String,
}

impl Variable {
    pub(crate) const COLUMNS: &'static str = "id, variable_id, workspace_id, key, version, value, \
        variable_type, value_format, sensitive, description, is_deleted, created_by, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            variable_id: row.get(1)?,
            workspace_id: row.get(2)?,
            key: row.get(3)?,
            version: row.get(4)?,
            value: row.get(5)?,
            variable_type: row.get(6)?,
            value_format: row.get(7)?,
            sensitive: row.get(8)?,
            description: row.get(9)?,
            is_deleted: row.get(10)?,
            created_by: row.get(11)?,
            created_at: row.get(12)?,
        })
    }
}

/// Variable type values.
pub mod variable_type {
    pub const TERRAFORM: &str = "terraform";
    pub const ENVIRONMENT: &str = "environment";
}

/// Variable value formats.
pub mod value_format {
    pub const STRING: &str = "string";
    pub const HCL: &str = "hcl";
}

// ─── Run Triggers ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrigger {
    pub id: i64,
    pub source_workspace_id: String,
    pub target_workspace_id: String,
    pub enabled: bool,
    pub trigger_condition: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RunTrigger {
    pub(crate) const COLUMNS: &'static str = "id, source_workspace_id, target_workspace_id, enabled, \
        trigger_condition, created_by, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_workspace_id: row.get(1)?,
            target_workspace_id: row.get(2)?,
            enabled: row.get(3)?,
            trigger_condition: row.get(4)?,
            created_by: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerExecution {
    pub id: i64,
    pub source_task_id: i64,
    pub run_trigger_id: i64,
    pub target_task_id: Option<i64>,
    pub status: String,
    pub temporarily_disabled: bool,
    pub disabled_by: Option<String>,
    pub disabled_at: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TriggerExecution {
    pub(crate) const COLUMNS: &'static str = "id, source_task_id, run_trigger_id, target_task_id, \
        status, temporarily_disabled, disabled_by, disabled_at, error_message, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_task_id: row.get(1)?,
            run_trigger_id: row.get(2)?,
            target_task_id: row.get(3)?,
            status: row.get(4)?,
            temporarily_disabled: row.get(5)?,
            disabled_by: row.get(6)?,
            disabled_at: row.get(7)?,
            error_message: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

/// Trigger execution status values.
pub mod execution_status {
    pub const PENDING: &str = "pending";
    pub const TRIGGERED: &str = "triggered";
    pub const SKIPPED: &str = "skipped";
    pub const FAILED: &str = "failed";
}

// ─── Collaborative Editing ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceResource {
    pub id: i64,
    pub workspace_id: String,
    pub resource_name: String,
    pub current_version: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub id: i64,
    pub resource_id: i64,
    pub session_id: String,
    pub editing_user_id: String,
    pub lock_type: String,
    pub version: i64,
    pub last_heartbeat: String,
    pub created_at: String,
}

impl ResourceLock {
    pub(crate) const COLUMNS: &'static str =
        "id, resource_id, session_id, editing_user_id, lock_type, version, last_heartbeat, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            resource_id: row.get(1)?,
            session_id: row.get(2)?,
            editing_user_id: row.get(3)?,
            lock_type: row.get(4)?,
            version: row.get(5)?,
            last_heartbeat: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDrift {
    pub id: i64,
    pub resource_id: i64,
    pub user_id: String,
    pub session_id: String,
    pub content: Value,
    pub base_version: i64,
    pub status: String,
    pub last_heartbeat: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ResourceDrift {
    pub(crate) const COLUMNS: &'static str = "id, resource_id, user_id, session_id, content, \
        base_version, status, last_heartbeat, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            resource_id: row.get(1)?,
            user_id: row.get(2)?,
            session_id: row.get(3)?,
            content: json_or_empty(row.get(4)?),
            base_version: row.get(5)?,
            status: row.get(6)?,
            last_heartbeat: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

/// Draft status values.
pub mod drift_status {
    pub const ACTIVE: &str = "active";
    pub const EXPIRED: &str = "expired";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoverRequest {
    pub id: i64,
    pub resource_id: i64,
    pub requester_user_id: String,
    pub requester_name: String,
    pub requester_session: String,
    pub target_user_id: String,
    pub target_session: String,
    pub is_same_user: bool,
    pub status: String,
    pub expires_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TakeoverRequest {
    pub(crate) const COLUMNS: &'static str = "id, resource_id, requester_user_id, requester_name, \
        requester_session, target_user_id, target_session, is_same_user, status, expires_at, \
        created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            resource_id: row.get(1)?,
            requester_user_id: row.get(2)?,
            requester_name: row.get(3)?,
            requester_session: row.get(4)?,
            target_user_id: row.get(5)?,
            target_session: row.get(6)?,
            is_same_user: row.get(7)?,
            status: row.get(8)?,
            expires_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

/// Takeover request status values.
pub mod takeover_status {
    pub const PENDING: &str = "pending";
    pub const APPROVED: &str = "approved";
    pub const REJECTED: &str = "rejected";
    pub const EXPIRED: &str = "expired";
}

// ─── Remote Data ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDataToken {
    pub token_id: String,
    pub token: String,
    pub workspace_id: String,
    pub requester_workspace_id: String,
    pub task_id: Option<i64>,
    pub max_uses: i64,
    pub used_count: i64,
    pub expires_at: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

impl RemoteDataToken {
    pub(crate) const COLUMNS: &'static str = "token_id, token, workspace_id, requester_workspace_id, \
        task_id, max_uses, used_count, expires_at, created_at, last_used_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token_id: row.get(0)?,
            token: row.get(1)?,
            workspace_id: row.get(2)?,
            requester_workspace_id: row.get(3)?,
            task_id: row.get(4)?,
            max_uses: row.get(5)?,
            used_count: row.get(6)?,
            expires_at: row.get(7)?,
            created_at: row.get(8)?,
            last_used_at: row.get(9)?,
        })
    }
}

/// A workspace's declaration that it reads another workspace's outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDataSource {
    pub id: i64,
    pub workspace_id: String,
    pub source_workspace_id: String,
    pub data_name: String,
    pub description: String,
}
