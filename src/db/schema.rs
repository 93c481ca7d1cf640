/// SQL DDL for the orchestration database.
///
/// Timestamps are stored as fixed-width RFC 3339 UTC strings so that lexical
/// comparison in SQL matches chronological order. JSON payloads are TEXT.

pub const SCHEMA_VERSION: i32 = 1;

pub const CREATE_TABLES_SQL: &str = "
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

-- Users (display-name resolution only)
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    username TEXT NOT NULL
);

-- Workspaces
CREATE TABLE IF NOT EXISTS workspaces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    execution_mode TEXT NOT NULL DEFAULT 'local',
    terraform_version TEXT NOT NULL DEFAULT '',
    workdir TEXT NOT NULL DEFAULT '',
    max_retries INTEGER NOT NULL DEFAULT 0,
    auto_apply INTEGER NOT NULL DEFAULT 0,
    provider_config TEXT,
    tf_code TEXT,
    source_path TEXT,
    tags TEXT NOT NULL DEFAULT '{}',
    system_variables TEXT NOT NULL DEFAULT '{}',
    tf_state TEXT,
    state TEXT NOT NULL DEFAULT 'created',
    is_locked INTEGER NOT NULL DEFAULT 0,
    locked_by TEXT,
    locked_at TEXT,
    lock_reason TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Append-only state history
CREATE TABLE IF NOT EXISTS workspace_state_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    content TEXT NOT NULL,
    checksum TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    lineage TEXT NOT NULL DEFAULT '',
    serial INTEGER NOT NULL DEFAULT 0,
    is_imported INTEGER NOT NULL DEFAULT 0,
    import_source TEXT,
    is_rollback INTEGER NOT NULL DEFAULT 0,
    rollback_from_version INTEGER,
    description TEXT NOT NULL DEFAULT '',
    created_by TEXT,
    task_id INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE(workspace_id, version),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE
);

-- Tasks
CREATE TABLE IF NOT EXISTS workspace_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    stage TEXT NOT NULL DEFAULT 'pending',
    description TEXT NOT NULL DEFAULT '',
    created_by TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    duration INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    plan_output TEXT,
    apply_output TEXT,
    plan_data BLOB,
    plan_json TEXT,
    plan_hash TEXT,
    plan_task_id INTEGER,
    changes_add INTEGER NOT NULL DEFAULT 0,
    changes_change INTEGER NOT NULL DEFAULT 0,
    changes_destroy INTEGER NOT NULL DEFAULT 0,
    apply_confirmed_by TEXT,
    apply_confirmed_at TEXT,
    FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE
);

-- Per-resource changes derived from plan JSON
CREATE TABLE IF NOT EXISTS task_resource_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    address TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_name TEXT NOT NULL,
    module_address TEXT,
    action TEXT NOT NULL,
    before_json TEXT,
    after_json TEXT,
    FOREIGN KEY (task_id) REFERENCES workspace_tasks(id) ON DELETE CASCADE
);

-- Resource inventory projection
CREATE TABLE IF NOT EXISTS resource_index (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    terraform_address TEXT,
    resource_type TEXT NOT NULL,
    resource_name TEXT NOT NULL,
    resource_mode TEXT NOT NULL DEFAULT 'managed',
    index_key TEXT,
    cloud_resource_id TEXT,
    cloud_resource_name TEXT,
    cloud_resource_arn TEXT,
    description TEXT,
    module_path TEXT NOT NULL DEFAULT '',
    module_depth INTEGER NOT NULL DEFAULT 0,
    parent_module_path TEXT NOT NULL DEFAULT '',
    root_module_name TEXT NOT NULL DEFAULT '',
    attributes TEXT,
    tags TEXT,
    provider TEXT NOT NULL DEFAULT '',
    cloud_provider TEXT,
    cloud_region TEXT,
    source_type TEXT NOT NULL DEFAULT 'terraform',
    external_source_id TEXT,
    primary_key_value TEXT,
    state_version_id INTEGER,
    last_synced_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    embedding BLOB,
    embedding_text TEXT,
    embedding_model TEXT,
    embedding_updated_at TEXT,
    FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE
);

-- Module containers seen in the latest state
CREATE TABLE IF NOT EXISTS module_hierarchy (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    module_path TEXT NOT NULL,
    module_name TEXT NOT NULL,
    module_key TEXT,
    parent_path TEXT NOT NULL DEFAULT '',
    depth INTEGER NOT NULL DEFAULT 0,
    resource_count INTEGER NOT NULL DEFAULT 0,
    total_resource_count INTEGER NOT NULL DEFAULT 0,
    child_module_count INTEGER NOT NULL DEFAULT 0,
    last_synced_at TEXT NOT NULL,
    UNIQUE(workspace_id, module_path),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE
);

-- Pending vector generation
CREATE TABLE IF NOT EXISTS embedding_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id INTEGER NOT NULL UNIQUE,
    workspace_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    FOREIGN KEY (resource_id) REFERENCES resource_index(id) ON DELETE CASCADE
);

-- Versioned variables (soft delete only)
CREATE TABLE IF NOT EXISTS workspace_variables (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    variable_id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    key TEXT NOT NULL,
    version INTEGER NOT NULL,
    value TEXT NOT NULL DEFAULT '',
    variable_type TEXT NOT NULL DEFAULT 'terraform',
    value_format TEXT NOT NULL DEFAULT 'string',
    sensitive INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_by TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(workspace_id, key, variable_type, version),
    UNIQUE(variable_id, version),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE
);

-- Run trigger graph
CREATE TABLE IF NOT EXISTS run_triggers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_workspace_id TEXT NOT NULL,
    target_workspace_id TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    trigger_condition TEXT NOT NULL DEFAULT 'apply_success',
    created_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(source_workspace_id, target_workspace_id),
    FOREIGN KEY (source_workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE,
    FOREIGN KEY (target_workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS task_trigger_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_task_id INTEGER NOT NULL,
    run_trigger_id INTEGER NOT NULL,
    target_task_id INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    temporarily_disabled INTEGER NOT NULL DEFAULT 0,
    disabled_by TEXT,
    disabled_at TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (source_task_id) REFERENCES workspace_tasks(id) ON DELETE CASCADE,
    FOREIGN KEY (run_trigger_id) REFERENCES run_triggers(id) ON DELETE CASCADE
);

-- Editable resource definitions
CREATE TABLE IF NOT EXISTS workspace_resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    resource_name TEXT NOT NULL,
    current_version INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(workspace_id, resource_name),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE
);

-- Collaborative editing
CREATE TABLE IF NOT EXISTS resource_locks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id INTEGER NOT NULL,
    session_id TEXT NOT NULL,
    editing_user_id TEXT NOT NULL,
    lock_type TEXT NOT NULL DEFAULT 'optimistic',
    version INTEGER NOT NULL DEFAULT 1,
    last_heartbeat TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(resource_id, session_id),
    FOREIGN KEY (resource_id) REFERENCES workspace_resources(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS resource_drifts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    content TEXT NOT NULL,
    base_version INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    last_heartbeat TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(resource_id, user_id, session_id),
    FOREIGN KEY (resource_id) REFERENCES workspace_resources(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS takeover_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id INTEGER NOT NULL,
    requester_user_id TEXT NOT NULL,
    requester_name TEXT NOT NULL DEFAULT '',
    requester_session TEXT NOT NULL,
    target_user_id TEXT NOT NULL,
    target_session TEXT NOT NULL,
    is_same_user INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (resource_id) REFERENCES workspace_resources(id) ON DELETE CASCADE
);

-- Cross-workspace output access
CREATE TABLE IF NOT EXISTS workspace_remote_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    source_workspace_id TEXT NOT NULL,
    data_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    UNIQUE(workspace_id, data_name),
    FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS remote_data_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_id TEXT NOT NULL UNIQUE,
    token TEXT NOT NULL UNIQUE,
    workspace_id TEXT NOT NULL,
    requester_workspace_id TEXT NOT NULL,
    task_id INTEGER,
    max_uses INTEGER NOT NULL DEFAULT 5,
    used_count INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_used_at TEXT
);
";

pub const CREATE_INDEXES_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_state_versions_workspace ON workspace_state_versions(workspace_id, version);
CREATE INDEX IF NOT EXISTS idx_tasks_workspace_status ON workspace_tasks(workspace_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON workspace_tasks(status, created_at);
CREATE INDEX IF NOT EXISTS idx_task_changes_task ON task_resource_changes(task_id);
CREATE UNIQUE INDEX IF NOT EXISTS uk_resource_index_address
    ON resource_index(workspace_id, terraform_address) WHERE source_type = 'terraform';
CREATE UNIQUE INDEX IF NOT EXISTS uk_resource_index_external
    ON resource_index(external_source_id, primary_key_value) WHERE source_type = 'external';
CREATE INDEX IF NOT EXISTS idx_resource_index_type ON resource_index(resource_type);
CREATE INDEX IF NOT EXISTS idx_resource_index_cloud_id ON resource_index(cloud_resource_id);
CREATE INDEX IF NOT EXISTS idx_resource_index_cloud_name ON resource_index(cloud_resource_name);
CREATE INDEX IF NOT EXISTS idx_resource_index_module ON resource_index(workspace_id, module_path);
CREATE INDEX IF NOT EXISTS idx_module_hierarchy_parent ON module_hierarchy(workspace_id, parent_path);
CREATE INDEX IF NOT EXISTS idx_embedding_tasks_status ON embedding_tasks(status, created_at);
CREATE INDEX IF NOT EXISTS idx_embedding_tasks_workspace ON embedding_tasks(workspace_id);
CREATE INDEX IF NOT EXISTS idx_variables_workspace ON workspace_variables(workspace_id, variable_id);
CREATE INDEX IF NOT EXISTS idx_run_triggers_target ON run_triggers(target_workspace_id);
CREATE INDEX IF NOT EXISTS idx_trigger_exec_task ON task_trigger_executions(source_task_id);
CREATE INDEX IF NOT EXISTS idx_resource_locks_heartbeat ON resource_locks(last_heartbeat);
CREATE INDEX IF NOT EXISTS idx_takeover_target ON takeover_requests(target_session, status);
CREATE INDEX IF NOT EXISTS idx_remote_tokens_expiry ON remote_data_tokens(expires_at);
";
