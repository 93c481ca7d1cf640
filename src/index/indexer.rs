use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Transaction};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;

use super::address::{
    build_address, collect_module_paths, format_index_key, module_name_and_key, parse_module_path,
};
use super::extractor::{cloud_provider, extract_name, extract_region};
use super::search::{self, SearchFilter, SearchHit};
use super::tree::{build_tree, TreeNode};
use crate::db::models::{IndexedResource, ModuleNode};
use crate::db::{now, Database};
use crate::error::{Error, Result};
use crate::state::StateDocument;

/// Outcome of one [`ResourceIndexer::sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub modules: usize,
    pub skipped: usize,
    pub embedding_tasks: usize,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserted, {} updated, {} deleted, {} modules",
            self.inserted, self.updated, self.deleted, self.modules
        )?;
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        Ok(())
    }
}

/// One resource instance derived from a state file.
#[derive(Debug, Clone)]
struct ParsedInstance {
    address: String,
    resource_type: String,
    resource_name: String,
    mode: String,
    index_key: Option<String>,
    cloud_id: Option<String>,
    cloud_name: String,
    cloud_arn: Option<String>,
    description: Option<String>,
    module_path: String,
    module_depth: i64,
    parent_module_path: String,
    root_module_name: String,
    attributes: String,
    tags: Option<String>,
    provider: String,
    cloud_provider: Option<String>,
    cloud_region: Option<String>,
}

/// Projects the latest state of a workspace into `resource_index` and
/// `module_hierarchy`.
pub struct ResourceIndexer {
    db: Arc<Database>,
    embedding_notify: Option<Arc<Notify>>,
}

impl ResourceIndexer {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            embedding_notify: None,
        }
    }

    /// Wake the embedding worker after each sync that queued work.
    pub fn with_embedding_notify(mut self, notify: Arc<Notify>) -> Self {
        self.embedding_notify = Some(notify);
        self
    }

    /// Re-index a workspace from its latest state version.
    pub fn sync(&self, workspace_id: &str) -> Result<SyncReport> {
        let Some(latest) = self.db.latest_state_version(workspace_id)? else {
            tracing::debug!(workspace_id = %workspace_id, "No state to index");
            return Ok(SyncReport::default());
        };
        let content = latest.content.as_deref().unwrap_or("{}");
        let doc = StateDocument::parse(content)?;

        let mut report = SyncReport::default();
        let mut instances = Vec::new();
        for resource in doc.resources() {
            parse_resource(resource, &mut instances, &mut report.skipped);
        }

        let mut module_paths = BTreeSet::new();
        for inst in &instances {
            collect_module_paths(&inst.module_path, &mut module_paths);
        }

        {
            let mut conn = self.db.conn()?;
            let tx = conn.transaction()?;
            apply_rows(&tx, workspace_id, latest.id, &instances, &mut report)?;
            report.modules = replace_modules(&tx, workspace_id, &instances, &module_paths)?;
            tx.commit()?;

            report.embedding_tasks = conn.execute(
                "INSERT INTO embedding_tasks (resource_id, workspace_id, status, retry_count, created_at, updated_at)
                 SELECT id, workspace_id, 'pending', 0, ?2, ?2 FROM resource_index
                 WHERE workspace_id = ?1 AND embedding IS NULL
                 ON CONFLICT(resource_id) DO NOTHING",
                params![workspace_id, now()],
            )?;
        }

        if report.embedding_tasks > 0 {
            if let Some(notify) = &self.embedding_notify {
                notify.notify_one();
            }
        }

        if report.skipped > 0 {
            tracing::warn!(workspace_id = %workspace_id, skipped = report.skipped, "Skipped malformed state entries");
        }
        tracing::info!(
            workspace_id = %workspace_id,
            state_version = latest.version,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            modules = report.modules,
            "Resource index synced"
        );
        Ok(report)
    }

    pub fn get_resource(&self, workspace_id: &str, address: &str) -> Result<IndexedResource> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM resource_index WHERE workspace_id = ?1 AND terraform_address = ?2",
            IndexedResource::COLUMNS
        );
        conn.query_row(&sql, params![workspace_id, address], IndexedResource::from_row)
            .optional()?
            .ok_or_else(|| Error::not_found("resource", address))
    }

    pub fn list_resources(&self, workspace_id: &str) -> Result<Vec<IndexedResource>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM resource_index WHERE workspace_id = ?1 ORDER BY module_path, terraform_address",
            IndexedResource::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![workspace_id], IndexedResource::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn modules(&self, workspace_id: &str) -> Result<Vec<ModuleNode>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT module_path, module_name, module_key, parent_path, depth, resource_count,
                total_resource_count, child_module_count
             FROM module_hierarchy WHERE workspace_id = ?1 ORDER BY depth, module_path",
        )?;
        let rows = stmt
            .query_map(params![workspace_id], |row| {
                Ok(ModuleNode {
                    module_path: row.get(0)?,
                    module_name: row.get(1)?,
                    module_key: row.get(2)?,
                    parent_path: row.get(3)?,
                    depth: row.get(4)?,
                    resource_count: row.get(5)?,
                    total_resource_count: row.get(6)?,
                    child_module_count: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn search(&self, query: &str, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
        search::search(&self.db, query, filter)
    }

    /// Modules and managed resources of a workspace as a tree.
    pub fn resource_tree(&self, workspace_id: &str) -> Result<Vec<TreeNode>> {
        self.db.get_workspace(workspace_id)?;
        let modules = self.modules(workspace_id)?;
        let resources = self.list_resources(workspace_id)?;
        Ok(build_tree(&modules, &resources))
    }

    /// Insert or refresh a row sourced outside of state files.
    pub fn upsert_external(
        &self,
        workspace_id: &str,
        external_source_id: &str,
        primary_key_value: &str,
        resource_type: &str,
        attributes: &Value,
    ) -> Result<i64> {
        let name = extract_name(resource_type, attributes);
        let now = now();
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO resource_index (workspace_id, resource_type, resource_name, resource_mode,
                cloud_resource_id, cloud_resource_name, cloud_resource_arn, description, attributes,
                tags, cloud_region, source_type, external_source_id, primary_key_value,
                last_synced_at, created_at)
             VALUES (?1, ?2, ?3, 'managed', ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'external', ?11, ?12, ?13, ?13)
             ON CONFLICT(external_source_id, primary_key_value) WHERE source_type = 'external'
             DO UPDATE SET resource_type = excluded.resource_type,
                cloud_resource_id = excluded.cloud_resource_id,
                cloud_resource_name = excluded.cloud_resource_name,
                cloud_resource_arn = excluded.cloud_resource_arn,
                description = excluded.description,
                attributes = excluded.attributes,
                tags = excluded.tags,
                cloud_region = excluded.cloud_region,
                last_synced_at = excluded.last_synced_at",
            params![
                workspace_id,
                resource_type,
                primary_key_value,
                attributes.get("id").and_then(Value::as_str),
                name,
                attributes.get("arn").and_then(Value::as_str),
                attributes.get("description").and_then(Value::as_str),
                attributes.to_string(),
                attributes.get("tags").filter(|t| t.is_object()).map(|t| t.to_string()),
                extract_region(attributes),
                external_source_id,
                primary_key_value,
                now,
            ],
        )?;
        Ok(conn.query_row(
            "SELECT id FROM resource_index WHERE external_source_id = ?1 AND primary_key_value = ?2",
            params![external_source_id, primary_key_value],
            |row| row.get(0),
        )?)
    }
}

// ─── Parsing ────────────────────────────────────────────────────────────────

fn parse_resource(resource: &Value, out: &mut Vec<ParsedInstance>, skipped: &mut usize) {
    let (Some(resource_type), Some(resource_name)) = (
        resource.get("type").and_then(Value::as_str),
        resource.get("name").and_then(Value::as_str),
    ) else {
        *skipped += 1;
        return;
    };
    let mode = resource
        .get("mode")
        .and_then(Value::as_str)
        .unwrap_or("managed");
    let module_path = resource
        .get("module")
        .and_then(Value::as_str)
        .unwrap_or("");
    let provider = resource
        .get("provider")
        .and_then(Value::as_str)
        .unwrap_or("");
    let Some(instances) = resource.get("instances").and_then(Value::as_array) else {
        *skipped += 1;
        return;
    };
    let module_info = parse_module_path(module_path);

    for instance in instances {
        if !instance.is_object() {
            *skipped += 1;
            continue;
        }
        let empty = Value::Object(Default::default());
        let attributes = instance
            .get("attributes")
            .filter(|a| a.is_object())
            .unwrap_or(&empty);
        let index_key = instance.get("index_key").and_then(format_index_key);
        let string_attr = |key: &str| {
            attributes
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        out.push(ParsedInstance {
            address: build_address(module_path, resource_type, resource_name, index_key.as_deref()),
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
            mode: mode.to_string(),
            index_key,
            cloud_id: string_attr("id"),
            cloud_name: extract_name(resource_type, attributes),
            cloud_arn: string_attr("arn"),
            description: string_attr("description"),
            module_path: module_path.to_string(),
            module_depth: module_info.depth,
            parent_module_path: module_info.parent_path.clone(),
            root_module_name: module_info.root_module_name.clone(),
            attributes: attributes.to_string(),
            tags: attributes
                .get("tags")
                .filter(|t| t.is_object())
                .map(|t| t.to_string()),
            provider: provider.to_string(),
            cloud_provider: cloud_provider(provider),
            cloud_region: extract_region(attributes),
        });
    }
}

// ─── Persistence ────────────────────────────────────────────────────────────

fn apply_rows(
    tx: &Transaction<'_>,
    workspace_id: &str,
    state_version_id: i64,
    instances: &[ParsedInstance],
    report: &mut SyncReport,
) -> Result<()> {
    let mut existing: HashMap<String, i64> = {
        let mut stmt = tx.prepare(
            "SELECT terraform_address, id FROM resource_index
             WHERE workspace_id = ?1 AND source_type = 'terraform'",
        )?;
        let rows = stmt
            .query_map(params![workspace_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        rows
    };
    let stale_candidates: HashSet<String> = existing.keys().cloned().collect();
    let mut seen = HashSet::with_capacity(instances.len());
    let synced_at = now();

    // Embedding columns are never written here.
    let mut update = tx.prepare(
        "UPDATE resource_index SET resource_type = ?2, resource_name = ?3, resource_mode = ?4,
            index_key = ?5, cloud_resource_id = ?6, cloud_resource_name = ?7, cloud_resource_arn = ?8,
            description = ?9, module_path = ?10, module_depth = ?11, parent_module_path = ?12,
            root_module_name = ?13, attributes = ?14, tags = ?15, provider = ?16, cloud_provider = ?17,
            cloud_region = ?18, state_version_id = ?19, last_synced_at = ?20
         WHERE id = ?1",
    )?;
    let mut insert = tx.prepare(
        "INSERT INTO resource_index (workspace_id, terraform_address, resource_type, resource_name,
            resource_mode, index_key, cloud_resource_id, cloud_resource_name, cloud_resource_arn,
            description, module_path, module_depth, parent_module_path, root_module_name, attributes,
            tags, provider, cloud_provider, cloud_region, source_type, state_version_id,
            last_synced_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, 'terraform', ?20, ?21, ?21)",
    )?;

    for inst in instances {
        seen.insert(inst.address.clone());
        if let Some(&id) = existing.get(&inst.address) {
            update.execute(params![
                id,
                inst.resource_type,
                inst.resource_name,
                inst.mode,
                inst.index_key,
                inst.cloud_id,
                inst.cloud_name,
                inst.cloud_arn,
                inst.description,
                inst.module_path,
                inst.module_depth,
                inst.parent_module_path,
                inst.root_module_name,
                inst.attributes,
                inst.tags,
                inst.provider,
                inst.cloud_provider,
                inst.cloud_region,
                state_version_id,
                synced_at,
            ])?;
            report.updated += 1;
        } else {
            insert.execute(params![
                workspace_id,
                inst.address,
                inst.resource_type,
                inst.resource_name,
                inst.mode,
                inst.index_key,
                inst.cloud_id,
                inst.cloud_name,
                inst.cloud_arn,
                inst.description,
                inst.module_path,
                inst.module_depth,
                inst.parent_module_path,
                inst.root_module_name,
                inst.attributes,
                inst.tags,
                inst.provider,
                inst.cloud_provider,
                inst.cloud_region,
                state_version_id,
                synced_at,
            ])?;
            existing.insert(inst.address.clone(), tx.last_insert_rowid());
            report.inserted += 1;
        }
    }

    let mut delete = tx.prepare("DELETE FROM resource_index WHERE id = ?1")?;
    for address in stale_candidates.difference(&seen) {
        if let Some(&id) = existing.get(address) {
            delete.execute(params![id])?;
            report.deleted += 1;
        }
    }
    Ok(())
}

fn replace_modules(
    tx: &Transaction<'_>,
    workspace_id: &str,
    instances: &[ParsedInstance],
    module_paths: &BTreeSet<String>,
) -> Result<usize> {
    tx.execute(
        "DELETE FROM module_hierarchy WHERE workspace_id = ?1",
        params![workspace_id],
    )?;
    if module_paths.is_empty() {
        return Ok(0);
    }

    let mut direct: HashMap<&str, i64> = HashMap::new();
    for inst in instances {
        if !inst.module_path.is_empty() {
            *direct.entry(inst.module_path.as_str()).or_default() += 1;
        }
    }
    let parents: HashMap<&str, String> = module_paths
        .iter()
        .map(|p| (p.as_str(), parse_module_path(p).parent_path))
        .collect();

    let synced_at = now();
    let mut insert = tx.prepare(
        "INSERT INTO module_hierarchy (workspace_id, module_path, module_name, module_key,
            parent_path, depth, resource_count, total_resource_count, child_module_count, last_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    for path in module_paths {
        let info = parse_module_path(path);
        let (name, key) = module_name_and_key(path);
        let nested_prefix = format!("{}.module.", path);
        let resource_count = direct.get(path.as_str()).copied().unwrap_or(0);
        let total: i64 = direct
            .iter()
            .filter(|(p, _)| **p == path.as_str() || p.starts_with(&nested_prefix))
            .map(|(_, n)| *n)
            .sum();
        let children = parents.values().filter(|parent| *parent == path).count() as i64;
        insert.execute(params![
            workspace_id,
            path,
            name,
            key,
            info.parent_path,
            info.depth,
            resource_count,
            total,
            children,
            synced_at,
        ])?;
    }
    Ok(module_paths.len())
}
