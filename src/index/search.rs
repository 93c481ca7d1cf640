use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::Result;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    pub workspace_id: Option<String>,
    pub resource_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub workspace_id: String,
    pub workspace_name: Option<String>,
    pub terraform_address: Option<String>,
    pub resource_type: String,
    pub resource_name: String,
    pub cloud_resource_id: Option<String>,
    pub cloud_resource_name: Option<String>,
    pub cloud_resource_arn: Option<String>,
    pub description: Option<String>,
    pub module_path: String,
    pub root_module_name: String,
    pub source_type: String,
    pub cloud_provider: Option<String>,
    pub cloud_region: Option<String>,
    pub match_rank: f64,
}

/// Escape `%`, `_` and `\` so they match literally under `ESCAPE '\'`.
fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Free-text search over managed rows, ranked by match quality.
pub fn search(db: &Database, query: &str, filter: &SearchFilter) -> Result<Vec<SearchHit>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let limit = filter.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_SEARCH_LIMIT) as i64;
    let escaped = escape_like(query);
    let prefix = format!("{}%", escaped);
    let contains = format!("%{}%", escaped);

    let conn = db.conn()?;
    let mut stmt = conn.prepare(
        r"SELECT ri.workspace_id, w.name, ri.terraform_address, ri.resource_type, ri.resource_name,
            ri.cloud_resource_id, ri.cloud_resource_name, ri.cloud_resource_arn, ri.description,
            ri.module_path, ri.root_module_name, ri.source_type, ri.cloud_provider, ri.cloud_region,
            CASE
                WHEN LOWER(ri.cloud_resource_id) = LOWER(?1) THEN 1.0
                WHEN LOWER(ri.cloud_resource_name) = LOWER(?1) THEN 0.9
                WHEN LOWER(ri.cloud_resource_arn) = LOWER(?1) THEN 0.85
                WHEN ri.cloud_resource_id LIKE ?2 ESCAPE '\' THEN 0.8
                WHEN ri.cloud_resource_name LIKE ?2 ESCAPE '\' THEN 0.7
                WHEN ri.cloud_resource_arn LIKE ?2 ESCAPE '\' THEN 0.65
                WHEN ri.cloud_resource_id LIKE ?3 ESCAPE '\' THEN 0.6
                WHEN ri.cloud_resource_name LIKE ?3 ESCAPE '\' THEN 0.5
                WHEN ri.cloud_resource_arn LIKE ?3 ESCAPE '\' THEN 0.45
                WHEN ri.description LIKE ?3 ESCAPE '\' THEN 0.4
                WHEN ri.terraform_address LIKE ?3 ESCAPE '\' THEN 0.3
                ELSE 0.1
            END AS match_rank
         FROM resource_index ri
         LEFT JOIN workspaces w ON ri.workspace_id = w.workspace_id
         WHERE ri.resource_mode = 'managed'
           AND (ri.cloud_resource_id LIKE ?3 ESCAPE '\'
             OR ri.cloud_resource_name LIKE ?3 ESCAPE '\'
             OR ri.cloud_resource_arn LIKE ?3 ESCAPE '\'
             OR ri.description LIKE ?3 ESCAPE '\'
             OR ri.terraform_address LIKE ?3 ESCAPE '\')
           AND (?4 IS NULL OR ri.workspace_id = ?4)
           AND (?5 IS NULL OR ri.resource_type = ?5)
         ORDER BY CASE ri.source_type WHEN 'terraform' THEN 0 ELSE 1 END, match_rank DESC,
            ri.cloud_resource_name
         LIMIT ?6",
    )?;
    let hits = stmt
        .query_map(
            params![
                query,
                prefix,
                contains,
                filter.workspace_id,
                filter.resource_type,
                limit
            ],
            |row| {
                Ok(SearchHit {
                    workspace_id: row.get(0)?,
                    workspace_name: row.get(1)?,
                    terraform_address: row.get(2)?,
                    resource_type: row.get(3)?,
                    resource_name: row.get(4)?,
                    cloud_resource_id: row.get(5)?,
                    cloud_resource_name: row.get(6)?,
                    cloud_resource_arn: row.get(7)?,
                    description: row.get(8)?,
                    module_path: row.get(9)?,
                    root_module_name: row.get(10)?,
                    source_type: row.get(11)?,
                    cloud_provider: row.get(12)?,
                    cloud_region: row.get(13)?,
                    match_rank: row.get(14)?,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("10%_off"), r"10\%\_off");
        assert_eq!(escape_like(r"a\b"), r"a\\b");
        assert_eq!(escape_like("vpc-1"), "vpc-1");
    }
}
