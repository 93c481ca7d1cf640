use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use serde_json::{json, Map, Value};

use crate::db::models::RemoteDataToken;
use crate::db::{now, parse_timestamp, timestamp, Database};
use crate::error::{Error, Result};
use crate::state::StateDocument;

pub const TOKEN_TTL_MINUTES: i64 = 30;
pub const TOKEN_MAX_USES: i64 = 5;

/// Short-lived bearer tokens that let one workspace's run read another
/// workspace's state outputs.
pub struct RemoteDataService {
    db: Arc<Database>,
}

impl RemoteDataService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Issue a token for `requester` to read `source`'s outputs.
    pub fn issue(
        &self,
        requester_workspace_id: &str,
        source_workspace_id: &str,
        task_id: Option<i64>,
    ) -> Result<RemoteDataToken> {
        let mut rng = rand::rng();
        let mut secret = [0u8; 32];
        rng.fill(&mut secret[..]);
        let mut id_bytes = [0u8; 8];
        rng.fill(&mut id_bytes[..]);

        let token_id = format!("rdt-{}", hex::encode(id_bytes));
        let token = hex::encode(secret);
        let expires_at = timestamp(Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES));

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO remote_data_tokens (token_id, token, workspace_id, requester_workspace_id,
                task_id, max_uses, used_count, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
            params![
                token_id,
                token,
                source_workspace_id,
                requester_workspace_id,
                task_id,
                TOKEN_MAX_USES,
                expires_at,
                now()
            ],
        )?;
        let sql = format!(
            "SELECT {} FROM remote_data_tokens WHERE token_id = ?1",
            RemoteDataToken::COLUMNS
        );
        let issued = conn.query_row(&sql, params![token_id], RemoteDataToken::from_row)?;
        tracing::debug!(
            token_id = %issued.token_id,
            source = %source_workspace_id,
            requester = %requester_workspace_id,
            "Issued remote data token"
        );
        Ok(issued)
    }

    /// Spend one use of `token` and return the source workspace's outputs.
    pub fn consume(&self, token: &str, source_workspace_id: &str) -> Result<Value> {
        let sql = format!(
            "SELECT {} FROM remote_data_tokens WHERE token = ?1",
            RemoteDataToken::COLUMNS
        );
        {
            let conn = self.db.conn()?;
            let record = conn
                .query_row(&sql, params![token], RemoteDataToken::from_row)
                .optional()?
                .ok_or_else(|| Error::Validation("invalid token".into()))?;

            if record.workspace_id != source_workspace_id {
                return Err(Error::Validation(
                    "token was not issued for this workspace".into(),
                ));
            }
            let expired = parse_timestamp(&record.expires_at)
                .map(|at| at <= Utc::now())
                .unwrap_or(true);
            if expired || record.used_count >= record.max_uses {
                return Err(Error::Validation(
                    "token expired or exceeded max uses".into(),
                ));
            }

            let spent = conn.execute(
                "UPDATE remote_data_tokens SET used_count = used_count + 1, last_used_at = ?2
                 WHERE token_id = ?1 AND used_count < max_uses",
                params![record.token_id, now()],
            )?;
            if spent == 0 {
                return Err(Error::Validation(
                    "token expired or exceeded max uses".into(),
                ));
            }
        }

        let outputs = match self.db.latest_state_version(source_workspace_id)? {
            Some(version) => {
                let doc = StateDocument::parse(version.content.as_deref().unwrap_or("{}"))?;
                doc.outputs()
            }
            None => json!({}),
        };
        Ok(outputs)
    }

    /// Delete expired and exhausted tokens.
    pub fn cleanup(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let n = conn.execute(
            "DELETE FROM remote_data_tokens WHERE expires_at < ?1 OR used_count >= max_uses",
            params![now()],
        )?;
        if n > 0 {
            tracing::debug!(count = n, "Removed stale remote data tokens");
        }
        Ok(n)
    }

    /// Build `remote_data.tf.json` for a run of `workspace_id`, issuing one
    /// token per declared source. `None` when nothing is declared.
    pub fn render_config(
        &self,
        workspace_id: &str,
        task_id: Option<i64>,
        base_url: &str,
    ) -> Result<Option<Value>> {
        let sources = self.db.list_remote_data(workspace_id)?;
        if sources.is_empty() {
            return Ok(None);
        }
        let base_url = base_url.trim_end_matches('/');
        let mut data_blocks = Map::new();
        let mut locals = Map::new();
        for source in &sources {
            let token = self.issue(workspace_id, &source.source_workspace_id, task_id)?;
            let block_name = format!("remote_{}", sanitize_name(&source.data_name));
            data_blocks.insert(
                block_name.clone(),
                json!([{
                    "url": format!(
                        "{}/api/v1/workspaces/{}/state-outputs/full",
                        base_url, source.source_workspace_id
                    ),
                    "request_headers": {
                        "Authorization": format!("Bearer {}", token.token),
                    },
                }]),
            );
            locals.insert(
                source.data_name.clone(),
                Value::String(format!(
                    "${{jsondecode(data.http.{}.response_body).outputs}}",
                    block_name
                )),
            );
        }
        Ok(Some(json!({
            "data": { "http": data_blocks },
            "locals": locals,
        })))
    }
}

/// Map a name onto `[A-Za-z0-9_]`, prefixing `_` when it starts with a digit.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("vpc-outputs"), "vpc_outputs");
        assert_eq!(sanitize_name("1st.net"), "_1st_net");
        assert_eq!(sanitize_name("ok_name"), "ok_name");
    }
}
