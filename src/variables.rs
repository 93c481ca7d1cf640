//! Versioned workspace variables.
//!
//! Every change appends a row; rows are never updated except to flag a whole
//! `variable_id` deleted. Sensitive values are stored through an
//! [`Encryptor`] and only leave the store in plaintext via
//! [`VariableStore::for_execution`].

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::models::{value_format, variable_type, Variable};
use crate::db::{now, random_id, Database};
use crate::error::{Error, Result};

/// Placeholder returned in place of sensitive values.
pub const MASKED_VALUE: &str = "********";

/// Opaque encryption of sensitive values at rest.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plain: &str) -> Result<String>;
    fn decrypt(&self, blob: &str) -> Result<String>;
}

/// Stores values as given. Only suitable for development and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextEncryptor;

impl Encryptor for PlaintextEncryptor {
    fn encrypt(&self, plain: &str) -> Result<String> {
        Ok(plain.to_string())
    }

    fn decrypt(&self, blob: &str) -> Result<String> {
        Ok(blob.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVariable {
    pub key: String,
    pub value: String,
    #[serde(default = "default_variable_type")]
    pub variable_type: String,
    #[serde(default = "default_value_format")]
    pub value_format: String,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_variable_type() -> String {
    variable_type::TERRAFORM.to_string()
}

fn default_value_format() -> String {
    value_format::STRING.to_string()
}

impl NewVariable {
    pub fn terraform(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            variable_type: default_variable_type(),
            value_format: default_value_format(),
            sensitive: false,
            description: String::new(),
            created_by: None,
        }
    }

    pub fn environment(key: &str, value: &str) -> Self {
        Self {
            variable_type: variable_type::ENVIRONMENT.to_string(),
            ..Self::terraform(key, value)
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Fields to change in [`VariableStore::update`]; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableChanges {
    pub key: Option<String>,
    pub value: Option<String>,
    pub value_format: Option<String>,
    pub sensitive: Option<bool>,
    pub description: Option<String>,
}

/// A variable with its value decrypted, for rendering into a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionVariable {
    pub key: String,
    pub value: String,
    pub variable_type: String,
    pub value_format: String,
    pub sensitive: bool,
    pub description: String,
}

pub struct VariableStore {
    db: Arc<Database>,
    encryptor: Arc<dyn Encryptor>,
}

impl VariableStore {
    pub fn new(db: Arc<Database>) -> Self {
        tracing::warn!("No encryptor configured, sensitive variables are stored in plaintext");
        Self {
            db,
            encryptor: Arc::new(PlaintextEncryptor),
        }
    }

    pub fn with_encryptor(db: Arc<Database>, encryptor: Arc<dyn Encryptor>) -> Self {
        Self { db, encryptor }
    }

    pub fn create(&self, workspace_id: &str, new: &NewVariable) -> Result<Variable> {
        validate_key(&new.key)?;
        validate_type(&new.variable_type)?;
        validate_format(&new.value_format)?;
        let value = if new.sensitive {
            self.encryptor.encrypt(&new.value)?
        } else {
            new.value.clone()
        };

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM workspaces WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::not_found("workspace", workspace_id));
        }
        if key_in_use(&tx, workspace_id, &new.key, &new.variable_type, None)? {
            return Err(Error::Conflict(format!("variable {} already exists", new.key)));
        }

        let variable_id = random_id("var-");
        let version = next_version(&tx, &variable_id, workspace_id, &new.key, &new.variable_type)?;
        tx.execute(
            "INSERT INTO workspace_variables (variable_id, workspace_id, key, version, value,
                variable_type, value_format, sensitive, description, is_deleted, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
            params![
                variable_id,
                workspace_id,
                new.key,
                version,
                value,
                new.variable_type,
                new.value_format,
                new.sensitive,
                new.description,
                new.created_by,
                now()
            ],
        )?;
        let created = latest_row(&tx, &variable_id)?
            .ok_or_else(|| Error::internal("inserted variable not readable"))?;
        tx.commit()?;

        tracing::info!(workspace_id = %workspace_id, variable_id = %variable_id, key = %new.key, "Created variable");
        Ok(mask(created))
    }

    /// Latest live version of each variable, ordered by key.
    pub fn list(&self, workspace_id: &str, var_type: Option<&str>) -> Result<Vec<Variable>> {
        let conn = self.db.conn()?;
        Ok(live_variables(&conn, workspace_id, var_type)?
            .into_iter()
            .map(mask)
            .collect())
    }

    pub fn get(&self, variable_id: &str) -> Result<Variable> {
        let conn = self.db.conn()?;
        let current = latest_row(&conn, variable_id)?
            .filter(|v| !v.is_deleted)
            .ok_or_else(|| Error::not_found("variable", variable_id))?;
        Ok(mask(current))
    }

    /// Append a new version. `expected_version` must match the latest one.
    pub fn update(
        &self,
        variable_id: &str,
        expected_version: i64,
        changes: &VariableChanges,
    ) -> Result<Variable> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let current = latest_row(&tx, variable_id)?
            .filter(|v| !v.is_deleted)
            .ok_or_else(|| Error::not_found("variable", variable_id))?;

        if current.version != expected_version {
            return Err(Error::VersionConflict {
                current: current.version,
                expected: expected_version,
            });
        }
        if current.sensitive && changes.sensitive == Some(false) {
            return Err(Error::Validation(
                "a sensitive variable cannot be made non-sensitive; delete and recreate it".into(),
            ));
        }
        let key = changes.key.clone().unwrap_or_else(|| current.key.clone());
        if key != current.key {
            validate_key(&key)?;
            if key_in_use(&tx, &current.workspace_id, &key, &current.variable_type, Some(variable_id))? {
                return Err(Error::Conflict(format!("variable {} already exists", key)));
            }
        }
        let format = changes
            .value_format
            .clone()
            .unwrap_or_else(|| current.value_format.clone());
        validate_format(&format)?;
        let sensitive = changes.sensitive.unwrap_or(current.sensitive);

        let value = match (&changes.value, sensitive, current.sensitive) {
            (Some(v), true, _) => self.encryptor.encrypt(v)?,
            (Some(v), false, _) => v.clone(),
            (None, true, false) => self.encryptor.encrypt(&current.value)?,
            (None, _, _) => current.value.clone(),
        };
        let description = changes
            .description
            .clone()
            .unwrap_or_else(|| current.description.clone());

        let version = next_version(
            &tx,
            variable_id,
            &current.workspace_id,
            &key,
            &current.variable_type,
        )?;
        tx.execute(
            "INSERT INTO workspace_variables (variable_id, workspace_id, key, version, value,
                variable_type, value_format, sensitive, description, is_deleted, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
            params![
                variable_id,
                current.workspace_id,
                key,
                version,
                value,
                current.variable_type,
                format,
                sensitive,
                description,
                current.created_by,
                now()
            ],
        )?;
        let updated = latest_row(&tx, variable_id)?
            .ok_or_else(|| Error::internal("updated variable not readable"))?;
        tx.commit()?;

        tracing::info!(variable_id = %variable_id, from = current.version, to = version, "Updated variable");
        Ok(mask(updated))
    }

    /// Flag every version deleted and append a tombstone.
    pub fn delete(&self, variable_id: &str) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let current = latest_row(&tx, variable_id)?
            .filter(|v| !v.is_deleted)
            .ok_or_else(|| Error::not_found("variable", variable_id))?;

        tx.execute(
            "UPDATE workspace_variables SET is_deleted = 1 WHERE variable_id = ?1",
            params![variable_id],
        )?;
        let version = next_version(
            &tx,
            variable_id,
            &current.workspace_id,
            &current.key,
            &current.variable_type,
        )?;
        tx.execute(
            "INSERT INTO workspace_variables (variable_id, workspace_id, key, version, value,
                variable_type, value_format, sensitive, description, is_deleted, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?11)",
            params![
                variable_id,
                current.workspace_id,
                current.key,
                version,
                current.value,
                current.variable_type,
                current.value_format,
                current.sensitive,
                current.description,
                current.created_by,
                now()
            ],
        )?;
        tx.commit()?;
        tracing::info!(variable_id = %variable_id, key = %current.key, "Deleted variable");
        Ok(())
    }

    /// Full history of a variable, oldest first.
    pub fn versions(&self, variable_id: &str) -> Result<Vec<Variable>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM workspace_variables WHERE variable_id = ?1 ORDER BY version",
            Variable::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![variable_id], Variable::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Err(Error::not_found("variable", variable_id));
        }
        Ok(rows.into_iter().map(mask).collect())
    }

    /// Live variables with sensitive values decrypted.
    pub fn for_execution(&self, workspace_id: &str) -> Result<Vec<ExecutionVariable>> {
        let rows = {
            let conn = self.db.conn()?;
            live_variables(&conn, workspace_id, None)?
        };
        rows.into_iter()
            .map(|v| {
                let value = if v.sensitive {
                    self.encryptor.decrypt(&v.value)?
                } else {
                    v.value
                };
                Ok(ExecutionVariable {
                    key: v.key,
                    value,
                    variable_type: v.variable_type,
                    value_format: v.value_format,
                    sensitive: v.sensitive,
                    description: v.description,
                })
            })
            .collect()
    }
}

fn mask(mut variable: Variable) -> Variable {
    if variable.sensitive {
        variable.value = MASKED_VALUE.to_string();
    }
    variable
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::Validation("variable key must not be empty".into()));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(Error::Validation(format!(
            "variable key must not contain whitespace: {:?}",
            key
        )));
    }
    Ok(())
}

fn validate_type(var_type: &str) -> Result<()> {
    match var_type {
        variable_type::TERRAFORM | variable_type::ENVIRONMENT => Ok(()),
        other => Err(Error::Validation(format!("unknown variable type: {}", other))),
    }
}

fn validate_format(format: &str) -> Result<()> {
    match format {
        value_format::STRING | value_format::HCL => Ok(()),
        other => Err(Error::Validation(format!("unknown value format: {}", other))),
    }
}

fn latest_row(conn: &Connection, variable_id: &str) -> Result<Option<Variable>> {
    let sql = format!(
        "SELECT {} FROM workspace_variables WHERE variable_id = ?1 ORDER BY version DESC LIMIT 1",
        Variable::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![variable_id], Variable::from_row)
        .optional()?)
}

/// Whether another live variable already uses `key` for this type.
fn key_in_use(
    conn: &Connection,
    workspace_id: &str,
    key: &str,
    var_type: &str,
    except_variable: Option<&str>,
) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT COUNT(*) > 0 FROM workspace_variables
         WHERE workspace_id = ?1 AND key = ?2 AND variable_type = ?3 AND is_deleted = 0
           AND (?4 IS NULL OR variable_id != ?4)",
        params![workspace_id, key, var_type, except_variable],
        |row| row.get(0),
    )?)
}

/// Next version clear of both unique constraints.
fn next_version(
    conn: &Connection,
    variable_id: &str,
    workspace_id: &str,
    key: &str,
    var_type: &str,
) -> Result<i64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM workspace_variables
         WHERE variable_id = ?1 OR (workspace_id = ?2 AND key = ?3 AND variable_type = ?4)",
        params![variable_id, workspace_id, key, var_type],
        |row| row.get(0),
    )?;
    Ok(max + 1)
}

fn live_variables(
    conn: &Connection,
    workspace_id: &str,
    var_type: Option<&str>,
) -> Result<Vec<Variable>> {
    let sql = format!(
        "SELECT {} FROM workspace_variables v
         WHERE v.workspace_id = ?1 AND v.is_deleted = 0
           AND (?2 IS NULL OR v.variable_type = ?2)
           AND v.version = (SELECT MAX(version) FROM workspace_variables
                            WHERE variable_id = v.variable_id)
         ORDER BY v.key, v.variable_type",
        Variable::COLUMNS
            .split(", ")
            .map(|c| format!("v.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![workspace_id, var_type], Variable::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
