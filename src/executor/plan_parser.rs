use serde::Deserialize;
use serde_json::Value;

use crate::db::models::ResourceChange;
use crate::error::{Error, Result};

// ─── Plan JSON (`show -json plan.out`) ─────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PlanDocument {
    #[serde(default)]
    resource_changes: Vec<PlanResourceChange>,
}

#[derive(Debug, Deserialize)]
struct PlanResourceChange {
    address: String,
    #[serde(rename = "type", default)]
    resource_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    module_address: Option<String>,
    change: PlanChange,
}

#[derive(Debug, Deserialize)]
struct PlanChange {
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
}

/// Collapse a toolchain action list into one action name.
///
/// `None` for no-ops and for sequences the core does not model.
pub fn encode_action(actions: &[String]) -> Option<&str> {
    match actions {
        [single] if single == "no-op" => None,
        [single] => Some(single.as_str()),
        [first, second] if first == "delete" && second == "create" => Some("replace"),
        _ => None,
    }
}

/// Parse `resource_changes[]` out of the plan JSON.
pub fn parse_plan_json(plan_json: &str) -> Result<Vec<ResourceChange>> {
    let doc: PlanDocument = serde_json::from_str(plan_json)
        .map_err(|e| Error::Validation(format!("malformed plan JSON: {}", e)))?;

    let mut changes = Vec::with_capacity(doc.resource_changes.len());
    for rc in doc.resource_changes {
        let Some(action) = encode_action(&rc.change.actions) else {
            if rc.change.actions.len() != 1 {
                tracing::debug!(
                    address = %rc.address,
                    actions = ?rc.change.actions,
                    "Ignoring unsupported action sequence"
                );
            }
            continue;
        };
        changes.push(ResourceChange {
            address: rc.address,
            resource_type: rc.resource_type,
            resource_name: rc.name,
            module_address: rc.module_address.filter(|m| !m.is_empty()),
            action: action.to_string(),
            before: rc.change.before.filter(|v| !v.is_null()),
            after: rc.change.after.filter(|v| !v.is_null()),
        });
    }
    Ok(changes)
}

/// `(add, change, destroy)` counters; a replace counts as add + destroy.
pub fn count_changes(changes: &[ResourceChange]) -> (i64, i64, i64) {
    changes
        .iter()
        .fold((0, 0, 0), |(add, change, destroy), c| match c.action.as_str() {
            "create" => (add + 1, change, destroy),
            "update" => (add, change + 1, destroy),
            "delete" => (add, change, destroy + 1),
            "replace" => (add + 1, change, destroy + 1),
            _ => (add, change, destroy),
        })
}

// ─── Machine-readable diagnostics ───────────────────────────────────────────

/// A single line of toolchain `-json` output.
#[derive(Debug, Deserialize)]
pub struct TerraformJsonLine {
    #[serde(rename = "@level")]
    pub level: Option<String>,
    #[serde(rename = "@message")]
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub line_type: Option<String>,
    pub diagnostic: Option<TerraformDiagnostic>,
}

/// A toolchain diagnostic (error/warning).
#[derive(Debug, Deserialize)]
pub struct TerraformDiagnostic {
    pub severity: Option<String>,
    pub summary: Option<String>,
    pub detail: Option<String>,
}

/// Error summaries from JSON diagnostics, if the output carried any.
pub fn extract_errors(lines: &[String]) -> Vec<String> {
    let mut errors = Vec::new();

    for line in lines {
        if let Ok(parsed) = serde_json::from_str::<TerraformJsonLine>(line) {
            if let Some(diag) = &parsed.diagnostic {
                if diag.severity.as_deref() == Some("error") {
                    let msg = match (diag.summary.as_deref(), diag.detail.as_deref()) {
                        (Some(summary), Some(detail)) if !detail.is_empty() => {
                            format!("{}: {}", summary, detail)
                        }
                        (Some(summary), _) => summary.to_string(),
                        (None, _) => "Unknown error".to_string(),
                    };
                    errors.push(msg);
                }
            }
        }
    }

    errors
}
