use std::collections::HashMap;

use serde::Serialize;

use crate::db::models::{IndexedResource, ModuleNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNodeKind {
    Module,
    Resource,
}

/// A module or managed resource in the workspace's resource tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub kind: TreeNodeKind,
    pub name: String,
    pub path: String,
    pub resource_type: Option<String>,
    pub cloud_id: Option<String>,
    pub cloud_name: Option<String>,
    pub description: Option<String>,
    pub resource_count: i64,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn resource(r: &IndexedResource) -> Self {
        Self {
            kind: TreeNodeKind::Resource,
            name: r.resource_name.clone(),
            path: r.terraform_address.clone().unwrap_or_default(),
            resource_type: Some(r.resource_type.clone()),
            cloud_id: r.cloud_resource_id.clone(),
            cloud_name: r.cloud_resource_name.clone(),
            description: r.description.clone(),
            resource_count: 0,
            children: Vec::new(),
        }
    }
}

/// Nest modules under their parents and resources under their module.
/// Root-level resources follow the root modules.
pub fn build_tree(modules: &[ModuleNode], resources: &[IndexedResource]) -> Vec<TreeNode> {
    let mut child_modules: HashMap<&str, Vec<&ModuleNode>> = HashMap::new();
    for m in modules {
        child_modules.entry(m.parent_path.as_str()).or_default().push(m);
    }
    let mut module_resources: HashMap<&str, Vec<&IndexedResource>> = HashMap::new();
    for r in resources
        .iter()
        .filter(|r| r.resource_mode == "managed" && r.source_type == "terraform")
    {
        module_resources.entry(r.module_path.as_str()).or_default().push(r);
    }

    let mut roots: Vec<TreeNode> = child_modules
        .get("")
        .map(|ms| {
            ms.iter()
                .map(|m| module_node(m, &child_modules, &module_resources))
                .collect()
        })
        .unwrap_or_default();
    if let Some(rs) = module_resources.get("") {
        roots.extend(rs.iter().map(|r| TreeNode::resource(r)));
    }
    roots
}

fn module_node(
    module: &ModuleNode,
    child_modules: &HashMap<&str, Vec<&ModuleNode>>,
    module_resources: &HashMap<&str, Vec<&IndexedResource>>,
) -> TreeNode {
    let mut children: Vec<TreeNode> = child_modules
        .get(module.module_path.as_str())
        .map(|ms| {
            ms.iter()
                .map(|m| module_node(m, child_modules, module_resources))
                .collect()
        })
        .unwrap_or_default();
    if let Some(rs) = module_resources.get(module.module_path.as_str()) {
        children.extend(rs.iter().map(|r| TreeNode::resource(r)));
    }
    TreeNode {
        kind: TreeNodeKind::Module,
        name: module.module_name.clone(),
        path: module.module_path.clone(),
        resource_type: None,
        cloud_id: None,
        cloud_name: None,
        description: None,
        resource_count: module.total_resource_count,
        children,
    }
}
