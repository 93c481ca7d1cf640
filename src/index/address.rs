//! Resource addresses and module paths as they appear in state files.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Render an instance `index_key`: strings are quoted, integers bare.
pub fn format_index_key(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(format!("\"{}\"", s)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(|i| i.to_string()),
        _ => None,
    }
}

/// `module.a.module.b.aws_vpc.main["x"]`
pub fn build_address(
    module_path: &str,
    resource_type: &str,
    resource_name: &str,
    index_key: Option<&str>,
) -> String {
    let mut address = if module_path.is_empty() {
        format!("{}.{}", resource_type, resource_name)
    } else {
        format!("{}.{}.{}", module_path, resource_type, resource_name)
    };
    if let Some(key) = index_key.filter(|k| !k.is_empty()) {
        address.push('[');
        address.push_str(key);
        address.push(']');
    }
    address
}

/// Position of a module path in the module tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModulePathInfo {
    pub depth: i64,
    pub parent_path: String,
    pub root_module_name: String,
}

const MODULE_SEPARATOR: &str = ".module.";

/// Split `module.a["k"].module.b` into depth, parent path and root name.
pub fn parse_module_path(module_path: &str) -> ModulePathInfo {
    if module_path.is_empty() {
        return ModulePathInfo::default();
    }
    let parts: Vec<&str> = module_path.split(MODULE_SEPARATOR).collect();
    let depth = parts.len() as i64;

    let parent_path = if parts.len() > 1 {
        with_module_prefix(parts[..parts.len() - 1].join(MODULE_SEPARATOR))
    } else {
        String::new()
    };

    let root_module_name = module_path
        .strip_prefix("module.")
        .and_then(|rest| rest.split('.').next())
        .map(|first| match first.find('[') {
            Some(idx) if idx > 0 => first[..idx].to_string(),
            _ => first.to_string(),
        })
        .unwrap_or_default();

    ModulePathInfo {
        depth,
        parent_path,
        root_module_name,
    }
}

/// Name and `for_each` key of the last module in the path.
pub fn module_name_and_key(module_path: &str) -> (String, Option<String>) {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let last = module_path
        .rsplit(MODULE_SEPARATOR)
        .next()
        .unwrap_or(module_path);
    let last = last.strip_prefix("module.").unwrap_or(last);

    let pattern = PATTERN.get_or_init(|| Regex::new(r#"^([^\[]+)(?:\["([^"]+)"\])?$"#).ok());
    if let Some(caps) = pattern.as_ref().and_then(|re| re.captures(last)) {
        let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let key = caps.get(2).map(|m| m.as_str().to_string());
        return (name, key);
    }
    (last.to_string(), None)
}

/// Add `module_path` and all of its ancestors to `paths`.
pub fn collect_module_paths(module_path: &str, paths: &mut BTreeSet<String>) {
    if module_path.is_empty() {
        return;
    }
    paths.insert(module_path.to_string());
    let parts: Vec<&str> = module_path.split(MODULE_SEPARATOR).collect();
    for i in (1..parts.len()).rev() {
        paths.insert(with_module_prefix(parts[..i].join(MODULE_SEPARATOR)));
    }
}

fn with_module_prefix(path: String) -> String {
    if path.starts_with("module.") {
        path
    } else {
        format!("module.{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_key_quoting() {
        assert_eq!(format_index_key(&json!("web")).as_deref(), Some("\"web\""));
        assert_eq!(format_index_key(&json!(2)).as_deref(), Some("2"));
        assert_eq!(format_index_key(&json!(null)), None);
    }

    #[test]
    fn test_build_address() {
        assert_eq!(build_address("", "aws_vpc", "main", None), "aws_vpc.main");
        assert_eq!(
            build_address("module.net", "aws_subnet", "private", Some("0")),
            "module.net.aws_subnet.private[0]"
        );
        assert_eq!(
            build_address("", "aws_instance", "web", Some("\"a\"")),
            "aws_instance.web[\"a\"]"
        );
    }

    #[test]
    fn test_parse_nested_module_path() {
        let info = parse_module_path("module.app[\"prod\"].module.db.module.replica");
        assert_eq!(info.depth, 3);
        assert_eq!(info.parent_path, "module.app[\"prod\"].module.db");
        assert_eq!(info.root_module_name, "app");

        let root = parse_module_path("module.vpc");
        assert_eq!(root.depth, 1);
        assert_eq!(root.parent_path, "");
        assert_eq!(root.root_module_name, "vpc");

        assert_eq!(parse_module_path(""), ModulePathInfo::default());
    }

    #[test]
    fn test_module_name_and_key() {
        assert_eq!(
            module_name_and_key("module.app[\"prod\"]"),
            ("app".to_string(), Some("prod".to_string()))
        );
        assert_eq!(
            module_name_and_key("module.app.module.db"),
            ("db".to_string(), None)
        );
    }

    #[test]
    fn test_collect_includes_ancestors() {
        let mut paths = BTreeSet::new();
        collect_module_paths("module.a.module.b.module.c", &mut paths);
        let got: Vec<_> = paths.into_iter().collect();
        assert_eq!(
            got,
            vec!["module.a", "module.a.module.b", "module.a.module.b.module.c"]
        );
    }
}
