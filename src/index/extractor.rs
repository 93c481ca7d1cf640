use serde_json::Value;

/// Attribute fallbacks for resource types whose display name is not in
/// `name`, `tags.Name` or `description`.
const FALLBACK_RULES: &[(&str, &[&str])] = &[
    ("aws_instance", &["private_dns", "private_ip"]),
    ("aws_launch_template", &["name_prefix"]),
    ("aws_autoscaling_group", &["name_prefix"]),
    ("aws_vpc", &["cidr_block"]),
    ("aws_subnet", &["cidr_block", "availability_zone"]),
    ("aws_security_group", &["name_prefix"]),
    ("aws_lb", &["dns_name"]),
    ("aws_lb_target_group", &["name_prefix"]),
    ("aws_db_instance", &["db_instance_identifier", "endpoint"]),
    ("aws_rds_cluster", &["cluster_identifier", "endpoint"]),
    ("aws_s3_bucket", &["bucket"]),
    ("aws_ebs_volume", &["availability_zone"]),
    ("aws_iam_role", &["name_prefix"]),
    ("aws_iam_policy", &["name_prefix"]),
    ("aws_iam_instance_profile", &["name_prefix"]),
    ("aws_eks_cluster", &["endpoint"]),
    ("aws_eks_node_group", &["node_group_name"]),
];

const DESCRIPTION_NAME_LIMIT: usize = 50;

fn string_attr<'a>(attributes: &'a Value, key: &str) -> Option<&'a str> {
    attributes
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Best human-facing name for a resource instance.
pub fn extract_name(resource_type: &str, attributes: &Value) -> String {
    if let Some(name) = string_attr(attributes, "name") {
        return name.to_string();
    }
    for tag_field in ["tags", "tags_all"] {
        if let Some(name) = attributes.get(tag_field).and_then(|t| string_attr(t, "Name")) {
            return name.to_string();
        }
    }
    if let Some(desc) = string_attr(attributes, "description") {
        if desc.chars().count() > DESCRIPTION_NAME_LIMIT {
            let truncated: String = desc.chars().take(DESCRIPTION_NAME_LIMIT).collect();
            return format!("{}...", truncated);
        }
        return desc.to_string();
    }
    if let Some((_, fields)) = FALLBACK_RULES.iter().find(|(t, _)| *t == resource_type) {
        for field in *fields {
            if let Some(value) = string_attr(attributes, field) {
                return value.to_string();
            }
        }
    }
    if let Some(id) = string_attr(attributes, "id") {
        return id.to_string();
    }
    "unnamed".to_string()
}

/// Region from `region`, an availability zone, or an ARN.
pub fn extract_region(attributes: &Value) -> Option<String> {
    if let Some(region) = string_attr(attributes, "region") {
        return Some(region.to_string());
    }
    if let Some(zone) = string_attr(attributes, "availability_zone") {
        let trimmed = zone.trim_end_matches(|c: char| c.is_ascii_alphabetic());
        if !trimmed.is_empty() && trimmed.len() < zone.len() {
            return Some(trimmed.to_string());
        }
    }
    string_attr(attributes, "arn")
        .and_then(|arn| arn.split(':').nth(3))
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}

/// Short provider name from a state provider address such as
/// `provider["registry.terraform.io/hashicorp/aws"].west`.
pub fn provider_name(provider_address: &str) -> Option<String> {
    let inner = match (provider_address.find("[\""), provider_address.find("\"]")) {
        (Some(start), Some(end)) if end > start => &provider_address[start + 2..end],
        _ => provider_address.trim_start_matches("provider."),
    };
    let name = inner.rsplit('/').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Cloud provider family for a provider address.
pub fn cloud_provider(provider_address: &str) -> Option<String> {
    let name = provider_name(provider_address)?;
    let family = match name.as_str() {
        "aws" => "aws",
        "azurerm" | "azuread" => "azure",
        "google" | "google-beta" => "gcp",
        "alicloud" => "aliyun",
        other => other,
    };
    Some(family.to_string())
}
