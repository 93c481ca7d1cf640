use crate::db::models::IndexedResource;

const RESOURCE_TYPE_NAMES: &[(&str, &str)] = &[
    ("aws_vpc", "VPC virtual private cloud"),
    ("aws_subnet", "Subnet"),
    ("aws_security_group", "Security Group firewall"),
    ("aws_instance", "EC2 instance virtual machine"),
    ("aws_s3_bucket", "S3 bucket object storage"),
    ("aws_iam_role", "IAM role"),
    ("aws_iam_policy", "IAM policy"),
    ("aws_db_instance", "RDS database instance"),
    ("aws_eks_cluster", "EKS Kubernetes cluster"),
    ("aws_lambda_function", "Lambda function serverless"),
    ("aws_eip", "Elastic IP address"),
    ("aws_nat_gateway", "NAT gateway"),
    ("aws_internet_gateway", "Internet gateway"),
    ("aws_route_table", "Route table"),
    ("aws_lb", "Load balancer"),
    ("aws_autoscaling_group", "Auto Scaling group"),
    ("aws_cloudwatch_log_group", "CloudWatch log group"),
    ("aws_sns_topic", "SNS topic"),
    ("aws_sqs_queue", "SQS queue"),
    ("aws_dynamodb_table", "DynamoDB table"),
];

const REGION_NAMES: &[(&str, &str)] = &[
    ("ap-northeast-1", "Tokyo"),
    ("ap-northeast-2", "Seoul"),
    ("ap-southeast-1", "Singapore"),
    ("ap-southeast-2", "Sydney"),
    ("ap-east-1", "Hong Kong"),
    ("us-east-1", "N. Virginia"),
    ("us-east-2", "Ohio"),
    ("us-west-1", "N. California"),
    ("us-west-2", "Oregon"),
    ("eu-west-1", "Ireland"),
    ("eu-west-2", "London"),
    ("eu-central-1", "Frankfurt"),
    ("cn-north-1", "Beijing"),
    ("cn-northwest-1", "Ningxia"),
];

/// Readable name for a resource type; unknown types are returned unchanged.
pub fn resource_type_display_name(resource_type: &str) -> &str {
    RESOURCE_TYPE_NAMES
        .iter()
        .find(|(t, _)| *t == resource_type)
        .map(|(_, name)| *name)
        .unwrap_or(resource_type)
}

pub fn region_display_name(region: &str) -> Option<&'static str> {
    REGION_NAMES
        .iter()
        .find(|(r, _)| *r == region)
        .map(|(_, name)| *name)
}

/// Deterministic text a resource is embedded from.
pub fn build_embedding_text(resource: &IndexedResource) -> String {
    let mut parts: Vec<&str> = Vec::new();
    fn non_empty(s: &Option<String>) -> Option<&str> {
        s.as_deref().filter(|v| !v.is_empty())
    }

    if let Some(name) = non_empty(&resource.cloud_resource_name) {
        parts.push(name);
    }
    if let Some(desc) = non_empty(&resource.description) {
        parts.push(desc);
    }
    for key in ["Name", "Environment", "Team", "Project"] {
        if let Some(value) = resource.tag(key).filter(|v| !v.is_empty()) {
            parts.push(value);
        }
    }
    parts.push(resource_type_display_name(&resource.resource_type));
    if let Some(region) = non_empty(&resource.cloud_region) {
        parts.push(region);
        if let Some(display) = region_display_name(region) {
            parts.push(display);
        }
    }
    if let Some(provider) = non_empty(&resource.cloud_provider) {
        parts.push(provider);
    }
    parts.join(" ")
}
