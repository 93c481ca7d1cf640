use std::future::Future;
use std::time::Duration;

/// Toolchain init failures that are worth another attempt.
const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "context deadline exceeded",
    "client.timeout exceeded",
    "connection refused",
    "connection reset",
    "no such host",
    "i/o timeout",
    "tls handshake timeout",
    "failed to request discovery document",
    "error accessing remote module registry",
    "failed to retrieve available versions",
    "registry.terraform.io",
    "registry.opentofu.org",
    "could not download module",
    "error downloading",
    "network is unreachable",
    "temporary failure in name resolution",
];

/// Redispatch delays for a task put back in the queue, by attempt.
const REDISPATCH_DELAYS_SECS: &[u64] = &[5, 10, 20, 40, 60];

/// Whether toolchain output looks like a registry or network failure.
pub fn is_network_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    NETWORK_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Delay before the `retry_count`-th redispatch (1-based), capped at 60s.
pub fn redispatch_delay(retry_count: i64) -> Duration {
    let idx = (retry_count.max(1) as usize - 1).min(REDISPATCH_DELAYS_SECS.len() - 1);
    Duration::from_secs(REDISPATCH_DELAYS_SECS[idx])
}

/// Retry a fallible async operation with exponential backoff.
pub async fn with_retry<F, Fut, T, E>(
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
    f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(max_retries, base_delay_ms, operation_name, |_| true, f).await
}

/// Like [`with_retry`], but only errors accepted by `should_retry` are retried.
pub async fn with_retry_if<F, Fut, T, E, P>(
    max_retries: u32,
    base_delay_ms: u64,
    operation_name: &str,
    should_retry: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                attempt += 1;
                if attempt > max_retries {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        "All retry attempts exhausted"
                    );
                    return Err(e);
                }

                let delay = Duration::from_millis(base_delay_ms * 2u64.pow(attempt - 1));
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
