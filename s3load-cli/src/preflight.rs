//! Reachability check of the endpoint before a run.

use std::time::Duration;

use anyhow::{Context, Result};

const USER_AGENT: &str = concat!("s3load/", env!("CARGO_PKG_VERSION"));

/// Time the endpoint gets to answer the preflight request.
pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Checks that the endpoint answers HTTP requests at all.
///
/// Any response counts, including errors such as `403 Forbidden`. Only transport failures make the
/// endpoint unreachable.
pub async fn check_endpoint(endpoint: &str, tls_verify: bool, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(!tls_verify)
        .timeout(timeout)
        .build()
        .context("failed to create HTTP client")?;

    let response = client
        .head(endpoint)
        .send()
        .await
        .with_context(|| format!("endpoint `{endpoint}` is unreachable"))?;

    tracing::debug!(endpoint, status = %response.status(), "endpoint is reachable");
    Ok(())
}
