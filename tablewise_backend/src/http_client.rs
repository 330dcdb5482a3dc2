use std::time::Duration;

use anyhow::{anyhow, Result};

const SYSTEM_PROXY_ENV: &str = "TABLEWISE_ENABLE_SYSTEM_PROXY";

/// Client shared by the LLM and embedding calls.
///
/// System proxy discovery can panic on some platforms, so it only runs when
/// `TABLEWISE_ENABLE_SYSTEM_PROXY=1`; otherwise the client is built with `no_proxy`.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    if system_proxy_enabled() {
        match std::panic::catch_unwind(|| client_builder(timeout).build()) {
            Ok(Ok(client)) => return Ok(client),
            _ => tracing::warn!(
                "HTTP client with system proxy discovery failed; falling back to no_proxy"
            ),
        }
    }

    match std::panic::catch_unwind(|| client_builder(timeout).no_proxy().build()) {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(error)) => Err(anyhow!("Failed to initialize HTTP client: {}", error)),
        Err(_) => Err(anyhow!("HTTP client initialization panicked")),
    }
}

fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder().timeout(timeout)
}

fn system_proxy_enabled() -> bool {
    std::env::var(SYSTEM_PROXY_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
