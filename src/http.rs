use reqwest::Client;
use std::time::Duration;

/// Shared HTTP client for classifier calls and media downloads.
///
/// `VERIFY_CERTIFICATE=false` disables TLS verification for media hosts with
/// broken certificate chains, mirroring the producer-side setting.
pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    let verify = std::env::var("VERIFY_CERTIFICATE")
        .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no"))
        .unwrap_or(true);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .danger_accept_invalid_certs(!verify)
        .build()
        .unwrap_or_else(|_| Client::new())
}
