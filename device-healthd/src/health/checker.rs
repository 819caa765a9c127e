use std::net::SocketAddr;
use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::types::validate_ip;
use crate::config::HealthConfig;

/// Network liveness probe for a device.
///
/// `Ok(false)` means the device answered but is not healthy; `Err` means no
/// definitive answer (transport error, timeout). Timeouts are enforced here,
/// the caller never cancels a probe in flight.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceHealthChecker: Send + Sync {
    async fn check_health(&self, ip_address: &str) -> Result<bool>;
}

/// Probes `GET http://{ip}:{port}{path}` and treats any 2xx as alive.
pub struct HttpHealthChecker {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpHealthChecker {
    pub fn new(config: &HealthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.check_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            port: config.check_port,
            path: config.check_path.clone(),
        })
    }

    fn url_for(&self, ip_address: &str) -> Result<String> {
        let ip = validate_ip(ip_address)?;
        // SocketAddr's Display brackets IPv6 hosts
        Ok(format!("http://{}{}", SocketAddr::new(ip, self.port), self.path))
    }
}

#[async_trait]
impl DeviceHealthChecker for HttpHealthChecker {
    async fn check_health(&self, ip_address: &str) -> Result<bool> {
        let url = self.url_for(ip_address)?;

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Health check request to {} failed", url))?;

        let status = response.status();
        tracing::debug!(%url, %status, "Health check answered");
        Ok(status.is_success())
    }
}
