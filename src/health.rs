//! Liveness checks of a RabbitMq broker through its management API.
use crate::amqp::configuration::{ConnectionParameters, FailoverSettings};
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// The result of a health check.
#[derive(Debug)]
pub enum ProbeOutcome {
    Healthy,
    /// The broker answered, but not with a healthy status.
    Unhealthy,
    /// The broker could not be checked.
    ProbeError(anyhow::Error),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Answers "is this broker alive?" on behalf of the [`ChannelPool`](crate::pool::ChannelPool),
/// which asks it before failing back to the original primary.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, endpoint: &ConnectionParameters) -> ProbeOutcome;
}

#[derive(Deserialize)]
struct AlivenessResponse {
    status: String,
}

/// [`HealthProbe`] calling the `aliveness-test` endpoint of the RabbitMq management API
/// for the default virtual host, authenticated with the endpoint's credentials.
#[derive(Clone)]
pub struct AlivenessProbe {
    client: reqwest::Client,
    management_port: u16,
}

impl AlivenessProbe {
    pub fn new(management_port: u16, timeout: Duration) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build the HTTP client for RabbitMq health checks.")?;
        Ok(Self {
            client,
            management_port,
        })
    }

    pub fn new_from_config(settings: &FailoverSettings) -> Result<Self, anyhow::Error> {
        Self::new(settings.management_port, settings.probe_timeout())
    }

    fn aliveness_url(&self, host: &str) -> String {
        format!(
            "http://{host}:{}/api/aliveness-test/%2F",
            self.management_port
        )
    }

    async fn aliveness_status(
        &self,
        endpoint: &ConnectionParameters,
    ) -> Result<String, anyhow::Error> {
        let url = self.aliveness_url(&endpoint.host);
        let response = self
            .client
            .get(&url)
            .basic_auth(
                &endpoint.credentials.username,
                Some(endpoint.credentials.password.expose_secret()),
            )
            .send()
            .await
            .with_context(|| format!("Failed to call the RabbitMq management API at {url}."))?;
        let body: AlivenessResponse = response
            .json()
            .await
            .context("Failed to parse the RabbitMq aliveness check response.")?;
        Ok(body.status)
    }
}

#[async_trait::async_trait]
impl HealthProbe for AlivenessProbe {
    #[tracing::instrument(name = "rabbitmq_aliveness_probe", skip(self, endpoint), fields(host = %endpoint.host))]
    async fn probe(&self, endpoint: &ConnectionParameters) -> ProbeOutcome {
        match self.aliveness_status(endpoint).await {
            Ok(status) => {
                debug!(%status, "RabbitMq aliveness check");
                if status.contains("ok") {
                    ProbeOutcome::Healthy
                } else {
                    ProbeOutcome::Unhealthy
                }
            }
            Err(e) => {
                warn!(error = ?e, "RabbitMq aliveness check failed");
                ProbeOutcome::ProbeError(e)
            }
        }
    }
}
