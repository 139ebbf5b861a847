//! HTTP destination
//!
//! Uses synchronous HTTP (ureq) so writes run directly on worker threads.

use std::time::Duration;

use anyhow::{Context, Result, ensure};
use log::debug;

use super::{DestinationConnector, WritePayload, WriteTarget, destination_url};
use crate::models::{JsonMap, RequestMethod};

/// Writes chunks as JSON to a configured URL
pub struct HttpDestination {
    agent: ureq::Agent,
}

impl HttpDestination {
    /// Create a destination whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl DestinationConnector for HttpDestination {
    fn check(&self, configuration: &JsonMap) -> Result<()> {
        let url = destination_url(configuration)?;

        let response = self
            .agent
            .options(url)
            .call()
            .with_context(|| format!("Connection check to {url} failed"))?;

        ensure!(
            response.status().is_success(),
            "Connection check to {} returned {}",
            url,
            response.status()
        );
        Ok(())
    }

    fn write(&self, target: &WriteTarget, payload: &WritePayload) -> Result<()> {
        let request = match target.method {
            RequestMethod::Post => self.agent.post(&target.url),
            RequestMethod::Put => self.agent.put(&target.url),
            RequestMethod::Patch => self.agent.patch(&target.url),
        };

        let response = request
            .header("Accept", "application/json")
            .send_json(payload)
            .with_context(|| format!("{} {} failed", target.method.as_str(), target.url))?;

        let status = response.status();
        ensure!(
            status.is_success(),
            "{} {} returned {}",
            target.method.as_str(),
            target.url,
            status
        );

        debug!("Wrote {} records to {}", payload.len(), target.url);
        Ok(())
    }
}
