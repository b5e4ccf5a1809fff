//! Direct per-service health probes for fan-out polling

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::domain::ServiceDescriptor;
use crate::error::{OpsdeckError, Result};

/// Some backends sit behind bot filters that reject non-browser agents
const PROBE_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// `Ok` means the service answered healthy. Timeouts are applied by the caller.
    async fn probe(&self, descriptor: &ServiceDescriptor, url: &Url) -> Result<()>;
}

/// Plain `GET`, any 2xx is up
#[derive(Clone)]
pub struct HttpProbe {
    http: Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(PROBE_USER_AGENT)
            .build()
            .map_err(|e| OpsdeckError::Internal(format!("failed to build probe client: {}", e)))?;
        Ok(Self { http })
    }

    /// Uptime Kuma only answers health on its status API
    pub fn target(descriptor: &ServiceDescriptor, url: &Url) -> Url {
        let name = descriptor.name.to_lowercase().replace(' ', "");
        if name.contains("uptimekuma") {
            let mut target = url.clone();
            if let Ok(mut path) = target.path_segments_mut() {
                path.pop_if_empty().extend(["api", "status"]);
            }
            target
        } else {
            url.clone()
        }
    }
}

#[async_trait]
impl ServiceProbe for HttpProbe {
    async fn probe(&self, descriptor: &ServiceDescriptor, url: &Url) -> Result<()> {
        let target = Self::target(descriptor, url);
        let resp = self.http.get(target.clone()).send().await?;
        let status = resp.status();
        if status.is_success() {
            debug!("{} is up ({})", descriptor.name, status);
            Ok(())
        } else {
            Err(OpsdeckError::Transport(format!(
                "{} answered {} at {}",
                descriptor.name, status, target
            )))
        }
    }
}
