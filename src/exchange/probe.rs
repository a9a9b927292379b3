//! General internet connectivity probe.
//!
//! A stale socket can mean either a venue-side outage or a local one. The
//! stream manager only reconnects once this probe confirms the outage is not
//! local, which avoids reconnect storms while the machine itself is offline.

use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const DEFAULT_PROBE_URL: &str = "https://www.google.com";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ConnectivityProbe {
    http: Client,
    url: String,
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_URL)
    }
}

impl ConnectivityProbe {
    pub fn new(url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: url.into(),
        }
    }

    /// HEAD request to a well-known host; any response means we are online.
    pub async fn is_online(&self) -> bool {
        match self.http.head(&self.url).send().await {
            Ok(response) => {
                debug!(status = %response.status(), "Connectivity probe succeeded");
                true
            }
            Err(e) => {
                debug!(error = %e, "Connectivity probe failed");
                false
            }
        }
    }
}
