//! HTTP fetches: watch-page HTML for metadata scraping, the status API
//! fallback probe, and thumbnail downloads.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::metadata::PageFetch;
use crate::probe::{FallbackProbe, FallbackStatus};
use crate::session::ByteFetch;

/// Upper bound on buffered response bodies (thumbnails are small).
const MAX_FETCH_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
    user_agent: String,
    cookies: Option<String>,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, cookies: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        Self {
            agent,
            user_agent: user_agent.to_string(),
            cookies,
        }
    }

    fn request(&self, url: &str) -> ureq::Request {
        let mut req = self.agent.get(url).set("User-Agent", &self.user_agent);
        if let Some(cookies) = &self.cookies {
            req = req.set("Cookie", cookies);
        }
        req
    }
}

impl PageFetch for HttpFetcher {
    fn get(&self, url: &str) -> Result<String> {
        debug!(url, "fetching page");
        let body = self
            .request(url)
            .call()
            .with_context(|| format!("GET {} failed", url))?
            .into_string()
            .context("response body was not valid text")?;
        Ok(body)
    }
}

impl ByteFetch for HttpFetcher {
    fn get(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "fetching bytes");
        let response = self
            .request(url)
            .call()
            .with_context(|| format!("GET {} failed", url))?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_FETCH_BYTES)
            .read_to_end(&mut bytes)
            .context("failed to read response body")?;
        Ok(bytes)
    }
}

/// Fallback liveness probe over a JSON status endpoint.
///
/// The endpoint is derived from the watch-page URL; its payload maps
/// straight onto [`FallbackStatus`].
pub struct StatusApiProbe {
    http: HttpFetcher,
}

impl StatusApiProbe {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }

    fn status_url(target_url: &str) -> String {
        format!("{}/api/status", target_url.trim_end_matches('/'))
    }
}

impl FallbackProbe for StatusApiProbe {
    fn status(&self, target_url: &str) -> Result<FallbackStatus> {
        let url = Self::status_url(target_url);
        debug!(url, "fetching status api");
        let body = PageFetch::get(&self.http, &url)?;
        let status: FallbackStatus =
            serde_json::from_str(&body).context("status api returned unparseable JSON")?;
        Ok(status)
    }
}
