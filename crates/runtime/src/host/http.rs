//! Outbound HTTP behind the `http` capability.
//!
//! Plugins may only reach hosts on the configured allowlist. An empty
//! allowlist denies every request.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::script::CapabilityViolation;

/// Maximum response body retained for plugin code.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Hosts plugins may call. Entries are exact host names, or `*.example.com`
/// to admit every subdomain of `example.com` (but not the apex).
#[derive(Debug, Clone, Default)]
pub struct HostAllowlist {
    entries: Vec<String>,
}

impl HostAllowlist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.as_ref().trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn admits(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.entries.iter().any(|entry| match entry.strip_prefix("*.") {
            Some(domain) => host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1),
            None => *entry == host,
        })
    }

    /// Parse `raw` and check it against the allowlist.
    pub fn check(&self, raw: &str) -> Result<Url, CapabilityViolation> {
        let url = Url::parse(raw)
            .map_err(|e| CapabilityViolation::new("http", format!("invalid URL '{raw}': {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(CapabilityViolation::new(
                "http",
                format!("scheme '{}' is not allowed", url.scheme()),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CapabilityViolation::new("http", format!("URL '{raw}' has no host")))?;
        if !self.admits(host) {
            return Err(CapabilityViolation::new(
                "http",
                format!("host '{host}' is not on the allowlist"),
            ));
        }
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundMethod {
    Get,
    Post,
}

/// A request that already passed the allowlist.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: OutboundMethod,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub status: u16,
    /// Parsed JSON when the body is JSON, otherwise the text.
    pub body: Value,
}

impl OutboundResponse {
    pub fn into_value(self) -> Value {
        serde_json::json!({ "status": self.status, "body": self.body })
    }
}

/// Transport for allowlisted requests.
#[async_trait]
pub trait OutboundHttp: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse>;
}

/// `reqwest` transport. Redirects are not followed, so a permitted host
/// cannot bounce a request to one outside the allowlist.
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("bazaar-plugin-runtime/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build outbound HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OutboundHttp for ReqwestHttp {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        let mut builder = match request.method {
            OutboundMethod::Get => self.client.get(request.url.clone()),
            OutboundMethod::Post => self.client.post(request.url.clone()),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {} failed", request.url))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read response from {}", request.url))?;
        let bytes = &bytes[..bytes.len().min(MAX_RESPONSE_BYTES)];

        let body = serde_json::from_slice(bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()));

        Ok(OutboundResponse { status, body })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_denies_everything() {
        let list = HostAllowlist::default();
        let err = list.check("https://api.example.com/v1").unwrap_err();
        assert!(err.reason.contains("not on the allowlist"));
    }

    #[test]
    fn exact_hosts_match_case_insensitively() {
        let list = HostAllowlist::new(["API.example.com"]);
        assert!(list.check("https://api.example.com/v1").is_ok());
        assert!(list.check("https://example.com/").is_err());
        assert!(list.check("https://api.example.com.evil.net/").is_err());
    }

    #[test]
    fn wildcard_admits_subdomains_only() {
        let list = HostAllowlist::new(["*.shipping.test"]);
        assert!(list.check("https://rates.shipping.test/quote").is_ok());
        assert!(list.check("https://shipping.test/").is_err());
        assert!(list.check("https://evilshipping.test/").is_err());
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let list = HostAllowlist::new(["localhost"]);
        assert!(list.check("file:///etc/passwd").is_err());
        assert!(list.check("not a url").is_err());
    }
}
