// Melodown - Music Player & Downloader
// Copyright (C) 2025 Melodown contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Resource resolution
//!
//! Translates (resource id, quality) into a fetchable URL plus quality
//! metadata via the remote lookup API. The lookup service is treated as
//! untrusted: transport failures are retried a bounded number of times with
//! a fixed delay, explicit application-level refusals are surfaced
//! immediately and never retried.

use async_trait::async_trait;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::download::task::Quality;
use crate::error::{MelodownError, Result};

/// A resolved, fetchable source for one task
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    /// Direct CDN URL for the audio payload
    pub url: String,
    /// Quality the server will actually serve
    pub actual_quality: Quality,
    /// Total payload size in bytes, 0 if the server did not say
    pub total_bytes: u64,
    /// True when the server substituted a lower quality than requested
    pub downgraded: bool,
}

/// Translates (resource, quality) into a [`ResolvedSource`]
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, resource_id: &str, quality: Quality) -> Result<ResolvedSource>;
}

/// Wire shape of the lookup API response
#[derive(Debug, Clone, Deserialize)]
struct LookupResponse {
    url: Option<String>,
    quality: Option<String>,
    size: Option<u64>,
    #[serde(default)]
    downgraded: bool,
    message: Option<String>,
}

impl LookupResponse {
    /// Fold the wire response into a [`ResolvedSource`].
    ///
    /// A missing URL or a server-provided message is an application-level
    /// refusal, not a transport problem.
    fn into_source(self, requested: Quality) -> Result<ResolvedSource> {
        let url = match (self.url, self.message) {
            (Some(url), _) if !url.is_empty() => url,
            (_, Some(message)) if !message.is_empty() => {
                return Err(MelodownError::ResourceUnavailable { message });
            }
            _ => {
                return Err(MelodownError::ResourceUnavailable {
                    message: format!("no source available at quality {}", requested),
                });
            }
        };

        let actual_quality = match self.quality.as_deref() {
            Some(s) => Quality::from_str(s)
                .map_err(|_| MelodownError::InvalidLookupResponse(format!("quality {s:?}")))?,
            None => requested,
        };

        Ok(ResolvedSource {
            url,
            actual_quality,
            total_bytes: self.size.unwrap_or(0),
            downgraded: self.downgraded || actual_quality != requested,
        })
    }
}

/// [`ResourceResolver`] backed by the remote lookup API
pub struct HttpResolver {
    client: reqwest::Client,
    base_url: Url,
    /// Opaque credential forwarded as a Cookie header; acquisition is the
    /// embedder's concern
    credential: Option<String>,
    retries: u32,
    retry_delay: Duration,
}

impl HttpResolver {
    pub fn new(
        base_url: Url,
        credential: Option<String>,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            base_url,
            credential,
            retries,
            retry_delay,
        })
    }

    async fn fetch(&self, resource_id: &str, quality: Quality) -> Result<LookupResponse> {
        let mut url = self.base_url.join("resolve").map_err(|e| {
            MelodownError::InvalidLookupResponse(format!("bad lookup endpoint: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("id", resource_id)
            .append_pair("quality", quality.as_str());

        let mut request = self.client.get(url);
        if let Some(ref credential) = self.credential {
            request = request.header(reqwest::header::COOKIE, credential);
        }

        let response = request.send().await.map_err(|e| {
            MelodownError::network(format!("lookup request failed: {e}"), true)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MelodownError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }

        let body: LookupResponse = response.json().await.map_err(|e| {
            MelodownError::InvalidLookupResponse(format!("malformed lookup body: {e}"))
        })?;

        Ok(body)
    }
}

#[async_trait]
impl ResourceResolver for HttpResolver {
    async fn resolve(&self, resource_id: &str, quality: Quality) -> Result<ResolvedSource> {
        let mut attempt = 0u32;
        loop {
            match self.fetch(resource_id, quality).await {
                Ok(body) => {
                    let source = body.into_source(quality)?;
                    debug!(
                        resource_id,
                        actual = %source.actual_quality,
                        downgraded = source.downgraded,
                        "resolved source"
                    );
                    return Ok(source);
                }
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        resource_id,
                        attempt,
                        error = %e,
                        "transient lookup failure, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
