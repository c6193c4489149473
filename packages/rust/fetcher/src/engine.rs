//! Concurrent page fetcher.
//!
//! Each URL is fetched by its own task behind a semaphore of
//! `min(N, max_workers)` permits. Handles are awaited in input order, so the
//! output lines up with the input no matter which task finishes first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Client, Response};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::{Host, Url};

use genie_shared::{FetchConfig, FetchError, Page};

use crate::decode::{charset_from_content_type, clean_markup, decode_body};
use crate::guard::resolve_target;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// SafeFetcher
// ---------------------------------------------------------------------------

/// Fetches sample pages with SSRF protection and charset normalization.
#[derive(Debug, Clone)]
pub struct SafeFetcher {
    config: Arc<FetchConfig>,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_private: bool,
}

impl SafeFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            config: Arc::new(config),
            allow_private: false,
        }
    }

    /// Allow fetching from localhost/private IPs (for tests against mock servers).
    pub fn allow_private_networks(mut self) -> Self {
        self.allow_private = true;
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch every URL. The result has one [`Page`] per input URL, in input
    /// order; failures are recorded on the page and never abort the batch.
    #[instrument(skip_all, fields(urls = urls.len()))]
    pub async fn fetch_all(&self, urls: &[String]) -> Vec<Page> {
        if urls.is_empty() {
            return Vec::new();
        }

        let start = Instant::now();
        let workers = urls.len().min(self.config.max_workers).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        info!(workers, "fetching pages");

        let handles: Vec<_> = urls
            .iter()
            .map(|url| {
                let fetcher = self.clone();
                let sem = semaphore.clone();
                let url = url.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = sem.acquire_owned().await else {
                        return Page::failed(
                            url,
                            FetchError::Network {
                                message: "worker pool closed".into(),
                            },
                        );
                    };
                    fetcher.fetch_one(&url).await
                })
            })
            .collect();

        let mut pages = Vec::with_capacity(urls.len());
        for (url, handle) in urls.iter().zip(handles) {
            let page = handle.await.unwrap_or_else(|e| {
                Page::failed(
                    url.clone(),
                    FetchError::Network {
                        message: format!("fetch task failed: {e}"),
                    },
                )
            });
            pages.push(page);
        }

        let fetched = pages.iter().filter(|page| page.is_fetched()).count();
        info!(
            fetched,
            failed = pages.len() - fetched,
            duration_ms = start.elapsed().as_millis(),
            "fetch completed"
        );
        pages
    }

    /// Fetch a single URL into a [`Page`].
    #[instrument(skip(self))]
    pub async fn fetch_one(&self, url: &str) -> Page {
        match self.fetch_markup(url).await {
            Ok(markup) => {
                debug!(chars = markup.len(), "page fetched");
                Page::fetched(url, markup)
            }
            Err(error) => {
                warn!(%error, "page fetch failed");
                Page::failed(url, error)
            }
        }
    }

    async fn fetch_markup(&self, raw: &str) -> Result<String, FetchError> {
        let mut url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl {
            message: format!("{raw}: {e}"),
        })?;
        let mut hops = 0;

        // Redirects are followed by hand so every hop goes through the guard.
        let response = loop {
            let addrs = resolve_target(&url, self.allow_private, self.config.timeout).await?;
            let client = self.client_for(&url, &addrs)?;
            let response = client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| self.transport_error(&e))?;

            let status = response.status();
            if !status.is_redirection() {
                break response;
            }

            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                });
            };

            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(FetchError::Network {
                    message: format!("more than {MAX_REDIRECTS} redirects"),
                });
            }
            url = url.join(location).map_err(|e| FetchError::InvalidUrl {
                message: format!("redirect target {location}: {e}"),
            })?;
            debug!(%url, hops, "following redirect");
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let charset = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(charset_from_content_type);

        let (body, truncated) = self.read_body(response).await?;
        if body.is_empty() {
            return Err(FetchError::Decode {
                message: "empty response body".into(),
            });
        }
        if truncated {
            debug!(cap = self.config.max_body_bytes, "body truncated");
        }

        let text = decode_body(&body, charset.as_deref(), truncated);
        Ok(clean_markup(&text))
    }

    /// A client that connects only to `addrs` for this URL's host.
    fn client_for(&self, url: &Url, addrs: &[SocketAddr]) -> Result<Client, FetchError> {
        let mut builder = Client::builder()
            .user_agent(self.config.user_agent.as_str())
            .timeout(self.config.timeout)
            .redirect(reqwest::redirect::Policy::none());
        if let Some(Host::Domain(domain)) = url.host() {
            builder = builder.resolve_to_addrs(domain, addrs);
        }
        builder.build().map_err(|e| FetchError::Network {
            message: format!("failed to build HTTP client: {e}"),
        })
    }

    /// Read at most `max_body_bytes`. Returns the bytes and whether the body
    /// was cut short.
    async fn read_body(&self, mut response: Response) -> Result<(Vec<u8>, bool), FetchError> {
        let cap = self.config.max_body_bytes;
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.transport_error(&e))?
        {
            let room = cap - body.len();
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                return Ok((body, true));
            }
            body.extend_from_slice(&chunk);
        }
        Ok((body, false))
    }

    fn transport_error(&self, e: &reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                secs: self.config.timeout.as_secs(),
            }
        } else {
            FetchError::Network {
                message: e.to_string(),
            }
        }
    }
}
