use async_trait::async_trait;
use reqwest::{Client, Response};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, FetchError, Result};

/// Raw response of a successful fetch.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Where the response came from once redirects were followed
    pub url: Url,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// An HTML page decoded to text.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Where the page came from once redirects were followed
    pub url: Url,
    pub text: String,
}

/// Retrieves the resources behind URLs.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> std::result::Result<Fetched, FetchError>;

    /// Fetches a page and decodes it. The default treats the body as UTF-8.
    async fn fetch_page(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError> {
        let fetched = self.fetch(url).await?;
        Ok(FetchedPage {
            url: fetched.url,
            text: String::from_utf8_lossy(&fetched.bytes).into_owned(),
        })
    }
}

/// `Fetcher` backed by reqwest, retrying transient failures with exponential backoff.
pub struct HttpFetcher {
    client: Client,
    max_retries: u32,
    backoff: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_retries: u32, backoff: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("bookbind/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| {
                Error::configuration(
                    format!("failed to build HTTP client: {}", e),
                    "check the TLS setup of this machine",
                )
            })?;

        Ok(Self {
            client,
            max_retries,
            backoff,
        })
    }

    async fn send(&self, url: &Url) -> std::result::Result<Response, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| network_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn fetch_once(&self, url: &Url) -> std::result::Result<Fetched, FetchError> {
        let response = self.send(url).await?;
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|e| network_error(url, e))?;

        Ok(Fetched {
            url: final_url,
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    async fn fetch_page_once(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError> {
        let response = self.send(url).await?;
        let final_url = response.url().clone();
        // Decoded by the charset of the Content-Type header, UTF-8 when none is declared
        let text = response.text().await.map_err(|e| network_error(url, e))?;

        Ok(FetchedPage {
            url: final_url,
            text,
        })
    }

    async fn with_retries<T, F, Fut>(&self, url: &Url, attempt_once: F) -> std::result::Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            match attempt_once().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff * 2u32.pow(attempt);
                    attempt += 1;
                    warn!("{}; retry {}/{} in {:?}", e, attempt, self.max_retries, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!("Giving up on {}", url);
                    return Err(e);
                }
            }
        }
    }
}

fn network_error(url: &Url, e: reqwest::Error) -> FetchError {
    FetchError::Network {
        url: url.to_string(),
        message: if e.is_timeout() {
            "request timed out".to_string()
        } else if e.is_connect() {
            "connection failed".to_string()
        } else {
            e.to_string()
        },
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> std::result::Result<Fetched, FetchError> {
        let fetched = self.with_retries(url, || self.fetch_once(url)).await?;
        debug!("Fetched {} ({} bytes)", url, fetched.bytes.len());
        Ok(fetched)
    }

    async fn fetch_page(&self, url: &Url) -> std::result::Result<FetchedPage, FetchError> {
        let page = self.with_retries(url, || self.fetch_page_once(url)).await?;
        if page.url != *url {
            debug!("{} redirected to {}", url, page.url);
        }
        debug!("Fetched page {} ({} chars)", url, page.text.len());
        Ok(page)
    }
}
