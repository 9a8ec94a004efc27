use std::time::Duration;

use page_analyzer_core::FetchError;
use reqwest::Client;

/// HTTP client settings for page checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Overall request timeout; `None` keeps the client default.
    pub timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: concat!("page-analyzer/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Raw result of a single GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

/// Issues exactly one GET per check. No retries.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: Client,
}

impl PageFetcher {
    /// # Errors
    /// Returns [`FetchError::Client`] when the HTTP client cannot be built.
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self { client })
    }

    /// Fetch `target` and return its status and body.
    ///
    /// Any HTTP status, 4xx and 5xx included, counts as a successful fetch.
    /// The body is decoded with the `Content-Type` charset, UTF-8 when absent.
    ///
    /// # Errors
    /// Returns a [`FetchError`] for transport failures: DNS, refused
    /// connections, TLS, timeouts, or an unreadable body.
    pub async fn fetch(&self, target: &str) -> Result<FetchedPage, FetchError> {
        let response =
            self.client.get(target).send().await.map_err(|err| request_error(target, &err))?;
        let status = response.status().as_u16();

        let body = response.text().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout { url: target.to_string() }
            } else {
                FetchError::Body { url: target.to_string(), message: err.to_string() }
            }
        })?;

        Ok(FetchedPage { status, body })
    }
}

fn request_error(target: &str, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout { url: target.to_string() }
    } else if err.is_connect() {
        FetchError::Connect { url: target.to_string(), message: err.to_string() }
    } else {
        FetchError::Request { url: target.to_string(), message: err.to_string() }
    }
}
