//! `reqwest`-backed network access.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::future::BoxFuture;
use reqwest::{redirect, Client};
use tracing::{debug, info, trace};

use crate::{Fetcher, NetError, Request, Response};

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub user_agent: String,
    /// Applied when a request has no timeout of its own; `None` waits forever.
    pub default_timeout: Option<Duration>,
    pub max_redirects: usize,
    /// Refuse bodies larger than this.
    pub max_body_bytes: Option<usize>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("chaun-worker/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: None,
            max_redirects: 10,
            max_body_bytes: None,
        }
    }
}

/// Fetches requests over HTTP(S).
#[derive(Debug)]
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .build()?;

        info!(
            user_agent = %config.user_agent,
            timeout = ?config.default_timeout,
            "Resource loader ready"
        );
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Send `request` and read the whole body.
    ///
    /// Any HTTP status is a successful load; only transport failures are errors.
    pub async fn load(&self, request: Request) -> Result<Response, NetError> {
        if !request.is_http() {
            return Err(NetError::InvalidUrl(format!(
                "cannot fetch '{}' scheme: {}",
                request.url.scheme(),
                request.url
            )));
        }

        let timeout = request.timeout.or(self.config.default_timeout);
        let started = Instant::now();
        trace!(url = %request.url, method = %request.method, ?timeout, "Sending request");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let mut response = builder.send().await.map_err(|e| classify(e, timeout))?;
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let limit = self.config.max_body_bytes;
        if let (Some(limit), Some(declared)) = (limit, response.content_length()) {
            if declared > limit as u64 {
                return Err(NetError::BodyTooLarge {
                    url: url.to_string(),
                    limit,
                });
            }
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(e, timeout))? {
            if let Some(limit) = limit {
                if body.len() + chunk.len() > limit {
                    return Err(NetError::BodyTooLarge {
                        url: url.to_string(),
                        limit,
                    });
                }
            }
            body.extend_from_slice(&chunk);
        }

        debug!(
            url = %url,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched"
        );
        Ok(Response::new(request.id, url, status, headers, body.freeze()))
    }
}

impl Fetcher for ResourceLoader {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.load(request))
    }
}

fn classify(error: reqwest::Error, timeout: Option<Duration>) -> NetError {
    match timeout {
        Some(t) if error.is_timeout() => NetError::Timeout(t),
        _ => NetError::HttpError(error),
    }
}
