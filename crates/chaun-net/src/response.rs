use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};
use mime::Mime;
use url::Url;

use crate::{NetError, RequestId};

/// A response whose body can be read exactly once.
///
/// Storing a response and also returning it needs two owners; call
/// [`Response::duplicate`] first.
#[derive(Debug)]
pub struct Response {
    pub request_id: RequestId,
    /// Final URL, after redirects.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Served from a cache store rather than the network.
    pub from_cache: bool,
    body: Bytes,
}

impl Response {
    pub fn new(request_id: RequestId, url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            request_id,
            url,
            status,
            headers,
            from_cache: false,
            body,
        }
    }

    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    /// 2xx status.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Deep copy with its own body buffer.
    pub fn duplicate(&self) -> Self {
        Self {
            request_id: self.request_id,
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            from_cache: self.from_cache,
            body: Bytes::copy_from_slice(&self.body),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    pub fn text(self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| NetError::RequestFailed(format!("body of {} is not UTF-8: {}", self.url, e)))
    }
}
