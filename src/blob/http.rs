//! HTTP blob store
//!
//! Talks to any blob endpoint that serves `GET`/`PUT` on
//! `{endpoint}/{container}/{blob}` and honours `ETag`, `If-Match` and
//! `If-None-Match: *`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};

use super::{BlobLocation, BlobStore, StoredBlob, WriteCondition, WriteOutcome};
use crate::error::{Error, Result};

/// Blob store reached over HTTP(S)
#[derive(Clone)]
pub struct HttpBlobStore {
    client: Client,
    use_https: bool,
}

impl HttpBlobStore {
    pub fn new(use_https: bool) -> Self {
        Self {
            client: Client::new(),
            use_https,
        }
    }

    fn request(&self, method: reqwest::Method, location: &BlobLocation) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, location.url(self.use_https));
        match &location.credential {
            Some(credential) => builder.bearer_auth(credential),
            None => builder,
        }
    }
}

fn etag_of(response: &reqwest::Response, location: &BlobLocation) -> Result<String> {
    response
        .headers()
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::Storage {
            location: location.to_string(),
            reason: "response carries no ETag".to_string(),
        })
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn read(&self, location: &BlobLocation) -> Result<Option<StoredBlob>> {
        let response = self.request(reqwest::Method::GET, location).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let etag = etag_of(&response, location)?;
                let bytes = response.bytes().await?;
                Ok(Some(StoredBlob { bytes, etag }))
            }
            status => Err(Error::Storage {
                location: location.to_string(),
                reason: format!("read failed with status {}", status),
            }),
        }
    }

    async fn write(
        &self,
        location: &BlobLocation,
        bytes: Bytes,
        condition: WriteCondition,
    ) -> Result<WriteOutcome> {
        let mut request = self
            .request(reqwest::Method::PUT, location)
            .header(header::CONTENT_TYPE, "application/json")
            .body(bytes);

        request = match condition {
            WriteCondition::IfMatch(etag) => request.header(header::IF_MATCH, etag),
            WriteCondition::IfAbsent => request.header(header::IF_NONE_MATCH, "*"),
        };

        let response = request.send().await?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => Ok(WriteOutcome::Conflict),
            status if status.is_success() => {
                let etag = etag_of(&response, location)?;
                Ok(WriteOutcome::Accepted(etag))
            }
            status => Err(Error::Storage {
                location: location.to_string(),
                reason: format!("write failed with status {}", status),
            }),
        }
    }
}
