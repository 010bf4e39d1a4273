use std::time::Duration;

use reqwest::{header, Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use super::{RemoteApi, RemoteError};
use crate::models::{EntityId, ListFilter, RemoteRecord};

/// `RemoteApi` over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    device_id: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        device_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let base_url =
            Url::parse(base_url).map_err(|e| RemoteError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            device_id: device_id.into(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn if_match(builder: RequestBuilder, expected_version: Option<u64>) -> RequestBuilder {
        match expected_version {
            Some(version) => builder.header(header::IF_MATCH, format!("\"{}\"", version)),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                debug!(error = %e, "Request did not reach the API host");
            }
            RemoteError::from(e)
        })?;

        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
        let url = response.url().clone();
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", url.path(), e)))
    }
}

impl RemoteApi for HttpRemote {
    async fn fetch(&self, collection: &str, id: &EntityId) -> Result<RemoteRecord, RemoteError> {
        let url = self.url(&[collection, id.as_str()])?;
        let response = Self::send(self.request(Method::GET, url)).await?;
        Self::parse(response).await
    }

    async fn list(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let url = self.url(&[collection])?;
        let query: Vec<(&str, &str)> = filter.iter().collect();
        let response = Self::send(self.request(Method::GET, url).query(&query)).await?;
        Self::parse(response).await
    }

    async fn create(
        &self,
        collection: &str,
        client_id: &str,
        data: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        let url = self.url(&[collection])?;
        let builder = self
            .request(Method::POST, url)
            .header("Idempotency-Key", format!("{}/{}", self.device_id, client_id))
            .json(&json!({ "clientId": client_id, "data": data }));

        match Self::send(builder).await {
            Ok(response) => Self::parse(response).await,
            // A duplicate answers with the record created the first time
            Err(RemoteError::Conflict {
                current: Some(record),
            }) => Err(RemoteError::AlreadyExists(record)),
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        collection: &str,
        id: &EntityId,
        patch: &Value,
        expected_version: Option<u64>,
    ) -> Result<RemoteRecord, RemoteError> {
        let url = self.url(&[collection, id.as_str()])?;
        let builder = Self::if_match(self.request(Method::PATCH, url), expected_version)
            .header(header::CONTENT_TYPE, "application/merge-patch+json")
            .body(patch.to_string());
        let response = Self::send(builder).await?;
        Self::parse(response).await
    }

    async fn delete(
        &self,
        collection: &str,
        id: &EntityId,
        expected_version: Option<u64>,
    ) -> Result<(), RemoteError> {
        let url = self.url(&[collection, id.as_str()])?;
        Self::send(Self::if_match(self.request(Method::DELETE, url), expected_version)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let response = self
            .request(Method::HEAD, self.base_url.clone())
            .send()
            .await
            .map_err(|_| RemoteError::Unreachable)?;
        // Any answer short of a server failure means the host is there
        if response.status().is_server_error() {
            return Err(RemoteError::ServerError(response.status().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_and_escapes_segments() {
        let remote =
            HttpRemote::new("https://api.example.com/v1/", "dev", Duration::from_secs(5)).unwrap();
        let url = remote.url(&["batches", "42"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/batches/42");

        let url = remote.url(&["cubeTests", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/cubeTests/a%2Fb");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(
            HttpRemote::new("not a url", "dev", Duration::from_secs(5)),
            Err(RemoteError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpRemote::new("mailto:ops@example.com", "dev", Duration::from_secs(5)),
            Err(RemoteError::InvalidUrl(_))
        ));
    }
}
