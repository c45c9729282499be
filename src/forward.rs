//! Forwarding client for the leader's REST surface.
//!
//! Followers execute no mutations themselves; every write is forwarded to
//! the current leader with the caller's headers attached. Transport failures
//! surface as `RequestForwarding`; structured errors returned by the leader
//! are propagated with their HTTP status and error code intact.

use crate::election::RegistryIdentity;
use crate::error::{error_codes, RegistryError, RegistryResult};
use crate::store::ConfigValue;
use crate::types::{Mode, SchemaInput};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error_code: u32,
    #[serde(default)]
    message: String,
}

/// HTTP client bound to one leader identity
pub struct LeaderClient {
    base_url: String,
    http: reqwest::Client,
}

impl LeaderClient {
    pub fn new(
        leader: &RegistryIdentity,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> RegistryResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()))?;
        Ok(Self {
            base_url: leader.url(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register_schema(
        &self,
        headers: &HashMap<String, String>,
        subject: &str,
        input: &SchemaInput,
        normalize: bool,
    ) -> RegistryResult<u32> {
        let url = format!(
            "{}/subjects/{}/versions?normalize={}",
            self.base_url, subject, normalize
        );
        debug!(url = %url, "Forwarding register request to the leader");
        let response = self
            .http
            .post(&url)
            .headers(to_header_map(headers))
            .json(input)
            .send()
            .await
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()))?;
        let parsed: RegisterResponse = decode(response).await?;
        Ok(parsed.id)
    }

    pub async fn update_config(
        &self,
        headers: &HashMap<String, String>,
        subject: Option<&str>,
        config: &ConfigValue,
    ) -> RegistryResult<()> {
        let url = match subject {
            Some(s) => format!("{}/config/{}", self.base_url, s),
            None => format!("{}/config", self.base_url),
        };
        let response = self
            .http
            .put(&url)
            .headers(to_header_map(headers))
            .json(config)
            .send()
            .await
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()))?;
        check(response).await
    }

    pub async fn delete_config(
        &self,
        headers: &HashMap<String, String>,
        subject: Option<&str>,
    ) -> RegistryResult<()> {
        let url = match subject {
            Some(s) => format!("{}/config/{}", self.base_url, s),
            None => format!("{}/config", self.base_url),
        };
        let response = self
            .http
            .delete(&url)
            .headers(to_header_map(headers))
            .send()
            .await
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()))?;
        check(response).await
    }

    pub async fn delete_schema_version(
        &self,
        headers: &HashMap<String, String>,
        subject: &str,
        version: u32,
        permanent: bool,
    ) -> RegistryResult<()> {
        let url = format!(
            "{}/subjects/{}/versions/{}?permanent={}",
            self.base_url, subject, version, permanent
        );
        let response = self
            .http
            .delete(&url)
            .headers(to_header_map(headers))
            .send()
            .await
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()))?;
        check(response).await
    }

    pub async fn delete_subject(
        &self,
        headers: &HashMap<String, String>,
        subject: &str,
        permanent: bool,
    ) -> RegistryResult<Vec<u32>> {
        let url = format!(
            "{}/subjects/{}?permanent={}",
            self.base_url, subject, permanent
        );
        let response = self
            .http
            .delete(&url)
            .headers(to_header_map(headers))
            .send()
            .await
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()))?;
        decode(response).await
    }

    pub async fn set_mode(
        &self,
        headers: &HashMap<String, String>,
        subject: Option<&str>,
        mode: Mode,
        force: bool,
    ) -> RegistryResult<()> {
        let url = match subject {
            Some(s) => format!("{}/mode/{}?force={}", self.base_url, s, force),
            None => format!("{}/mode?force={}", self.base_url, force),
        };
        let body = serde_json::json!({ "mode": mode.to_string() });
        let response = self
            .http
            .put(&url)
            .headers(to_header_map(headers))
            .json(&body)
            .send()
            .await
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()))?;
        check(response).await
    }

    pub async fn delete_subject_mode(
        &self,
        headers: &HashMap<String, String>,
        subject: &str,
    ) -> RegistryResult<()> {
        let url = format!("{}/mode/{}", self.base_url, subject);
        let response = self
            .http
            .delete(&url)
            .headers(to_header_map(headers))
            .send()
            .await
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()))?;
        check(response).await
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(v),
        ) {
            map.insert(name, value);
        }
    }
    map
}

async fn check(response: reqwest::Response) -> RegistryResult<()> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(into_rest_error(response).await)
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> RegistryResult<T> {
    if response.status().is_success() {
        return response
            .json()
            .await
            .map_err(|e| RegistryError::RequestForwarding(e.to_string()));
    }
    Err(into_rest_error(response).await)
}

async fn into_rest_error(response: reqwest::Response) -> RegistryError {
    let status = response.status().as_u16();
    match response.json::<ErrorResponse>().await {
        Ok(body) => RegistryError::Rest {
            status,
            code: if body.error_code != 0 {
                body.error_code
            } else {
                error_codes::INTERNAL_ERROR
            },
            message: body.message,
        },
        Err(e) => RegistryError::RequestForwarding(format!(
            "Leader answered {} with an undecodable body: {}",
            status, e
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_conversion() {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), "Bearer token".to_string());
        headers.insert("x-request-id".to_string(), "abc-123".to_string());
        headers.insert("bad header".to_string(), "dropped".to_string());

        let map = to_header_map(&headers);
        assert_eq!(map.get("authorization").unwrap(), "Bearer token");
        assert_eq!(map.get("x-request-id").unwrap(), "abc-123");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_client_builds_base_url() {
        let identity = RegistryIdentity::new("http", "leader-host", 8081);
        let client = LeaderClient::new(
            &identity,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.base_url(), "http://leader-host:8081");
    }
}
