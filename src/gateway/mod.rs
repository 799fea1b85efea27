//! S3 gateway: the forwarding layer between authenticated callers and the
//! backing object store.
//!
//! Every outbound request is re-signed with the backend root credentials.
//! Bodies are streamed in both directions and never buffered whole. Bucket
//! isolation happens before any call leaves the process: the caller's bucket
//! is derived from their user id and nothing else is reachable.

pub mod xml;

use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::sigv4::{self, SigningCredentials};

/// Deadline for metadata-sized backend calls. Streamed object bodies are not
/// subject to it.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid backend endpoint: {0}")]
    Endpoint(String),
    #[error("Bucket provisioning failed with status {0}")]
    Provision(u16),
    #[error("Backend request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Query parameters forwarded to a bucket listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<u32>,
    pub prefix: Option<String>,
}

pub struct S3Gateway {
    bucket_prefix: String,
    creds: SigningCredentials,
    endpoint: String,
    host: String,
    http: Client,
}

impl S3Gateway {
    pub fn from_config(config: &StorageConfig, http: Client) -> Result<Self, GatewayError> {
        let url =
            Url::parse(&config.endpoint).map_err(|e| GatewayError::Endpoint(e.to_string()))?;
        let host_str = url
            .host_str()
            .ok_or_else(|| GatewayError::Endpoint("endpoint has no host".to_string()))?;
        // `Url::port()` is `None` for the scheme default, matching the Host
        // header reqwest will send.
        let host = match url.port() {
            Some(port) => format!("{host_str}:{port}"),
            None => host_str.to_string(),
        };

        Ok(Self {
            bucket_prefix: config.bucket_prefix.clone(),
            creds: SigningCredentials {
                access_key_id: config.root_user.clone(),
                region: config.region.clone(),
                secret_access_key: config.root_password.clone(),
            },
            endpoint: config.endpoint.clone(),
            host,
            http,
        })
    }

    /// The single bucket this user may touch.
    pub fn bucket_for(&self, user_id: Uuid) -> String {
        format!("{}{}", self.bucket_prefix, user_id)
    }

    fn signed(
        &self,
        method: Method,
        path: &str,
        query: &str,
        payload_hash: Option<&str>,
    ) -> RequestBuilder {
        let url = if query.is_empty() {
            format!("{}{}", self.endpoint, path)
        } else {
            format!("{}{}?{}", self.endpoint, path, query)
        };
        let signature = sigv4::sign_request(
            method.as_str(),
            &self.host,
            path,
            query,
            payload_hash,
            &self.creds,
            Utc::now(),
        );
        self.http
            .request(method, url)
            .header("authorization", signature.authorization)
            .header("x-amz-date", signature.amz_date)
            .header("x-amz-content-sha256", signature.content_sha256)
    }

    // ========================================================================
    // Object operations
    // ========================================================================

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        content_length: Option<u64>,
        body: reqwest::Body,
    ) -> Result<Response, GatewayError> {
        let mut request = self.signed(Method::PUT, &object_path(bucket, key), "", None);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(content_length) = content_length {
            request = request.header(reqwest::header::CONTENT_LENGTH, content_length);
        }
        Ok(request.body(body).send().await?)
    }

    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<String>,
    ) -> Result<Response, GatewayError> {
        let mut request = self.signed(Method::GET, &object_path(bucket, key), "", None);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }
        Ok(request.send().await?)
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<Response, GatewayError> {
        Ok(self
            .signed(Method::HEAD, &object_path(bucket, key), "", None)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?)
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<Response, GatewayError> {
        Ok(self
            .signed(Method::DELETE, &object_path(bucket, key), "", None)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?)
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        params: &ListParams,
    ) -> Result<Response, GatewayError> {
        let mut pairs: Vec<(&str, String)> = vec![("list-type", "2".to_string())];
        if let Some(token) = &params.continuation_token {
            pairs.push(("continuation-token", uri_encode(token)));
        }
        if let Some(delimiter) = &params.delimiter {
            pairs.push(("delimiter", uri_encode(delimiter)));
        }
        if let Some(max_keys) = params.max_keys {
            pairs.push(("max-keys", max_keys.to_string()));
        }
        if let Some(prefix) = &params.prefix {
            pairs.push(("prefix", uri_encode(prefix)));
        }
        pairs.sort();
        let query = pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&");

        Ok(self
            .signed(Method::GET, &format!("/{bucket}"), &query, None)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?)
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Create the bucket if it is missing. A creation race that reports the
    /// bucket as already owned is success.
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<(), GatewayError> {
        let response = self
            .signed(Method::PUT, &format!("/{bucket}"), "", None)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        match response.status().as_u16() {
            200 | 204 | 409 => Ok(()),
            status => Err(GatewayError::Provision(status)),
        }
    }

    /// Best-effort bucket quota via the backend admin API. Failures are
    /// logged and swallowed; quota enforcement never blocks a write.
    pub async fn apply_quota(&self, bucket: &str, quota_bytes: i64) {
        let body = serde_json::json!({ "quota": quota_bytes, "quotatype": "hard" }).to_string();
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));
        let query = format!("bucket={}", uri_encode(bucket));

        let result = self
            .signed(
                Method::PUT,
                "/minio/admin/v3/set-bucket-quota",
                &query,
                Some(&payload_hash),
            )
            .timeout(CONTROL_TIMEOUT)
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(bucket = %bucket, quota_bytes, "Applied bucket quota");
            }
            Ok(response) => {
                tracing::debug!(bucket = %bucket, status = %response.status(), "Bucket quota not applied");
            }
            Err(error) => {
                tracing::debug!(bucket = %bucket, error = %error, "Bucket quota call failed");
            }
        }
    }
}

/// Split a raw request path into `(bucket, key)`. Accepts both `/s3/…` and
/// `/storage/s3/…`; an empty bucket means "the caller's own bucket". The key
/// keeps its original percent-encoding.
pub fn parse_object_path(raw_path: &str) -> Option<(String, String)> {
    let rest = raw_path.strip_prefix("/storage").unwrap_or(raw_path);
    let rest = rest.strip_prefix("/s3")?;
    let rest = match rest.strip_prefix('/') {
        Some(rest) => rest,
        None if rest.is_empty() => "",
        None => return None,
    };
    match rest.split_once('/') {
        Some((bucket, key)) => Some((bucket.to_string(), key.to_string())),
        None => Some((rest.to_string(), String::new())),
    }
}

fn object_path(bucket: &str, key: &str) -> String {
    if key.is_empty() {
        format!("/{bucket}")
    } else {
        format!("/{bucket}/{key}")
    }
}

/// AWS-style percent encoding: everything but unreserved characters.
fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_path_variants() {
        assert_eq!(
            parse_object_path("/s3/user-1/a/b.bin"),
            Some(("user-1".to_string(), "a/b.bin".to_string()))
        );
        assert_eq!(
            parse_object_path("/storage/s3/user-1/a.bin"),
            Some(("user-1".to_string(), "a.bin".to_string()))
        );
        assert_eq!(
            parse_object_path("/s3/user-1"),
            Some(("user-1".to_string(), String::new()))
        );
        assert_eq!(parse_object_path("/s3"), Some((String::new(), String::new())));
        assert_eq!(parse_object_path("/sync/pull"), None);
        assert_eq!(parse_object_path("/s3x/foo"), None);
    }

    #[test]
    fn test_parse_object_path_keeps_encoding() {
        assert_eq!(
            parse_object_path("/s3/user-1/dir/file%20name.bin"),
            Some(("user-1".to_string(), "dir/file%20name.bin".to_string()))
        );
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("abc-123_~.ok"), "abc-123_~.ok");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_object_path() {
        assert_eq!(object_path("b", ""), "/b");
        assert_eq!(object_path("b", "k/x"), "/b/k/x");
    }
}
