//! Client for the external identity provider.
//!
//! The server never issues or parses tokens itself: a bearer token is opaque
//! and resolves to a user id (or doesn't) through this client. Login and
//! refresh are forwarded verbatim; admin user creation authenticates with the
//! process service key.

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::AuthConfig;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("User already exists")]
    AlreadyExists,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Identity provider returned status {0}")]
    Status(u16),
    #[error("Invalid or expired token")]
    Unauthorized,
    #[error("Identity provider unreachable: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// The provider's view of a user.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderUser {
    #[serde(default)]
    pub email: Option<String>,
    pub id: Uuid,
}

/// A token pair as issued by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub expires_in: i64,
    pub refresh_token: String,
    pub user: ProviderUser,
}

#[derive(Clone)]
pub struct IdentityClient {
    base_url: String,
    http: reqwest::Client,
    service_key: String,
}

impl IdentityClient {
    pub fn new(config: &AuthConfig, http: reqwest::Client) -> Self {
        Self {
            base_url: config.provider_url.clone(),
            http,
            service_key: config.service_key.clone(),
        }
    }

    /// Resolve a bearer token to its user. 401/403 from the provider means
    /// the token is invalid or expired.
    pub async fn resolve_token(&self, token: &str) -> Result<ProviderUser, IdentityError> {
        let response = self
            .http
            .get(format!("{}/user", self.base_url))
            .bearer_auth(token)
            .header("apikey", &self.service_key)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            401 | 403 => Err(IdentityError::Unauthorized),
            status => Err(IdentityError::Status(status)),
        }
    }

    pub async fn password_login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<TokenBundle, IdentityError> {
        let response = self
            .http
            .post(format!("{}/token?grant_type=password", self.base_url))
            .header("apikey", &self.service_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            400 | 401 | 403 => Err(IdentityError::InvalidCredentials),
            status => Err(IdentityError::Status(status)),
        }
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, IdentityError> {
        let response = self
            .http
            .post(format!("{}/token?grant_type=refresh_token", self.base_url))
            .header("apikey", &self.service_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            400 | 401 | 403 => Err(IdentityError::InvalidCredentials),
            status => Err(IdentityError::Status(status)),
        }
    }

    /// Create a user through the provider's admin surface.
    pub async fn create_user(
        &self,
        email: &str,
        password: &str,
    ) -> Result<ProviderUser, IdentityError> {
        let response = self
            .http
            .post(format!("{}/admin/users", self.base_url))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "email_confirm": true,
            }))
            .send()
            .await?;

        match response.status().as_u16() {
            200 | 201 => Ok(response.json().await?),
            409 | 422 => Err(IdentityError::AlreadyExists),
            status => Err(IdentityError::Status(status)),
        }
    }
}
