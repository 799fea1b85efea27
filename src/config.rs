use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub auth: AuthConfig,
    pub cors_origin: CorsOrigin,
    pub database_url: String,
    pub environment: String,
    pub port: u16,
    pub storage: Option<StorageConfig>,
    /// Process secret for credential encryption at rest. When absent the
    /// credential service refuses to operate.
    pub storage_encryption_key: Option<String>,
}

/// External identity provider: resolves bearer tokens, issues logins.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub provider_url: String,
    pub service_key: String,
}

/// Backing object store. When absent, every storage route returns 503.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bucket name prefix prepended to the user id (`user-` by default,
    /// `storage-` in deployments fronting a managed S3).
    pub bucket_prefix: String,
    pub endpoint: String,
    /// The endpoint handed to clients in `storage_config`. Defaults to the
    /// backend endpoint; set it to the gateway's public URL when clients
    /// cannot reach the backend directly.
    pub public_endpoint: String,
    pub region: String,
    pub root_password: String,
    pub root_user: String,
}

#[derive(Debug, Clone)]
pub enum CorsOrigin {
    Any,
    List(Vec<String>),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        let environment =
            std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let cors_origin = match std::env::var("CORS_ORIGIN") {
            Ok(v) if v.trim() == "*" || v.trim().is_empty() => CorsOrigin::Any,
            Ok(v) => CorsOrigin::List(
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            Err(_) => CorsOrigin::Any,
        };

        let database_url = std::env::var("DATABASE_URL").unwrap_or_default();

        let auth = AuthConfig {
            provider_url: std::env::var("AUTH_URL")
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            service_key: std::env::var("AUTH_SERVICE_KEY").unwrap_or_default(),
        };

        // All three backend variables must be present for the gateway to run.
        let storage = match (
            std::env::var("S3_ENDPOINT"),
            std::env::var("S3_ROOT_USER"),
            std::env::var("S3_ROOT_PASSWORD"),
        ) {
            (Ok(endpoint), Ok(root_user), Ok(root_password)) if !endpoint.trim().is_empty() => {
                let endpoint = endpoint.trim_end_matches('/').to_string();
                Some(StorageConfig {
                    bucket_prefix: std::env::var("S3_BUCKET_PREFIX")
                        .unwrap_or_else(|_| "user-".to_string()),
                    public_endpoint: std::env::var("S3_PUBLIC_ENDPOINT")
                        .map(|s| s.trim_end_matches('/').to_string())
                        .unwrap_or_else(|_| endpoint.clone()),
                    endpoint,
                    region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                    root_password,
                    root_user,
                })
            }
            _ => None,
        };

        let storage_encryption_key = std::env::var("STORAGE_ENCRYPTION_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let config = Config {
            auth,
            cors_origin,
            database_url,
            environment,
            port,
            storage,
            storage_encryption_key,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "DATABASE_URL is required".to_string(),
            ));
        }
        if self.auth.provider_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "AUTH_URL is required".to_string(),
            ));
        }
        if self.auth.service_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "AUTH_SERVICE_KEY is required".to_string(),
            ));
        }
        if self.storage.is_none() {
            tracing::warn!(
                "S3 backend not configured (S3_ENDPOINT / S3_ROOT_USER / S3_ROOT_PASSWORD); \
                 storage routes will return 503"
            );
        }
        if self.storage_encryption_key.is_none() {
            tracing::warn!("STORAGE_ENCRYPTION_KEY not set; storage credentials cannot be issued");
        }
        Ok(())
    }

    /// Whether the object-store gateway can serve requests.
    pub fn storage_configured(&self) -> bool {
        self.storage.is_some()
    }
}
