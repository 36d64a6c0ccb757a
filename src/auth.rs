use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Environment variable holding a pre-issued OAuth access token
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Where Google API calls get their bearer token
#[derive(Debug, Clone)]
pub enum AccessTokenSource {
    /// A token handed in from outside, e.g. `gcloud auth print-access-token`
    Static(String),
    /// The GCE / Cloud Run metadata server
    MetadataServer { client: Client, url: String },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Metadata server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Metadata server returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

impl AccessTokenSource {
    /// Static token from the environment when set, the metadata server otherwise
    pub fn from_env(client: Client) -> Self {
        match std::env::var(ACCESS_TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => {
                tracing::info!("Using access token from {}", ACCESS_TOKEN_ENV);
                AccessTokenSource::Static(token.trim().to_string())
            }
            _ => AccessTokenSource::MetadataServer {
                client,
                url: METADATA_TOKEN_URL.to_string(),
            },
        }
    }

    pub async fn token(&self) -> Result<String, AuthError> {
        match self {
            AccessTokenSource::Static(token) => Ok(token.clone()),
            AccessTokenSource::MetadataServer { client, url } => {
                let response = client
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(AuthError::Rejected {
                        status: status.as_u16(),
                        body,
                    });
                }
                let token: MetadataToken = response.json().await?;
                Ok(token.access_token)
            }
        }
    }
}
