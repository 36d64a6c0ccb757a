use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use crate::{
    auth::{AccessTokenSource, AuthError},
    table_id::TableId,
};

const GCS_UPLOAD_URL: &str = "https://storage.googleapis.com/upload/storage/v1";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive location '{0}' is not a gs:// URI or a directory path")]
    InvalidLocation(String),

    #[error("Archive object {0} already exists")]
    AlreadyExists(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Archive request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Archive returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// The SQL text of one submitted statement
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedArtifact {
    pub sql_text: String,
    pub timestamp: DateTime<Utc>,
    pub destination: TableId,
}

impl ArchivedArtifact {
    pub fn new(sql_text: impl Into<String>, destination: TableId) -> Self {
        Self {
            sql_text: sql_text.into(),
            timestamp: Utc::now(),
            destination,
        }
    }

    /// `{destination}_{timestamp}.sql`; the timestamp keeps artifacts from colliding
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.sql",
            self.destination,
            self.timestamp.format("%Y%m%d_%H%M%S_%6f")
        )
    }
}

/// Write-once storage for the SQL text every transformation submits
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store `content` under `name`, never overwriting. Returns the full location written.
    async fn store(&self, name: &str, content: &str) -> Result<String, ArchiveError>;

    /// Where objects land, for logs
    fn location(&self) -> String;
}

/// Build the store an `ARCHIVE_LOCATION` value names
pub fn from_location(
    location: &str,
    client: Client,
    tokens: AccessTokenSource,
) -> Result<Box<dyn ArchiveStore>, ArchiveError> {
    if let Some(rest) = location.strip_prefix("gs://") {
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(ArchiveError::InvalidLocation(location.to_string()));
        }
        return Ok(Box::new(GcsArchive::new(client, tokens, bucket, prefix)));
    }

    if location.trim().is_empty() || location.contains("://") {
        return Err(ArchiveError::InvalidLocation(location.to_string()));
    }
    Ok(Box::new(LocalArchive::new(location)))
}

/// Objects in a Cloud Storage bucket, uploaded with `ifGenerationMatch=0`
pub struct GcsArchive {
    client: Client,
    tokens: AccessTokenSource,
    bucket: String,
    prefix: String,
    upload_url: String,
}

impl GcsArchive {
    pub fn new(
        client: Client,
        tokens: AccessTokenSource,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            tokens,
            bucket: bucket.into(),
            prefix: prefix.into(),
            upload_url: GCS_UPLOAD_URL.to_string(),
        }
    }

    pub fn object_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

#[async_trait]
impl ArchiveStore for GcsArchive {
    async fn store(&self, name: &str, content: &str) -> Result<String, ArchiveError> {
        let token = self.tokens.token().await?;
        let object = self.object_name(name);
        let url = format!("{}/b/{}/o", self.upload_url, self.bucket);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .query(&[
                ("uploadType", "media"),
                ("name", object.as_str()),
                ("ifGenerationMatch", "0"),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/sql")
            .body(content.to_string())
            .send()
            .await?;

        let full_path = format!("gs://{}/{}", self.bucket, object);
        match response.status() {
            status if status.is_success() => Ok(full_path),
            StatusCode::PRECONDITION_FAILED => Err(ArchiveError::AlreadyExists(full_path)),
            status => Err(ArchiveError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    fn location(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.prefix)
    }
}

/// Files in a local directory, created with `create_new`
#[derive(Debug, Clone)]
pub struct LocalArchive {
    root: PathBuf,
}

impl LocalArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArchiveStore for LocalArchive {
    async fn store(&self, name: &str, content: &str) -> Result<String, ArchiveError> {
        let path = self.root.join(name);
        let display = path.display().to_string();
        let io_error = |source| ArchiveError::Io {
            path: display.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_error)?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ArchiveError::AlreadyExists(display.clone()))
            }
            Err(e) => return Err(io_error(e)),
        };
        file.write_all(content.as_bytes()).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)?;

        Ok(display)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}
