//! AWS S3 backend for strata-cache
//!
//! [`S3ObjectStore`] implements [`ObjectStore`] on top of a single bucket.
//! Credentials and region come from the standard AWS configuration chain.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use std::collections::HashMap;
use strata_cache::{ObjectBody, ObjectStore, ObjectStoreError, StoredObject};

/// Environment variable naming the bucket
pub const ENV_BUCKET: &str = "STRATA_BUCKET";

/// An [`ObjectStore`] backed by one S3 bucket
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Wrap an existing client
    #[must_use]
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the default AWS configuration chain
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self::new(Client::new(&config), bucket)
    }

    /// Bucket every object is stored in
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        content_length: u64,
        metadata: HashMap<String, String>,
    ) -> Result<(), ObjectStoreError> {
        let length = i64::try_from(content_length).map_err(|_| {
            ObjectStoreError::backend(format!("{key}: {content_length} bytes is too large"))
        })?;

        let stream = match body {
            ObjectBody::Bytes(bytes) => ByteStream::from(bytes),
            ObjectBody::File(file) => ByteStream::read_from()
                .file(file)
                .build()
                .await
                .map_err(|e| {
                    ObjectStoreError::backend(format!("reading upload body for {key}: {e}"))
                })?,
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(stream)
            .content_length(length)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| backend_error(&e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if is_not_found(e.code(), e.message(), status_code(&e)) => {
                tracing::trace!(bucket = %self.bucket, key, "S3 object not found");
                return Err(ObjectStoreError::NotFound {
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(backend_error(&e)),
        };

        let content_length = object_length(key, output.content_length())?;
        let metadata = output.metadata().cloned().unwrap_or_default();

        Ok(StoredObject {
            content_length,
            metadata,
            body: Box::new(Box::pin(output.body.into_async_read())),
        })
    }
}

/// Whether an S3 error means the object does not exist
///
/// This is a heuristic. `NoSuchKey` is definitive. `AccessDenied` is what
/// S3 returns for a missing key when the caller lacks `s3:ListBucket`, so it
/// counts as not found unless the failure was really a bad signature, in
/// which case existence is unknown. A bare 404 without an error code
/// (as sent for bodiless responses) also counts as not found.
#[must_use]
pub fn is_not_found(code: Option<&str>, message: Option<&str>, status: Option<u16>) -> bool {
    match code {
        Some("NoSuchKey" | "NotFound") => true,
        Some("AccessDenied") => !message.is_some_and(|m| m.contains("SignatureDoesNotMatch")),
        Some(_) => false,
        None => status == Some(404),
    }
}

/// Bucket name from [`ENV_BUCKET`]
///
/// # Errors
/// Returns a configuration error if the variable is unset or blank.
pub fn bucket_from_env() -> strata_cache::Result<String> {
    std::env::var(ENV_BUCKET)
        .ok()
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| {
            strata_cache::Error::configuration(format!("{ENV_BUCKET} is not set"))
        })
}

/// Length of a fetched object
///
/// A missing or negative Content-Length is an error, never an empty object.
fn object_length(key: &str, content_length: Option<i64>) -> Result<u64, ObjectStoreError> {
    match content_length {
        Some(len) => u64::try_from(len).map_err(|_| {
            ObjectStoreError::backend(format!("{key}: invalid content length {len}"))
        }),
        None => Err(ObjectStoreError::backend(format!(
            "{key}: response has no content length"
        ))),
    }
}

fn status_code<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response()
        .map(|response| response.status().as_u16())
}

fn backend_error<E>(err: &E) -> ObjectStoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    ObjectStoreError::Backend {
        code: err.code().map(str::to_string),
        message: DisplayErrorContext(err).to_string(),
    }
}
