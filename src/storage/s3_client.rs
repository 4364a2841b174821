//! S3-compatible storage client
//!
//! Wraps the AWS SDK for S3-compatible storage access.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;

use super::{fan_in, fan_out, ByteStorage};
use crate::config::S3Config;
use crate::digest::ContentDigest;
use crate::error::StorageError;

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "casbs",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    bucket,
                    e
                );
            }
        }

        Self { client, bucket }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Upload an object
    pub async fn put_object(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::SdkError(format!("Failed to put object {}: {}", key, e)))?;

        Ok(())
    }

    /// Get an object's data, `None` if the key does not exist
    pub async fn get_object(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    return Ok(None);
                }
                return Err(StorageError::SdkError(format!(
                    "Failed to get object {}: {}",
                    key, e
                )));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::SdkError(format!("Failed to read object body: {}", e)))?
            .into_bytes();

        Ok(Some(data))
    }

    /// List every key under a prefix, following continuation tokens
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if !prefix.is_empty() {
                request = request.prefix(prefix);
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| {
                StorageError::SdkError(format!("Failed to list objects: {}", e))
            })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(|k| k.to_string())),
            );

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            continuation_token = response.next_continuation_token().map(|s| s.to_string());
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(keys)
    }

    /// Delete an object; S3 treats absent keys as already deleted
    pub async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StorageError::SdkError(format!("Failed to delete object {}: {}", key, e))
            })?;

        Ok(())
    }
}

// ============================================================================
// S3 Byte Storage
// ============================================================================

/// Content-addressed byte storage in an S3 bucket
pub struct S3ByteStorage {
    client: S3Client,
    prefix: String,
}

impl S3ByteStorage {
    pub fn new(client: S3Client, prefix: String) -> Self {
        Self { client, prefix }
    }

    fn object_key(&self, digest: &ContentDigest) -> String {
        let (fan, rest) = fan_out(digest);
        object_key(&self.prefix, &fan, &rest)
    }
}

fn object_key(prefix: &str, fan: &str, rest: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", fan, rest)
    } else {
        format!("{}/{}/{}", prefix, fan, rest)
    }
}

/// Parse `<prefix>/ab/rest` back into a digest
fn digest_from_key(listing_prefix: &str, key: &str) -> Option<ContentDigest> {
    let (fan, rest) = key.strip_prefix(listing_prefix)?.split_once('/')?;
    fan_in(fan, rest)
}

#[async_trait::async_trait]
impl ByteStorage for S3ByteStorage {
    async fn put(&self, digest: &ContentDigest, data: Bytes) -> Result<(), StorageError> {
        self.client.put_object(&self.object_key(digest), data).await
    }

    async fn get(&self, digest: &ContentDigest) -> Result<Option<Bytes>, StorageError> {
        self.client.get_object(&self.object_key(digest)).await
    }

    async fn delete(&self, digest: &ContentDigest) -> Result<(), StorageError> {
        self.client.delete_object(&self.object_key(digest)).await
    }

    async fn list(&self) -> Result<Vec<ContentDigest>, StorageError> {
        let prefix = self.prefix.trim_end_matches('/');
        let listing_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };

        let keys = self.client.list_keys(&listing_prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| digest_from_key(&listing_prefix, key))
            .collect())
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}
