//! S3-compatible object store via `aws-sdk-s3`.
//!
//! Credentials come from the standard AWS environment chain. Custom
//! endpoints (R2, MinIO) use path-style addressing. Transient failures
//! are retried by the SDK's standard retry policy.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::debug;

use crate::error::StoreError;
use crate::store::ObjectStore;

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Connect using the ambient AWS configuration.
    pub async fn connect(
        bucket: impl Into<String>,
        endpoint: Option<&str>,
        region: Option<&str>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        } else if endpoint.is_some() {
            // S3-compatible services accept any region name.
            loader = loader.region(Region::new("auto"));
        }
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint.is_some())
            .build();

        Self::from_client(Client::from_conf(s3_config), bucket)
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match resp {
            Ok(output) => {
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::new(format!("read body of {key}: {e}")))?;
                Ok(Some(body.into_bytes()))
            }
            Err(e) => {
                let err = e.into_service_error();
                if err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StoreError::new(format!(
                        "get {key}: {}",
                        DisplayErrorContext(&err)
                    )))
                }
            }
        }
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        let len = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::new(format!("put {key}: {}", DisplayErrorContext(&e))))?;
        debug!(%key, bytes = len, "object uploaded");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    StoreError::new(format!("list {prefix}: {}", DisplayErrorContext(&e)))
                })?;

            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }
}
