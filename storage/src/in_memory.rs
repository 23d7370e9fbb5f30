use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cross_cloud_types::{ServiceError, ServiceResult};

use crate::service::{
    FileService, FileSource, ListFilesRequest, ListFilesResponse, DEFAULT_LIST_PAGE_SIZE,
};

/// An in-process object store. Objects live in a `BTreeMap` per bucket,
/// so listings come back in ordinal key order and pagination is stable
/// under insertion; the continuation token is the last key of the
/// previous page.
pub struct InMemoryFileService {
    buckets: Mutex<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl InMemoryFileService {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn validated(bucket: &str, key: &str) -> ServiceResult<()> {
        if bucket.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "bucket must not be empty".to_string(),
            ));
        }
        if key.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "object key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryFileService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileService for InMemoryFileService {
    async fn upload_file(&self, source: FileSource, bucket: &str, key: &str) -> ServiceResult<()> {
        Self::validated(bucket, key)?;
        let body = match source {
            FileSource::Text(text) => Bytes::from(text.into_bytes()),
            FileSource::Bytes(bytes) => bytes,
            FileSource::Reader { mut reader, length } => {
                let mut buffer = Vec::with_capacity(length as usize);
                reader
                    .read_to_end(&mut buffer)
                    .await
                    .map_err(|e| ServiceError::Backend(format!("upload read failed: {e}")))?;
                Bytes::from(buffer)
            }
        };
        tracing::trace!("upload {bucket}/{key}: {} bytes", body.len());
        self.buckets
            .lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn download_file(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ServiceResult<u64> {
        Self::validated(bucket, key)?;
        let body = self
            .buckets
            .lock()
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
            .ok_or_else(|| ServiceError::NotFound(format!("{bucket}/{key}")))?;
        sink.write_all(&body)
            .await
            .map_err(|e| ServiceError::Backend(format!("download write failed: {e}")))?;
        sink.flush()
            .await
            .map_err(|e| ServiceError::Backend(format!("download flush failed: {e}")))?;
        Ok(body.len() as u64)
    }

    async fn file_exists(&self, bucket: &str, key: &str) -> ServiceResult<bool> {
        Self::validated(bucket, key)?;
        Ok(self
            .buckets
            .lock()
            .get(bucket)
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false))
    }

    async fn delete_file(&self, bucket: &str, key: &str) -> ServiceResult<()> {
        Self::validated(bucket, key)?;
        if let Some(objects) = self.buckets.lock().get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_files(
        &self,
        bucket: &str,
        request: ListFilesRequest,
    ) -> ServiceResult<ListFilesResponse> {
        if bucket.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "bucket must not be empty".to_string(),
            ));
        }
        let page_size = request.max_results.unwrap_or(DEFAULT_LIST_PAGE_SIZE).max(1);
        let buckets = self.buckets.lock();
        let Some(objects) = buckets.get(bucket) else {
            return Ok(ListFilesResponse {
                file_keys: vec![],
                next_continuation_token: None,
            });
        };

        let lower = match &request.continuation_token {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Unbounded,
        };
        let mut file_keys = Vec::with_capacity(page_size);
        let mut more = false;
        for key in objects
            .range((lower, Bound::Unbounded))
            .map(|(k, _)| k)
            .filter(|k| {
                request
                    .prefix
                    .as_deref()
                    .map(|p| k.starts_with(p))
                    .unwrap_or(true)
            })
        {
            if file_keys.len() == page_size {
                more = true;
                break;
            }
            file_keys.push(key.clone());
        }
        let next_continuation_token = if more {
            file_keys.last().cloned()
        } else {
            None
        };
        Ok(ListFilesResponse {
            file_keys,
            next_continuation_token,
        })
    }

    async fn create_signed_download_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> ServiceResult<String> {
        Self::validated(bucket, key)?;
        if !self.file_exists(bucket, key).await? {
            return Err(ServiceError::NotFound(format!("{bucket}/{key}")));
        }
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC);
        Ok(format!(
            "memory://{bucket}/{encoded}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn cleanup_bucket(&self, bucket: &str) -> ServiceResult<()> {
        if bucket.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "bucket must not be empty".to_string(),
            ));
        }
        if self.buckets.lock().remove(bucket).is_some() {
            tracing::debug!("bucket {bucket} purged");
        }
        Ok(())
    }
}
