use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use cross_cloud_types::ServiceResult;

/// Default page size for [`FileService::list_files`].
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

/// The body of an upload: a UTF-8 string, a byte buffer, or a reader
/// with a declared length.
pub enum FileSource {
    Text(String),
    Bytes(Bytes),
    Reader {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        length: u64,
    },
}

impl From<String> for FileSource {
    fn from(v: String) -> Self {
        FileSource::Text(v)
    }
}

impl From<&str> for FileSource {
    fn from(v: &str) -> Self {
        FileSource::Text(v.to_string())
    }
}

impl From<Bytes> for FileSource {
    fn from(v: Bytes) -> Self {
        FileSource::Bytes(v)
    }
}

impl From<Vec<u8>> for FileSource {
    fn from(v: Vec<u8>) -> Self {
        FileSource::Bytes(Bytes::from(v))
    }
}

/// Parameters for one page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListFilesRequest {
    pub prefix: Option<String>,
    pub max_results: Option<usize>,
    pub continuation_token: Option<String>,
}

/// One page of object keys. Iteration is complete when
/// `next_continuation_token` is `None`.
#[derive(Debug, Clone)]
pub struct ListFilesResponse {
    pub file_keys: Vec<String>,
    pub next_continuation_token: Option<String>,
}

/// The bucket/object store contract. Object keys are opaque to the
/// service; callers compose their own naming schemes.
#[async_trait]
pub trait FileService: Send + Sync {
    /// upload_file streams the source to `bucket/key`, replacing any
    /// existing object.
    async fn upload_file(&self, source: FileSource, bucket: &str, key: &str) -> ServiceResult<()>;

    /// download_file writes the object into `sink` and returns the byte
    /// count. Missing objects are not found.
    async fn download_file(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> ServiceResult<u64>;

    async fn file_exists(&self, bucket: &str, key: &str) -> ServiceResult<bool>;

    /// delete_file removes the object; deleting a missing object is not
    /// an error.
    async fn delete_file(&self, bucket: &str, key: &str) -> ServiceResult<()>;

    /// list_files returns one page of keys in ordinal key order. Pages
    /// are stable under concurrent insertion.
    async fn list_files(
        &self,
        bucket: &str,
        request: ListFilesRequest,
    ) -> ServiceResult<ListFilesResponse>;

    /// create_signed_download_url returns a URL granting read access to
    /// the object for `expires_in`.
    async fn create_signed_download_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> ServiceResult<String>;

    /// cleanup_bucket purges the bucket, best effort. Used in test
    /// teardown.
    async fn cleanup_bucket(&self, bucket: &str) -> ServiceResult<()>;
}
