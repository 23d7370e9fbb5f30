//! # cross-cloud-storage
//!
//! Bucket/object file store contract: streamed upload and download,
//! paginated listing, presence checks, signed download URLs and
//! best-effort bucket cleanup, plus an in-process implementation used as
//! the reference backend in tests.

mod in_memory;
mod service;

pub use in_memory::InMemoryFileService;
pub use service::{FileService, FileSource, ListFilesRequest, ListFilesResponse};
