//! # cross-cloud-memory
//!
//! Scoped key/value + ordered-list memory contract, its in-process
//! reference implementation, and the lease-based [`DistributedMutex`]
//! built on the contract's lock primitive.
//!
//! Every operation is namespaced by a [`MemoryScope`]; the scope's
//! compiled string is also the pub/sub topic its change notifications are
//! published on, so observers can subscribe without knowing the service
//! instance.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use cross_cloud_memory::{DistributedMutex, InMemoryMemoryService, MemoryScope, MemoryService};
//!
//! # async fn run() -> cross_cloud_types::ServiceResult<()> {
//! let memory: Arc<dyn MemoryService> = Arc::new(InMemoryMemoryService::new());
//! let scope = MemoryScope::new(&["orders", "tenant-1"])?;
//!
//! memory
//!     .set_key_value(&scope, &[("count".to_string(), 1i64.into())], None, false)
//!     .await?;
//!
//! // Cross-process critical section with a 30 second lease.
//! let cancel = CancellationToken::new();
//! let mut lock = DistributedMutex::acquire(
//!     memory.clone(),
//!     &scope,
//!     "rollup",
//!     Duration::from_secs(30),
//!     &cancel,
//! )
//! .await?;
//! // ... the critical section ...
//! lock.release().await;
//! # Ok(())
//! # }
//! ```

mod in_memory;
mod mutex;
mod notify;
mod scope;
mod service;

pub use in_memory::InMemoryMemoryService;
pub use mutex::{DistributedMutex, MUTEX_RETRY_INTERVAL};
pub use notify::MemoryChange;
pub use scope::MemoryScope;
pub use service::MemoryService;
