//! # cross-cloud-database
//!
//! Schema-light document database contract over JSON-shaped rows, the
//! backend trait concrete providers implement, and [`DatabaseClient`],
//! the base that layers the cross-cutting behavior on top of any
//! backend: per-(table, key) serialization through distributed entity
//! mutexes, backup-freeze cooperation over pub/sub, attribute-name
//! sanity, and the system-table bookkeeping.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use cross_cloud_database::{
//!     DatabaseClient, DatabaseClientConfig, DatabaseService, InMemoryDatabaseBackend,
//!     ReturnItemBehavior,
//! };
//! use cross_cloud_memory::InMemoryMemoryService;
//! use cross_cloud_pubsub::InMemoryPubSubService;
//! use cross_cloud_types::DbKey;
//!
//! # async fn run() -> cross_cloud_types::ServiceResult<()> {
//! let database = DatabaseClient::new(
//!     Arc::new(InMemoryDatabaseBackend::new()),
//!     Arc::new(InMemoryMemoryService::new()),
//!     Arc::new(InMemoryPubSubService::new()),
//!     DatabaseClientConfig::default(),
//! )
//! .await?;
//!
//! let cancel = CancellationToken::new();
//! let key = DbKey::new("Id", "user1")?;
//! let item = serde_json::json!({"Name": "John Doe", "Age": 30});
//! database
//!     .put_item(
//!         "Users",
//!         &key,
//!         item.as_object().unwrap(),
//!         ReturnItemBehavior::DoNotReturn,
//!         false,
//!         &cancel,
//!     )
//!     .await?;
//! let fetched = database.get_item("Users", &key, None, &cancel).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod client;
mod in_memory;
mod service;

pub use backend::DatabaseBackend;
pub use client::{DatabaseClient, DatabaseClientConfig};
pub use in_memory::InMemoryDatabaseBackend;
pub use service::{DatabaseService, ReturnItemBehavior, ScanPage};

use std::time::Duration;

/// Base name of the reserved bookkeeping table; a configured postfix may
/// be appended.
pub const SYSTEM_TABLE_BASE_NAME: &str = "cross-cloud-kit-database-system-table";

/// Key attribute of the system table rows.
pub const SYSTEM_TABLE_KEY_NAME: &str = "table";

/// Array attribute on a system row holding every key attribute name ever
/// used for the user table.
pub const SYSTEM_TABLE_KEYS_ATTRIBUTE: &str = "keys";

/// Well-known topic on which the backup engine announces quiescence.
pub const BACKUP_CHECK_TOPIC: &str =
    "CrossCloudKit.Interfaces.Classes.DatabaseServiceBase:BackupCheck";

/// Payloads on [`BACKUP_CHECK_TOPIC`].
pub const BACKUP_STARTED_MESSAGE: &str = "started";
pub const BACKUP_ENDED_MESSAGE: &str = "ended";

/// Scope and key of the singleton backup mutex.
pub const BACKUP_MUTEX_SCOPE: &str = "DatabaseServiceBackup";
pub const BACKUP_MUTEX_KEY: &str = "db-backup-mutex";

/// TTLs of the three lock classes.
pub const ENTITY_MUTEX_TTL: Duration = Duration::from_secs(60);
pub const BACKUP_MUTEX_TTL: Duration = Duration::from_secs(300);
