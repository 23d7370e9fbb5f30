//! # cross-cloud-backup
//!
//! Point-in-time backup, restore and cross-provider migration for
//! CrossCloudKit databases.
//!
//! A backup quiesces every database client in the fleet over pub/sub,
//! snapshots each table under the singleton backup mutex, and writes a
//! canonical JSON artifact into the file service. Restore validates the
//! artifact, then drops and repopulates tables while holding the same
//! cross-process lock. Migration is a backup of the source replayed into
//! the destination.
//!
//! Construct [`DatabaseBackupService`] without a schedule for manual
//! backups, or with a [`BackupSchedule`] to run a cron-driven loop.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use cross_cloud_backup::{BackupSchedule, DatabaseBackupService};
//!
//! # async fn run(
//! #     database: std::sync::Arc<dyn cross_cloud_database::DatabaseService>,
//! #     files: std::sync::Arc<dyn cross_cloud_storage::FileService>,
//! #     pubsub: std::sync::Arc<dyn cross_cloud_pubsub::PubSubService>,
//! # ) -> cross_cloud_types::ServiceResult<()> {
//! // Nightly backups at 01:00 UTC into backups/ of the given bucket.
//! let backup = DatabaseBackupService::new(
//!     database,
//!     files,
//!     pubsub,
//!     "my-backup-bucket",
//!     "backups",
//!     Some(BackupSchedule::default()),
//!     None,
//! )?;
//!
//! // A manual snapshot, then a restore from it.
//! let cancel = CancellationToken::new();
//! if let Some(cursor) = backup.take_backup(false, &cancel).await? {
//!     backup.restore_backup(&cursor, false, &cancel).await?;
//! }
//! backup.dispose().await;
//! # Ok(())
//! # }
//! ```

mod artifact;
mod service;

pub use artifact::{BackupCursor, TableBackup};
pub use service::{BackupSchedule, DatabaseBackupService, ErrorCallback};

use std::time::Duration;

/// How long the engine waits after publishing `started` for every client
/// in the fleet to observe the freeze. This wait is the cross-table
/// consistency boundary, not an optimization.
pub const QUIESCENCE_WAIT: Duration = Duration::from_secs(10);

/// Backoff before retrying a failed scheduled backup.
pub const SCHEDULER_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Consecutive scheduled-backup failures tolerated before the loop gives
/// up.
pub const SCHEDULER_MAX_FAILURES: u32 = 10;

/// Default schedule: daily at 01:00.
pub const DEFAULT_CRON_EXPRESSION: &str = "0 1 * * *";
