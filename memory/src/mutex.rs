use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cross_cloud_types::{ServiceError, ServiceResult};

use crate::scope::MemoryScope;
use crate::service::MemoryService;

/// Backoff between lock attempts while another holder's lease is live.
pub const MUTEX_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A scoped acquisition handle over the memory service's lease mutex.
///
/// `acquire` blocks until the lock is taken, the cancel token fires, or
/// the underlying lock call errors. The handle releases exactly once;
/// calling [`DistributedMutex::release`] again is a no-op, and dropping
/// an unreleased handle spawns a best-effort unlock. The lease TTL is a
/// safety net against crashed holders, not a correctness boundary.
pub struct DistributedMutex {
    memory: Arc<dyn MemoryService>,
    scope: MemoryScope,
    key: String,
    lease_id: String,
    ttl: Duration,
    released: bool,
}

impl DistributedMutex {
    pub async fn acquire(
        memory: Arc<dyn MemoryService>,
        scope: &MemoryScope,
        key: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> ServiceResult<Self> {
        loop {
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }
            match memory.mutex_lock(scope, key, ttl).await? {
                Some(lease_id) => {
                    tracing::trace!("acquired mutex {}:{key}", scope.compiled());
                    return Ok(Self {
                        memory,
                        scope: scope.clone(),
                        key: key.to_string(),
                        lease_id,
                        ttl,
                        released: false,
                    });
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
                        _ = tokio::time::sleep(MUTEX_RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// release unlocks with the stored lease. Double release is a no-op.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self
            .memory
            .mutex_unlock(&self.scope, &self.key, &self.lease_id)
            .await
        {
            tracing::warn!(
                "failed to release mutex {}:{}: {e}",
                self.scope.compiled(),
                self.key
            );
        }
    }
}

impl Drop for DistributedMutex {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let memory = Arc::clone(&self.memory);
        let scope = self.scope.clone();
        let key = std::mem::take(&mut self.key);
        let lease_id = std::mem::take(&mut self.lease_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tracing::debug!("releasing mutex {}:{key} from drop", scope.compiled());
            handle.spawn(async move {
                let _ = memory.mutex_unlock(&scope, &key, &lease_id).await;
            });
        } else {
            tracing::warn!(
                "mutex {}:{key} dropped outside a runtime; lease will lapse via TTL",
                scope.compiled()
            );
        }
    }
}
