use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per stack name, shared by deploys and job runs so the two
/// never drive the same compose project at once. Unrelated stacks never
/// contend.
#[derive(Debug, Clone, Default)]
pub struct StackLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

pub type StackGuard = OwnedMutexGuard<()>;

impl StackLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, stack: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(stack.to_string()).or_default())
    }

    /// Wait for exclusive access to `stack`.
    pub async fn acquire(&self, stack: &str) -> StackGuard {
        self.entry(stack).lock_owned().await
    }

    pub fn try_acquire(&self, stack: &str) -> Option<StackGuard> {
        self.entry(stack).try_lock_owned().ok()
    }
}
