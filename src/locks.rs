//! Locks around singular telescope-side resources.
//!
//! The telescope rejects a second MOVE_FOLD (or OFFSET_FOCUS) that arrives
//! while the first is still in progress, so calls from the two arms are
//! serialised here. A lock is held for exactly one remote call; callers never
//! keep it across an abort checkpoint.

use std::fmt;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::trace;

/// Telescope-side resource shared by both arms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SharedResource {
    /// Fold mirror (MOVE_FOLD).
    FoldMirror,
    /// Telescope focus offset (OFFSET_FOCUS).
    FocusOffset,
}

impl fmt::Display for SharedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharedResource::FoldMirror => write!(f, "fold mirror"),
            SharedResource::FocusOffset => write!(f, "focus offset"),
        }
    }
}

/// One mutex per [`SharedResource`].
#[derive(Debug, Default)]
pub struct ResourceLocks {
    fold_mirror: Mutex<()>,
    focus_offset: Mutex<()>,
}

impl ResourceLocks {
    /// Create unlocked resources.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, resource: SharedResource) -> &Mutex<()> {
        match resource {
            SharedResource::FoldMirror => &self.fold_mirror,
            SharedResource::FocusOffset => &self.focus_offset,
        }
    }

    /// Run `body` while holding `resource`. The guard is dropped on every
    /// exit path, including `body` being cancelled.
    pub async fn with_lock<F, T>(&self, resource: SharedResource, body: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock_for(resource).lock().await;
        trace!(%resource, "Resource lock acquired");
        let result = body.await;
        trace!(%resource, "Resource lock released");
        result
    }

    /// Whether `resource` is currently held.
    pub fn is_held(&self, resource: SharedResource) -> bool {
        self.lock_for(resource).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_calls_on_same_resource_are_serialised() {
        let locks = Arc::new(ResourceLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                locks
                    .with_lock(SharedResource::FoldMirror, async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_resources_do_not_block() {
        let locks = ResourceLocks::new();
        locks
            .with_lock(SharedResource::FoldMirror, async {
                assert!(locks.is_held(SharedResource::FoldMirror));
                assert!(!locks.is_held(SharedResource::FocusOffset));
                locks.with_lock(SharedResource::FocusOffset, async {}).await;
            })
            .await;
        assert!(!locks.is_held(SharedResource::FoldMirror));
    }

    #[tokio::test]
    async fn test_released_after_error() {
        let locks = ResourceLocks::new();
        let result: Result<(), &str> = locks
            .with_lock(SharedResource::FocusOffset, async { Err("rejected") })
            .await;
        assert!(result.is_err());
        assert!(!locks.is_held(SharedResource::FocusOffset));
    }
}
