//! Ambient execution mode.
//!
//! Code running inside [`ExecutionContext::sync`] has every dispatch executed
//! inline instead of enqueued. The mode is task-local and does not leak into
//! tasks spawned from the scope.

use std::future::Future;

tokio::task_local! {
    static EXECUTION: ExecutionContext;
}

/// Execution flags visible to the current task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Run dispatched jobs inline.
    pub sync: bool,

    /// Log each inline execution at info level.
    pub debug: bool,
}

impl ExecutionContext {
    /// Flags for the current task, or the queued default outside any scope.
    pub fn current() -> Self {
        EXECUTION.try_with(|ctx| *ctx).unwrap_or_default()
    }

    /// Returns true if dispatches should run inline.
    pub fn is_sync() -> bool {
        Self::current().sync
    }

    /// Returns true if debug output is enabled.
    pub fn is_debug() -> bool {
        Self::current().debug
    }

    /// Runs `fut` with these flags.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        EXECUTION.scope(self, fut).await
    }

    /// Runs `fut` with inline dispatch.
    pub async fn sync<F: Future>(fut: F) -> F::Output {
        Self {
            sync: true,
            ..Self::current()
        }
        .scope(fut)
        .await
    }

    /// Runs `fut` with normal enqueueing, even inside a sync scope.
    pub async fn queued<F: Future>(fut: F) -> F::Output {
        Self {
            sync: false,
            ..Self::current()
        }
        .scope(fut)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_is_queued() {
        assert!(!ExecutionContext::is_sync());
        assert!(!ExecutionContext::is_debug());
    }

    #[tokio::test]
    async fn test_sync_scope() {
        let inside = ExecutionContext::sync(async { ExecutionContext::is_sync() }).await;
        assert!(inside);
        assert!(!ExecutionContext::is_sync());
    }

    #[tokio::test]
    async fn test_queued_inside_sync() {
        let inner = ExecutionContext::sync(async {
            ExecutionContext::queued(async { ExecutionContext::is_sync() }).await
        })
        .await;
        assert!(!inner);
    }

    #[tokio::test]
    async fn test_scope_keeps_debug() {
        let ctx = ExecutionContext {
            sync: false,
            debug: true,
        };
        let (sync, debug) = ctx
            .scope(ExecutionContext::sync(async {
                (ExecutionContext::is_sync(), ExecutionContext::is_debug())
            }))
            .await;
        assert!(sync && debug);
    }
}
