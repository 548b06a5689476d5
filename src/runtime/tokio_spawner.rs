//! Tokio runtime spawner implementation.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::core::Spawn;

/// Tokio-based spawner that executes tasks on a tokio runtime.
///
/// The default spawner uses whichever runtime is current when a task is
/// spawned; [`TokioSpawner::new`] pins execution to a specific runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner {
    handle: Option<Arc<Handle>>,
}

impl TokioSpawner {
    /// Create a spawner bound to a tokio runtime handle.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle: Some(Arc::new(handle)),
        }
    }

    /// Create a spawner bound to the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.handle {
            Some(handle) => {
                handle.spawn(fut);
            }
            None => {
                tokio::spawn(fut);
            }
        }
    }
}
