use async_trait::async_trait;

use crate::error::LoadError;

/// Makes the external delivery library available.
///
/// Called exactly once, from [`Dispatcher::start`](crate::Dispatcher::start).
/// If it never completes the dispatcher stays in `Loading` and keeps
/// buffering.
#[async_trait]
pub trait LibraryLoader: Send + Sync {
    async fn load(&self) -> Result<(), LoadError>;
}

/// Loader for senders that need no library, ready immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLoader;

#[async_trait]
impl LibraryLoader for NoopLoader {
    async fn load(&self) -> Result<(), LoadError> {
        Ok(())
    }
}
