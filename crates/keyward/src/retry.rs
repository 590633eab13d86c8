//! Respawn-and-retry around the markings step.

use std::future::Future;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;

/// Lifecycle of the markup helper process.
#[async_trait]
pub trait MarkupHelper: Send + Sync {
    /// True when the helper is managed elsewhere and must never be spawned.
    fn bypass_spawn(&self) -> bool;

    /// Starts (or restarts) the helper, resolving once it has been launched.
    async fn spawn(&self) -> Result<()>;
}

/// Runs `op`, and on a network timeout respawns the helper and runs it once
/// more.
///
/// Nothing is retried when no helper is configured or it is in bypass-spawn
/// mode. A second timeout, or any other error, is returned as is.
pub async fn with_respawn<T, F, Fut>(helper: Option<&dyn MarkupHelper>, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retried = false;
    loop {
        match op().await {
            Err(e) if e.is_network_timeout() && !retried => match helper {
                Some(helper) if !helper.bypass_spawn() => {
                    warn!(error = %e, "markup helper timed out, respawning and retrying once");
                    helper.spawn().await?;
                    retried = true;
                }
                _ => return Err(e),
            },
            result => return result,
        }
    }
}
