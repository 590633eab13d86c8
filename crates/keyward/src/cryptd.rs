//! Markup helper process management.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use keyward_config::MarkupConfig;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::retry::MarkupHelper;

/// How long a freshly spawned helper must stay alive to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// A markup helper launched as a child process.
pub struct CryptdProcess {
    path: PathBuf,
    args: Vec<String>,
    bypass_spawn: bool,
    child: Mutex<Option<Child>>,
}

impl CryptdProcess {
    pub fn new(path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            args,
            bypass_spawn: false,
            child: Mutex::new(None),
        }
    }

    pub fn from_config(config: &MarkupConfig) -> Self {
        Self {
            bypass_spawn: config.bypass_spawn,
            ..Self::new(&config.spawn_path, config.spawn_args.clone())
        }
    }

    pub fn with_bypass_spawn(mut self, bypass: bool) -> Self {
        self.bypass_spawn = bypass;
        self
    }

    /// Checks if the helper process is alive.
    pub async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kills the helper if this handle started it.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(child) = self.child.lock().await.take() {
            stop(child).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MarkupHelper for CryptdProcess {
    fn bypass_spawn(&self) -> bool {
        self.bypass_spawn
    }

    async fn spawn(&self) -> Result<()> {
        if self.bypass_spawn {
            return Ok(());
        }

        let mut slot = self.child.lock().await;
        if let Some(previous) = slot.take() {
            stop(previous).await?;
        }

        let mut child = Command::new(&self.path)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.path.display())))?;

        sleep(STARTUP_GRACE).await;

        match child.try_wait() {
            Ok(None) => {
                info!(path = %self.path.display(), pid = child.id(), "markup helper started");
                *slot = Some(child);
                Ok(())
            }
            Ok(Some(status)) => Err(Error::Spawn(format!(
                "{} exited immediately with {status}",
                self.path.display()
            ))),
            Err(e) => Err(Error::Spawn(e.to_string())),
        }
    }
}

async fn stop(mut child: Child) -> Result<()> {
    debug!(pid = child.id(), "stopping markup helper");
    // Fails only when the process already exited.
    child.kill().await.ok();
    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Err(e)) => Err(Error::Spawn(e.to_string())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_copies_markup_settings() {
        let config = MarkupConfig {
            bypass_spawn: true,
            ..MarkupConfig::default()
        };
        let helper = CryptdProcess::from_config(&config);
        assert!(helper.bypass_spawn());
        assert_eq!(helper.path, PathBuf::from("mongocryptd"));
        assert_eq!(helper.args, ["--idleShutdownTimeoutSecs", "60"]);
    }

    #[tokio::test]
    async fn bypass_spawn_never_starts_a_process() {
        let helper =
            CryptdProcess::new("/nonexistent/markup-helper", Vec::new()).with_bypass_spawn(true);
        helper.spawn().await.unwrap();
        assert!(!helper.is_alive().await);
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let helper = CryptdProcess::new("/nonexistent/markup-helper", Vec::new());
        let err = helper.spawn().await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_respawn_and_shutdown() {
        let helper = CryptdProcess::new("sleep", vec!["30".to_string()]);

        helper.spawn().await.unwrap();
        assert!(helper.is_alive().await);

        // Respawn replaces the running process.
        helper.spawn().await.unwrap();
        assert!(helper.is_alive().await);

        helper.shutdown().await.unwrap();
        assert!(!helper.is_alive().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_that_exits_immediately_fails() {
        let helper = CryptdProcess::new("true", Vec::new());
        let err = helper.spawn().await.unwrap_err();
        assert!(err.to_string().contains("exited immediately"));
    }
}
