//! Reload mode: one process for the whole suite.

use async_trait::async_trait;
use tracing::warn;

use ngx_scaffold_core::TestBlock;

use crate::config::ModeKind;
use crate::error::LifecycleError;
use crate::lifecycle::{Controller, RenderedConfig, StartupOutcome};

use super::TestMode;

/// Keeps one process and reloads it on configuration change.
///
/// A crashed or non-reloadable process gets one clean restart. If that
/// restart fails too, the run cannot continue.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReloadMode;

#[async_trait]
impl TestMode for ReloadMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Reload
    }

    async fn prepare(
        &self,
        controller: &mut Controller,
        config: &RenderedConfig,
        block: &TestBlock,
    ) -> Result<StartupOutcome, LifecycleError> {
        if block.must_die() {
            return controller.start(config).await;
        }

        let had_process = controller.current_config().is_some();
        if !controller.is_running() {
            if had_process {
                warn!("server process died, restarting");
                return recover(controller, config, "server process died").await;
            }
            return controller.start(config).await;
        }

        if controller.current_config() == Some(config) {
            controller.skip_log_backlog();
            return Ok(StartupOutcome::Reused);
        }

        match controller.reload(config).await {
            Ok(()) => Ok(StartupOutcome::Reloaded),
            Err(e) => {
                warn!(error = %e, "reload failed, restarting");
                recover(controller, config, &e.to_string()).await
            }
        }
    }
}

async fn recover(
    controller: &mut Controller,
    config: &RenderedConfig,
    cause: &str,
) -> Result<StartupOutcome, LifecycleError> {
    match controller.start(config).await? {
        StartupOutcome::Failed(failure) => Err(LifecycleError::RecoveryFailed(format!(
            "{cause}; clean restart failed: {failure}"
        ))),
        outcome => Ok(outcome),
    }
}
