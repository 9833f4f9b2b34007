use async_trait::async_trait;

use ngx_scaffold_core::TestBlock;

use crate::config::ModeKind;
use crate::error::LifecycleError;
use crate::lifecycle::{Controller, RenderedConfig, StartupOutcome};

use super::{TestMode, restart_on_change};

/// Direct start/stop: restart when the configuration changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainMode;

#[async_trait]
impl TestMode for PlainMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Plain
    }

    async fn prepare(
        &self,
        controller: &mut Controller,
        config: &RenderedConfig,
        block: &TestBlock,
    ) -> Result<StartupOutcome, LifecycleError> {
        restart_on_change(controller, config, block).await
    }
}
