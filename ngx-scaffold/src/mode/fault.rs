//! Fault-injecting mode: an interception library forces short reads and
//! writes so every non-blocking path in the server gets exercised.

use async_trait::async_trait;

use ngx_scaffold_core::TestBlock;

use crate::config::{FaultInjectionSettings, ModeKind};
use crate::error::LifecycleError;
use crate::lifecycle::{Controller, LaunchSpec, RenderHints, RenderedConfig, StartupOutcome};

use super::{TestMode, restart_on_change};

/// Preloads the interception library and renders the event mechanism it
/// supports.
#[derive(Debug, Clone)]
pub struct FaultInjectingMode {
    settings: FaultInjectionSettings,
}

impl FaultInjectingMode {
    /// Creates the mode.
    #[must_use]
    pub const fn new(settings: FaultInjectionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TestMode for FaultInjectingMode {
    fn kind(&self) -> ModeKind {
        ModeKind::FaultInjecting
    }

    fn render_hints(&self) -> RenderHints {
        RenderHints {
            master_process: true,
            event_mechanism: Some(self.settings.event_mechanism.clone()),
        }
    }

    fn decorate_launch(&self, launch: &mut LaunchSpec) -> Result<(), LifecycleError> {
        if let Some(preload) = &self.settings.preload {
            launch.set_env("LD_PRELOAD", preload.display().to_string());
        }
        launch.set_env("MOCKEAGAIN", self.settings.io_modes.clone());
        if let Some(pattern) = &self.settings.write_timeout_pattern {
            launch.set_env("MOCKEAGAIN_WRITE_TIMEOUT_PATTERN", pattern.clone());
        }
        Ok(())
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
