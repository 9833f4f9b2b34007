//! Test mode strategies.
//!
//! A [`TestMode`] is chosen once per run and decides how the server is
//! launched, when it is restarted or reloaded, and what extra signal is
//! read from it. Block semantics never depend on the mode.

mod fault;
mod instrumented;
mod plain;
mod reload;

use async_trait::async_trait;

use ngx_scaffold_core::TestBlock;

use crate::config::{ModeKind, ModeSettings};
use crate::error::LifecycleError;
use crate::evaluate::InstrumentationReport;
use crate::lifecycle::{Controller, LaunchSpec, LogSnapshot, RenderHints, RenderedConfig, StartupOutcome};

pub use fault::FaultInjectingMode;
pub use instrumented::{InstrumentedMode, scan_report};
pub use plain::PlainMode;
pub use reload::ReloadMode;

/// How the server-under-test is run for a whole suite.
#[async_trait]
pub trait TestMode: Send + Sync {
    /// Which mode this is.
    fn kind(&self) -> ModeKind;

    /// Factor applied to every startup, reload, stop and client timeout.
    fn timeout_multiplier(&self) -> f64 {
        1.0
    }

    /// Adjustments rendered into every configuration.
    fn render_hints(&self) -> RenderHints {
        RenderHints::default()
    }

    /// Adjusts how the server command is launched.
    ///
    /// # Errors
    ///
    /// Returns an error if a wrapper command cannot be parsed.
    fn decorate_launch(&self, _launch: &mut LaunchSpec) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Brings the server to `config` for `block`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::RecoveryFailed`] means the server could not be
    /// brought back and the run must stop. Other errors fail the block.
    async fn prepare(
        &self,
        controller: &mut Controller,
        config: &RenderedConfig,
        block: &TestBlock,
    ) -> Result<StartupOutcome, LifecycleError>;

    /// Whether the server is stopped after every block.
    fn stops_after_block(&self) -> bool {
        false
    }

    /// Reads the mode's own pass/fail signal from output captured after
    /// the block's server was stopped.
    fn inspect(&self, _block: &TestBlock, _tail: &LogSnapshot) -> Option<InstrumentationReport> {
        None
    }
}

/// Builds the mode selected in `settings`.
#[must_use]
pub fn build(settings: &ModeSettings) -> Box<dyn TestMode> {
    match settings.kind {
        ModeKind::Plain => Box::new(PlainMode),
        ModeKind::Reload => Box::new(ReloadMode),
        ModeKind::Instrumented => Box::new(InstrumentedMode::new(settings.instrumented.clone())),
        ModeKind::FaultInjecting => {
            Box::new(FaultInjectingMode::new(settings.fault_injection.clone()))
        }
    }
}

/// Restart when the configuration changed, reuse otherwise.
///
/// `must_die` blocks always get a fresh start: the failure has to be
/// observed, not inherited.
async fn restart_on_change(
    controller: &mut Controller,
    config: &RenderedConfig,
    block: &TestBlock,
) -> Result<StartupOutcome, LifecycleError> {
    if !block.must_die()
        && controller.current_config() == Some(config)
        && controller.is_running()
    {
        controller.skip_log_backlog();
        return Ok(StartupOutcome::Reused);
    }
    controller.start(config).await
}
