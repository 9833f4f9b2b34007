//! Harness configuration
//!
//! The configuration describes how to launch the server-under-test, the
//! client defaults and the active test mode. It is loaded once per run.

pub mod loader;
pub mod schema;

pub use loader::{LoadResult, LoadWarning, Overrides, load, parse_signal};
pub use schema::{
    ClientSettings, FaultInjectionSettings, HarnessConfig, InstrumentedSettings, ModeKind,
    ModeSettings, ParserSettings, ServerSettings,
};
