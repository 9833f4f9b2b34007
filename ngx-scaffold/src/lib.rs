//! `ngx-scaffold` - data-driven test scaffold for nginx-style servers
//!
//! Runs declarative test blocks against a server-under-test: renders a
//! configuration per block, manages the server process, sends the
//! declared request, serves mock backends and judges the outcome against
//! the declared expectations.

pub mod capture;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod evaluate;
pub mod lifecycle;
pub mod mock;
pub mod mode;
pub mod observability;
pub mod report;
pub mod runner;
