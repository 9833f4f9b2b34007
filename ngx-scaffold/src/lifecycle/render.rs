//! Configuration rendering.
//!
//! A template is plain text with `{{name}}` placeholders. Rendering is a
//! pure function of the template, the block's config sections and the
//! render context, so identical inputs always produce identical bytes.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use ngx_scaffold_core::TestBlock;

use crate::error::LifecycleError;

/// Built-in template for an nginx-flavoured server.
pub const DEFAULT_TEMPLATE: &str = r"# Generated by ngx-scaffold. Do not edit.
daemon off;
master_process {{master_process}};
worker_processes 1;
pid {{prefix}}/logs/nginx.pid;
error_log {{error_log}} {{log_level}};

{{main_config}}

events {
    worker_connections 64;
{{events}}
}

http {
    access_log {{prefix}}/logs/access.log;
    default_type text/plain;
    keepalive_timeout 68;

{{http_config}}

    server {
        listen {{listen}};
        server_name localhost;
        client_max_body_size 30M;

{{config}}
    }
}
";

/// Adjustments a test mode makes to every rendered configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderHints {
    /// Value of the `master_process` directive.
    pub master_process: bool,
    /// Event mechanism to force (`use <name>;`), if any.
    pub event_mechanism: Option<String>,
}

impl Default for RenderHints {
    fn default() -> Self {
        Self {
            master_process: true,
            event_mechanism: None,
        }
    }
}

/// Values that do not come from the block.
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// Server root.
    pub prefix: PathBuf,
    /// `host:port` the server listens on.
    pub listen: String,
    /// Default error log level.
    pub log_level: String,
}

/// A complete configuration, ready to be written to disk.
///
/// Two rendered configs are equal iff their text is byte-identical, which
/// is what decides reuse, reload or restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    text: String,
}

impl RenderedConfig {
    /// The configuration text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Error log path inside a server root.
#[must_use]
pub fn error_log_path(prefix: &Path) -> PathBuf {
    prefix.join("logs").join("error.log")
}

/// Document root inside a server root.
#[must_use]
pub fn html_dir(prefix: &Path) -> PathBuf {
    prefix.join("html")
}

/// Renders `template` for `block`.
///
/// # Errors
///
/// Returns [`LifecycleError::Render`] for an unterminated or unknown
/// placeholder.
pub fn render(
    template: &str,
    block: &TestBlock,
    context: &RenderContext,
    hints: &RenderHints,
) -> Result<RenderedConfig, LifecycleError> {
    let values = placeholder_values(block, context, hints);
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| {
            LifecycleError::Render(format!(
                "unterminated placeholder near {:?}",
                after.chars().take(20).collect::<String>()
            ))
        })?;
        let name = after[..close].trim();
        let value = values
            .get(name)
            .ok_or_else(|| LifecycleError::Render(format!("unknown placeholder '{{{{{name}}}}}'")))?;
        out.push_str(value);
        rest = &after[close + 2..];
    }
    out.push_str(rest);

    Ok(RenderedConfig { text: out })
}

fn placeholder_values(
    block: &TestBlock,
    context: &RenderContext,
    hints: &RenderHints,
) -> IndexMap<&'static str, String> {
    let fragment = |text: Option<&str>| text.map(str::trim_end).unwrap_or_default().to_string();

    let mut values = IndexMap::new();
    values.insert("prefix", context.prefix.display().to_string());
    values.insert("listen", context.listen.clone());
    values.insert(
        "port",
        context
            .listen
            .rsplit_once(':')
            .map_or_else(String::new, |(_, port)| port.to_string()),
    );
    values.insert(
        "error_log",
        error_log_path(&context.prefix).display().to_string(),
    );
    values.insert("html_dir", html_dir(&context.prefix).display().to_string());
    values.insert(
        "log_level",
        block.log_level().unwrap_or(&context.log_level).to_string(),
    );
    values.insert(
        "master_process",
        if hints.master_process { "on" } else { "off" }.to_string(),
    );
    values.insert(
        "events",
        hints
            .event_mechanism
            .as_ref()
            .map_or_else(String::new, |name| format!("    use {name};")),
    );
    values.insert("main_config", fragment(block.main_config()));
    values.insert("http_config", fragment(block.http_config()));
    values.insert("config", fragment(block.config()));
    values
}
