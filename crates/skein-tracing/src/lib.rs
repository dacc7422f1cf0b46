//! Shared tracing configuration utilities for the skein workspace.
//!
//! The helpers in this crate centralise how executables, integration tests,
//! and supporting tools install `tracing` subscribers. Routing setup through
//! a single crate avoids copy-pasted builder logic and keeps the logging
//! surface consistent across binaries.

use std::env;
pub use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Output format for the formatter layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingOutput {
    /// Multi-line human output for local development
    Pretty,
    /// Single-line human output
    Compact,
    /// Machine-readable JSON for CI and log collection
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Configuration describing how the shared tracing subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Optional tracing directives (e.g. `skein_core=debug,info`). When
    /// absent the crate falls back to `RUST_LOG` and finally to
    /// `default_directive`.
    pub directives: Option<String>,
    /// Fallback directive used when neither `directives` nor `RUST_LOG`
    /// resolve to a valid filter.
    pub default_directive: String,
    /// Controls whether event targets (module paths) appear in output.
    pub include_targets: bool,
    /// Controls ANSI formatting. Disable for CI logs that strip colour codes.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Output format for the formatter layer.
    pub output: TracingOutput,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Returns a configuration tuned for local development (pretty, ANSI-enabled output).
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
        }
    }

    /// Returns a configuration tuned for CI or log collection environments (JSON, no ANSI).
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
        }
    }

    /// Build a configuration using environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `SKEIN_TRACING_PROFILE` - Profile preset: `local` (default) or `ci`
    /// - `SKEIN_TRACING_DIRECTIVES` - Overrides tracing directives
    /// - `SKEIN_TRACING_FORMAT` - Output format: `pretty`, `compact`, or `json`
    pub fn from_env() -> Self {
        let profile = env::var("SKEIN_TRACING_PROFILE")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var("SKEIN_TRACING_DIRECTIVES") {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var("SKEIN_TRACING_FORMAT") {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if matches!(config.output, TracingOutput::Json) {
                    config.ansi = false;
                }
            }
        }

        config
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(directives) = &self.directives {
            if let Ok(filter) = EnvFilter::try_new(directives) {
                return filter;
            }
        }
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
        EnvFilter::new(&self.default_directive)
    }

    /// Install a global subscriber for this configuration.
    ///
    /// Returns an error if a global subscriber is already installed; tests
    /// that race on installation should ignore the error.
    pub fn try_init(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let filter = self.build_filter();
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.include_targets)
            .with_ansi(self.ansi)
            .with_span_events(self.span_events.clone());

        match self.output {
            TracingOutput::Pretty => builder.pretty().try_init(),
            TracingOutput::Compact => builder.compact().try_init(),
            TracingOutput::Json => builder.json().try_init(),
        }
    }
}

/// Install the environment-driven configuration, ignoring double-install.
///
/// Convenience entry point for binaries and integration tests.
pub fn init_from_env() {
    let _ = TracingConfig::from_env().try_init();
}
