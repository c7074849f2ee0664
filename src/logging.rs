//! Logging Setup
//!
//! Installs the global `tracing` subscriber from [`LoggingConfig`]. `RUST_LOG`
//! directives take precedence over the configured level; `--verbose` raises
//! the default to DEBUG.

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Default level from the configuration, raised to DEBUG when verbose
pub fn default_level(config: &LoggingConfig, verbose: bool) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    config.level.to_lowercase().parse().unwrap_or(Level::INFO)
}

pub fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = env_filter(default_level(config, verbose));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.format.to_lowercase().as_str() {
        "json" => builder
            .json()
            .with_current_span(false)
            .flatten_event(true)
            .try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().with_target(false).try_init(),
    };

    result
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("Failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing::{debug, info, warn};
    use tracing_subscriber::fmt::MakeWriter;

    /// Captures formatted output in memory
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> String {
            let buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
            String::from_utf8_lossy(&buf).to_string()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_default_level_from_config() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(default_level(&config, false), Level::WARN);
        assert_eq!(default_level(&config, true), Level::DEBUG);
    }

    #[test]
    fn test_unparseable_level_falls_back_to_info() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(default_level(&config, false), Level::INFO);
    }

    #[test]
    fn test_level_filtering() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_writer(capture.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            debug!("hidden detail");
            info!("visible message");
        });

        let out = capture.contents();
        assert!(out.contains("visible message"));
        assert!(!out.contains("hidden detail"));
    }

    #[test]
    fn test_json_output_is_parseable() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_writer(capture.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            warn!(organization_id = "org-1", balance = -3, "Usage exceeded balance");
        });

        let out = capture.contents();
        let line = out.lines().next().unwrap();
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(event["level"], "WARN");
        assert_eq!(event["organization_id"], "org-1");
        assert_eq!(event["balance"], -3);
        assert_eq!(event["message"], "Usage exceeded balance");
    }
}
