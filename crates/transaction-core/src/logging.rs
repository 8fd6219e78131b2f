//! `tracing-subscriber` setup for binaries and tests embedding the engine.
//!
//! The engine only emits `tracing` events; installing a subscriber is up to
//! the host process. Engine events carry `label`, `branch`, `call_id` and
//! `status` fields, which the JSON format keeps as separate keys.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Log output settings
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Base level for everything not named in `directives`
    pub level: Level,
    /// Extra `EnvFilter` directives, e.g. `rvoip_transaction_core::timer=trace`
    pub directives: Vec<String>,
    /// One JSON object per event on stdout
    pub json: bool,
    pub file_info: bool,
    pub log_spans: bool,
    /// Reported in the startup event
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            directives: Vec::new(),
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "rvoip-tm".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());
        for directive in &self.directives {
            let parsed = directive
                .parse()
                .map_err(|e| Error::Config(format!("bad log directive {:?}: {}", directive, e)))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install the global subscriber. Fails with `Error::Config` on a bad
/// directive or when a global subscriber is already set.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(config.filter()?)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.with_writer(std::io::stdout).json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(app = %config.app_name, version = env!("CARGO_PKG_VERSION"), "logging initialized");
    Ok(())
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::Config(format!("Invalid log level: {}", level)))
}
