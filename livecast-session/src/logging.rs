//! Tracing setup and the spans room work runs under
//!
//! Per-viewer work is wrapped in [`viewer_span`], so every event a
//! negotiation or transport pump emits carries the room and viewer ids
//! without repeating them at each call site.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::types::{RoomId, ViewerId};

/// Output shape of the log layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, for a terminal
    Pretty,
    /// Single-line, for a terminal that scrolls a lot
    Compact,
    /// One JSON object per line, for collectors
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!("Unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` takes precedence over `config.level`. Fails on an unknown level
/// or format, an unopenable log file, or a subscriber that is already set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let format: LogFormat = config.format.parse()?;
    let filter = env_filter(&config.level)?;
    let writer = match &config.file_path {
        Some(path) => BoxMakeWriter::new(open_log_file(path)?),
        None => BoxMakeWriter::new(std::io::stdout),
    };

    tracing_subscriber::registry()
        .with(output_layer(format, writer))
        .with(filter)
        .try_init()?;

    tracing::debug!(format = %format, level = %config.level, "Logging initialized");
    Ok(())
}

/// Subscriber for tests: captured by the harness, debug for this crate
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("livecast_session=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}

/// Span for everything done on behalf of one room
#[must_use]
pub fn room_span(room_id: &RoomId) -> Span {
    tracing::info_span!("room", room_id = %room_id)
}

/// Span for one viewer's negotiation and transport events
#[must_use]
pub fn viewer_span(room_id: &RoomId, viewer_id: &ViewerId) -> Span {
    tracing::info_span!("viewer", room_id = %room_id, viewer_id = %viewer_id)
}

fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level = Level::from_str(level).map_err(|_| anyhow::anyhow!("Invalid log level: {level}"))?;
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str())))
}

fn output_layer(format: LogFormat, writer: BoxMakeWriter) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true);
    match format {
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => base
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => base.compact().with_writer(writer).boxed(),
    }
}

fn open_log_file(path: &str) -> anyhow::Result<Arc<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Cannot open log file {path}: {e}"))?;
    Ok(Arc::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!(LogFormat::Pretty.to_string().parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_unknown_level_is_rejected() {
        assert!(env_filter("warn").is_ok());
        assert!(env_filter("loud").is_err());

        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_log_file_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livecast.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let file = open_log_file(path.to_str().unwrap()).unwrap();
        std::io::Write::write_all(&mut &*file, b"later\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "earlier\nlater\n");

        assert!(open_log_file(dir.path().join("missing/dir/x.log").to_str().unwrap()).is_err());
    }

    #[test]
    fn test_viewer_span_names_room_and_viewer() {
        init_test_logging();
        let span = viewer_span(&RoomId::from("room1"), &ViewerId::from("v1"));
        let metadata = span.metadata().unwrap();
        assert_eq!(metadata.name(), "viewer");
        let fields: Vec<_> = metadata.fields().iter().map(|f| f.name()).collect();
        assert_eq!(fields, vec!["room_id", "viewer_id"]);
    }
}
