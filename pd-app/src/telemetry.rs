//! Tracing bootstrap and panic logging.

use clap::ValueEnum;
use std::any::Any;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

const DEFAULT_FILTER: &str =
    "info,pdfdesk=debug,pd_app=debug,pd_ops=debug,pd_channels=debug,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per event, with span context.
    Json,
    /// Multi-line, human readable.
    Pretty,
    /// One line per event; only span closes are reported.
    Compact,
}

impl LogFormat {
    fn span_events(self) -> FmtSpan {
        match self {
            Self::Compact => FmtSpan::CLOSE,
            Self::Json | Self::Pretty => FmtSpan::NEW | FmtSpan::CLOSE,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(format.span_events())
        .with_target(true);
    let installed = match format {
        LogFormat::Json => builder
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => builder
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
    tracing::info!(
        log_format = ?format,
        rust_log = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

/// Routes panics through tracing before the default hook prints them.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            location = %location,
            payload = panic_message(info.payload()),
            "panic"
        );
        previous(info);
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!(LogFormat::from_str("JSON", true), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_str("compact", true), Ok(LogFormat::Compact));
        assert!(LogFormat::from_str("xml", true).is_err());
    }

    #[test]
    fn panic_messages_are_extracted_from_common_payloads() {
        let borrowed: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(borrowed.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
