//! Tracing subscriber setup

use crate::config::MonitoringConfig;
use std::io;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

fn parse_level(raw: &str) -> Level {
    match raw.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. `RUST_LOG` directives are honoured on top of
/// the configured level. Returns false if a subscriber was already installed.
pub fn init_tracing(cfg: &MonitoringConfig) -> bool {
    let level = parse_level(&cfg.log_level);

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap_or_else(|_| level.into()))
        .add_directive("tower_http=info".parse().unwrap_or_else(|_| level.into()));

    let make_writer = io::stdout;

    let installed = if cfg.log_format.eq_ignore_ascii_case("json") {
        let layer = fmt::layer()
            .with_writer(make_writer)
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .json()
            .flatten_event(true);

        Registry::default().with(filter).with(layer).try_init()
    } else {
        let layer = fmt::layer()
            .with_writer(make_writer)
            .with_ansi(cfg.log_color)
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true);

        Registry::default().with(filter).with(layer).try_init()
    };

    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_second_init_is_harmless() {
        let cfg = MonitoringConfig::default();
        init_tracing(&cfg);
        assert!(!init_tracing(&cfg));
    }
}
