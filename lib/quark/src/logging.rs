pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the root logger from a TOML `LoggerConfig` snippet. Falls back to
/// a discarding logger when the configuration cannot be parsed or built, so
/// a broken logging setup never takes the process down with it.
pub fn root(config: Option<&str>) -> Logger {
    let toml = config.unwrap_or(DEFAULT_CONFIG);

    let parsed: Result<LoggerConfig, _> = serdeconv::from_toml_str(toml);

    match parsed.map(|config| config.build_logger()) {
        Ok(Ok(logger)) => logger,
        _ => discard(),
    }
}

/// A logger that swallows all records. Used by tests and by components
/// constructed without an explicit logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_default_config() {
        let log = root(None);
        info!(log, "logger constructed"; "context" => "test");
    }

    #[test]
    fn test_root_custom_config() {
        let log = root(Some(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        ));
        debug!(log, "custom logger constructed");
    }

    #[test]
    fn test_root_broken_config_falls_back() {
        let log = root(Some("type = \"no-such-logger\""));
        info!(log, "fallback logger still works");
    }
}
