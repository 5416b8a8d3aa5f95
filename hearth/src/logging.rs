pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the root logger from a `sloggers` TOML fragment. Components derive
/// child loggers from the returned instance.
pub fn init(toml: Option<&str>) -> crate::Result<Logger> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml.unwrap_or(DEFAULT_CONFIG))
        .map_err(|err| crate::Status::invalid_argument("logging init", err.to_string()))?;

    config
        .build_logger()
        .map_err(|err| crate::Status::invalid_argument("logging init", err.to_string()))
}

/// Builds the root logger from an already-parsed configuration, e.g. the
/// `[log]` table of the server configuration file.
pub fn build(config: &LoggerConfig) -> crate::Result<Logger> {
    config
        .build_logger()
        .map_err(|err| crate::Status::invalid_argument("logging init", err.to_string()))
}

/// Logger that swallows everything. Used by tests and as the fallback when a
/// component is constructed without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        init(None).unwrap();
    }

    #[test]
    fn test_null_config_builds() {
        init(Some("type = \"null\"")).unwrap();
    }

    #[test]
    fn test_bad_config_is_invalid_argument() {
        let err = init(Some("type = \"no-such-sink\"")).unwrap_err();
        match err {
            crate::Status::InvalidArgument(ctx, _) => assert_eq!(ctx, "logging init"),
            status => panic!("unexpected status {:?}", status),
        }
    }
}
