pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger. Binaries call this once at startup and
/// hand child loggers down to the library objects they create.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Malformed logger config");

    config.build_logger().expect("Logger construction failed")
}

/// A root logger that swallows everything. Default for library objects
/// constructed without an explicit parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
