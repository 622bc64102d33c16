pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger used by example binaries and tests.
/// Library objects never call this themselves - they take a parent logger
/// (or `None`) at construction.
pub fn init() -> Logger {
    build(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
}

/// Builds a logger from a TOML snippet in the `sloggers` config format.
pub fn build(toml: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(toml).expect("logging config must parse");
    config.build_logger().expect("failed to build the logger")
}

/// Derives a child logger from an optional parent, falling back to a
/// discarding root.
pub fn child<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        _ => Logger::root(Discard, o!()),
    }
}
