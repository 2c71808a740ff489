//! Structured logging shared by every long-lived component. Nothing in here is global: callers
//! build a `Logger` once at startup (or in tests, `Logger::root(Discard, o!())`) and pass it down
//! to whatever needs to log, following it the same way a connection's `log` field does.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use serdeconv;
use sloggers::{Config, LoggerConfig};

/// Builds a terminal-backed logger at the given level (`"trace"`, `"debug"`, `"info"`, ...).
/// Falls back to `"info"` if the level string doesn't parse, since a malformed config value
/// shouldn't keep the process from logging at all.
pub fn terminal(level: &str) -> Logger {
    let toml = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );

    let config: LoggerConfig = serdeconv::from_toml_str(&toml).unwrap_or_else(|_| {
        serdeconv::from_toml_str(
            r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
        )
        .expect("built-in fallback logger config must parse")
    });

    config.build_logger().expect("terminal logger backend must build")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_builds_for_known_level() {
        let _log = terminal("debug");
    }

    #[test]
    fn terminal_falls_back_on_garbage_level() {
        let _log = terminal("not-a-real-level");
    }
}
