//! Process-wide structured logger. Built once at startup and passed down
//! explicitly — the logger is the only singleton this crate allows.

use sloggers::{Config, LoggerConfig};

pub type Logger = slog::Logger;

/// Builds the process logger from a textual level (`"trace"`, `"debug"`,
/// `"info"`, `"warning"`, `"error"`, `"critical"`) and an optional log file
/// path. When no path is given, logs go to stderr.
pub fn init(level: &str, file_path: Option<&str>) -> Logger {
    let toml = match file_path {
        Some(path) => format!(
            "type = \"file\"\nlevel = \"{}\"\npath = \"{}\"\n",
            level, path
        ),
        None => format!("type = \"terminal\"\nlevel = \"{}\"\ndestination = \"stderr\"\n", level),
    };

    let config: LoggerConfig = match serdeconv::from_toml_str(&toml) {
        Ok(c) => c,
        Err(_) => serdeconv::from_toml_str(
            "type = \"terminal\"\nlevel = \"debug\"\ndestination = \"stderr\"\n",
        )
        .expect("fallback logger config is valid"),
    };

    config.build_logger().expect("logger config builds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_falls_back_on_bad_level() {
        let log = init("not-a-real-level", None);
        slog::info!(log, "smoke test");
    }
}
