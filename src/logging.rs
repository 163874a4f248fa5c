use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("BF915_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Initialize stderr logging for the CLI based on `BF915_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str());
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use self::python::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python {
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;

    use super::env_level;

    static BRIDGE: OnceCell<&'static PyLogBridge> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(<target>)`, with `::`
    /// replaced by `.` so module paths nest like Python logger names.
    struct PyLogBridge {
        level: Mutex<LevelFilter>,
    }

    impl PyLogBridge {
        fn level(&self) -> LevelFilter {
            self.level
                .lock()
                .map(|l| *l)
                .unwrap_or(LevelFilter::Info)
        }

        fn py_level(level: Level) -> u32 {
            match level {
                Level::Error => 40,
                Level::Warn => 30,
                Level::Info => 20,
                Level::Debug => 10,
                Level::Trace => 5,
            }
        }
    }

    impl Log for PyLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let target = record.target().replace("::", ".");
            let message = record.args().to_string();
            let level = Self::py_level(record.level());

            Python::attach(|py| {
                let result = py
                    .import("logging")
                    .and_then(|logging| logging.call_method1("getLogger", (target.as_str(),)))
                    .and_then(|logger| logger.call_method1("log", (level, message.as_str())));
                // a broken logging setup must not turn into a Python exception here
                drop(result);
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Only the first call installs
    /// the bridge.
    pub fn init_python_logging(_py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        BRIDGE.get_or_init(|| {
            let bridge: &'static PyLogBridge = Box::leak(Box::new(PyLogBridge {
                level: Mutex::new(level),
            }));
            if log::set_logger(bridge).is_ok() {
                log::set_max_level(level);
            }
            bridge
        });
        Ok(())
    }

    /// Change the minimum level forwarded to Python.
    pub fn set_python_log_level(level: LevelFilter) {
        if let Some(bridge) = BRIDGE.get() {
            if let Ok(mut current) = bridge.level.lock() {
                *current = level;
            }
        }
        log::set_max_level(level);
    }
}

/// Parse a level name, falling back to `BF915_LOG`/`RUST_LOG` and then `info`.
pub fn parse_level_or_env(input: Option<&str>) -> LevelFilter {
    input
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or_else(env_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_env() {
        assert_eq!(parse_level_or_env(Some("loud")), env_level());
        assert_eq!(parse_level_or_env(None), env_level());
    }

    #[test]
    fn explicit_level_wins_over_env() {
        assert_eq!(parse_level_or_env(Some("debug")), LevelFilter::Debug);
        assert_eq!(parse_level_or_env(Some("WARN")), LevelFilter::Warn);
    }
}
