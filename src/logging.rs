//! Logging setup and the per-worker logger handed to handlers.

use log::Level;
use std::fmt;
use std::sync::Arc;

const TARGET: &str = "rabbitmq_worker_pool::worker";

/// Installs `env_logger` as the global logger. `RUST_LOG` wins over
/// `default_filter` when set.
///
/// Fails if a logger is already installed.
pub fn init_logging(default_filter: &str) -> Result<(), log::SetLoggerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).try_init()
}

/// Writes to the `log` facade with the worker's name in front of every line.
#[derive(Clone)]
pub struct Logger {
    name: Arc<str>,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        log::log!(target: TARGET, level, "[{}] {}", self.name, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Logger").field(&self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_keeps_its_name() {
        let logger = Logger::new("worker-3");
        let copy = logger.clone();
        assert_eq!(copy.name(), "worker-3");
        copy.info(format_args!("no logger installed, still fine"));
    }

    #[test]
    fn second_init_fails() {
        let _ = init_logging("debug");
        assert!(init_logging("info").is_err());
    }
}
