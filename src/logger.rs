use std::env;
use std::io::{stderr, Write};
use std::str::FromStr;

use anyhow::Result;
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub static LOGGER: OnceCell<StderrLogger> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "CGTETHER_LOG_LEVEL";

/// Diagnostics go to stderr only: stdout belongs to the usage text, and
/// both stdio streams double as host-liveness signals.
pub fn init() -> Result<()> {
    let level_filter = if let Ok(log_level_str) = env::var(LOG_LEVEL_ENV) {
        LevelFilter::from_str(&log_level_str).unwrap_or(LevelFilter::Warn)
    } else {
        LevelFilter::Warn
    };

    let logger = LOGGER.get_or_init(|| StderrLogger::new(level_filter.to_level()));
    log::set_logger(logger).map(|()| log::set_max_level(level_filter))?;

    Ok(())
}

pub struct StderrLogger {
    level: Option<log::Level>,
}

impl StderrLogger {
    pub fn new(level: Option<log::Level>) -> Self {
        Self { level }
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_msg = match (record.file(), record.line()) {
                (Some(file), Some(line)) => format!(
                    "[{} {}:{}] {} {}",
                    record.level(),
                    file,
                    line,
                    chrono::Local::now().to_rfc3339(),
                    record.args()
                ),
                (_, _) => format!(
                    "[{}] {} {}",
                    record.level(),
                    chrono::Local::now().to_rfc3339(),
                    record.args()
                ),
            };
            let _ = writeln!(stderr(), "{}", log_msg);
        }
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}
