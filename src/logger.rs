use std::env;
use std::io::{stderr, Write};
use std::path::PathBuf;
use std::{
    fs::{File, OpenOptions},
    str::FromStr,
};

use anyhow::{bail, Result};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub static BROKER_LOGGER: OnceCell<BrokerLogger> = OnceCell::new();
pub static LOG_FILE: OnceCell<Option<File>> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "CGBROKER_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

/// Initializes the process-wide logger. Records go to `log_file` when one
/// is given, stderr otherwise; the level comes from `CGBROKER_LOG_LEVEL`
/// and defaults to `info`, so every brokered request leaves a trace.
/// `log_format` picks between the plain `text` rendering (the default)
/// and one JSON object per line.
pub fn init(log_file: Option<PathBuf>, log_format: Option<String>) -> Result<()> {
    let format = match log_format.as_deref() {
        None | Some("text") => LogFormat::Text,
        Some("json") => LogFormat::Json,
        Some(other) => bail!("unknown log format: {}", other),
    };

    let _log_file = LOG_FILE.get_or_init(|| -> Option<File> {
        let level_filter = if let Ok(level) = env::var(LOG_LEVEL_ENV) {
            LevelFilter::from_str(&level).unwrap_or(LevelFilter::Info)
        } else {
            LevelFilter::Info
        };

        let logger =
            BROKER_LOGGER.get_or_init(|| BrokerLogger::new(level_filter.to_level(), format));
        log::set_logger(logger)
            .map(|()| log::set_max_level(level_filter))
            .expect("set logger failed");

        log_file.as_ref().map(|log_file_path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file_path)
                .expect("failed opening log file")
        })
    });
    Ok(())
}

pub struct BrokerLogger {
    level: Option<log::Level>,
    format: LogFormat,
}

impl BrokerLogger {
    fn new(level: Option<log::Level>, format: LogFormat) -> Self {
        Self { level, format }
    }

    fn render(&self, record: &Record) -> String {
        let now = chrono::Local::now().to_rfc3339();
        match self.format {
            LogFormat::Text => format!("[{}] {} {}", record.level(), now, record.args()),
            LogFormat::Json => serde_json::json!({
                "level": record.level().to_string(),
                "time": now,
                "message": record.args().to_string(),
            })
            .to_string(),
        }
    }
}

impl Log for BrokerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_msg = self.render(record);
            if let Some(mut log_file) = LOG_FILE.get().unwrap().as_ref() {
                let _ = writeln!(log_file, "{}", log_msg);
            } else {
                let _ = writeln!(stderr(), "{}", log_msg);
            }
        }
    }

    fn flush(&self) {
        if let Some(mut log_file) = LOG_FILE.get().unwrap().as_ref() {
            let _ = log_file.flush();
        } else {
            let _ = stderr().flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_is_rejected() {
        assert!(init(None, Some("xml".into())).is_err());
    }

    #[test]
    fn test_json_rendering_is_one_object() {
        let logger = BrokerLogger::new(Some(log::Level::Info), LogFormat::Json);
        let record = log::Record::builder()
            .args(format_args!("listening on /sys/fs/cgroup/cgbroker/sock"))
            .level(log::Level::Info)
            .build();

        let rendered = logger.render(&record);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).expect("valid json");
        assert_eq!(parsed["level"], "INFO");
        assert_eq!(parsed["message"], "listening on /sys/fs/cgroup/cgbroker/sock");
    }

    #[test]
    fn test_text_rendering_carries_the_level() {
        let logger = BrokerLogger::new(Some(log::Level::Warn), LogFormat::Text);
        let record = log::Record::builder()
            .args(format_args!("stale socket removed"))
            .level(log::Level::Warn)
            .build();

        let rendered = logger.render(&record);
        assert!(rendered.starts_with("[WARN]"));
        assert!(rendered.ends_with("stale socket removed"));
    }
}
