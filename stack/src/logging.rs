//! Logging configuration for the supervisor daemon.

use log::LevelFilter;
use syslog::{BasicLogger, Error, Facility, Formatter3164};

use log_panics;

/// API to inspect and modify the daemon log level.
pub trait ILogging {
    /// Check whether debug logging is enabled.
    fn is_debug_enabled(&self) -> bool;

    /// Change whether debug logging is enabled.
    fn set_debug_logging(&mut self, enabled: bool);
}

/// Logging related implementation.
pub struct Logging {
    is_debug: bool,

    /// Log to stderr?
    is_stderr: bool,

    /// Is logging already initialized?
    is_initialized: bool,
}

impl Logging {
    pub fn new(is_debug: bool, log_output: &str) -> Self {
        Self { is_debug, is_stderr: log_output == "stderr", is_initialized: false }
    }

    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.is_stderr {
            env_logger::Builder::new().filter(None, self.get_log_level_filter()).init();
        } else {
            let formatter = Formatter3164 {
                facility: Facility::LOG_USER,
                hostname: None,
                process: "wearconnd".into(),
                pid: 0,
            };

            let logger = syslog::unix(formatter)?;
            let _ = log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
                .map(|()| self.apply_log_level());
            log_panics::init();
        }

        self.is_initialized = true;
        Ok(())
    }

    fn get_log_level_filter(&self) -> LevelFilter {
        match self.is_debug {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        }
    }

    fn apply_log_level(&self) {
        log::set_max_level(self.get_log_level_filter());
    }
}

impl ILogging for Logging {
    fn is_debug_enabled(&self) -> bool {
        self.is_initialized && self.is_debug
    }

    fn set_debug_logging(&mut self, enabled: bool) {
        if !self.is_initialized {
            return;
        }

        self.is_debug = enabled;
        self.apply_log_level();
        log::info!("Setting debug logging to {}", enabled);
    }
}
