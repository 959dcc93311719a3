//! Small helpers used across the crate.

use std::fmt::{Debug, Display};

use clap_verbosity_flag::LevelFilter;
use log::error;

/// Initialize the global logger with the given level filter.
///
/// Called once at binary startup; library users may install their own logger
/// instead.
pub fn activate_logging(log_level: LevelFilter) {
    env_logger::Builder::new().filter_level(log_level).init();
}

/// Log the error (if any) at error-level, then pass the result through
/// unchanged.
pub trait LogOnErr {
    fn log_on_err(self) -> Self;
}

impl<T, E: Display> LogOnErr for Result<T, E> {
    fn log_on_err(self) -> Self {
        if let Err(err) = &self {
            error!("{}", err);
        }
        self
    }
}

/// Same as [LogOnErr] but additionally unwraps the result.
///
/// Meant for binary code where the error has already been surfaced via the
/// logger and there is nothing left to do but exit.
pub trait LogOnErrUnwrap<T> {
    fn log_on_err_unwrap(self) -> T;
}

impl<T, E: Display + Debug> LogOnErrUnwrap<T> for Result<T, E> {
    fn log_on_err_unwrap(self) -> T {
        self.log_on_err().unwrap()
    }
}
