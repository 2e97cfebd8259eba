//! Per-gitspace progress logging

use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Sink for the progress of one gitspace operation
pub trait GitspaceLogger: Send + Sync {
    fn info(&self, msg: &str);

    fn debug(&self, msg: &str);

    fn warn(&self, msg: &str);

    fn error(&self, msg: &str, err: &Error);
}

/// Logger forwarding to `tracing` with the gitspace instance attached
#[derive(Debug, Clone)]
pub struct TracingLogger {
    instance: String,
}

impl TracingLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }
}

impl GitspaceLogger for TracingLogger {
    fn info(&self, msg: &str) {
        info!(gitspace = %self.instance, "{}", msg);
    }

    fn debug(&self, msg: &str) {
        debug!(gitspace = %self.instance, "{}", msg);
    }

    fn warn(&self, msg: &str) {
        warn!(gitspace = %self.instance, "{}", msg);
    }

    fn error(&self, msg: &str, err: &Error) {
        error!(gitspace = %self.instance, "{}: {}", msg, err);
    }
}

/// Log `msg` with `err` and return the error wrapped with the same message
pub fn log_and_wrap(logger: &dyn GitspaceLogger, msg: &str, err: Error) -> Error {
    logger.error(msg, &err);
    err.context(msg)
}
