//! Injected logging handle.
//!
//! Every component takes a [`Logger`] at construction instead of consulting
//! process-wide state. A logger decides locally whether an event clears the
//! configured level, then forwards it to `tracing` tagged with the component
//! name. Subscriber installation stays with the host application.

use crate::config::{ClientConfig, LogLevel};
use std::fmt;

/// Cheaply clonable, per-component logging handle.
#[derive(Clone, Debug)]
pub struct Logger {
    enabled: bool,
    level: LogLevel,
    component: &'static str,
}

impl Logger {
    /// A logger that emits nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            level: LogLevel::Error,
            component: "livequery",
        }
    }

    /// A logger emitting events at `level` and above.
    pub fn new(level: LogLevel) -> Self {
        Self {
            enabled: true,
            level,
            component: "livequery",
        }
    }

    /// Logger honoring `logging_enabled` and `log_level`.
    pub fn from_config(config: &ClientConfig) -> Self {
        if config.logging_enabled {
            Self::new(config.log_level)
        } else {
            Self::disabled()
        }
    }

    /// Same settings, tagged with a different component name.
    pub fn for_component(&self, component: &'static str) -> Self {
        Self {
            component,
            ..self.clone()
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.enabled && level >= self.level
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.is_enabled(LogLevel::Debug) {
            tracing::debug!(component = self.component, "{}", args);
        }
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        if self.is_enabled(LogLevel::Info) {
            tracing::info!(component = self.component, "{}", args);
        }
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if self.is_enabled(LogLevel::Warn) {
            tracing::warn!(component = self.component, "{}", args);
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        if self.is_enabled(LogLevel::Error) {
            tracing::error!(component = self.component, "{}", args);
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::disabled()
    }
}
