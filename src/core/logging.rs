use std::fmt::Display;
use log::{Level, LevelFilter};

/// Logging handle passed explicitly through the orchestrator, groups and
/// modules. Each holder logs under its own target and drops messages below
/// its level before they reach the global logger.
#[derive(Debug, Clone)]
pub struct LogHandle {
    target: String,
    level: LevelFilter,
}

impl LogHandle {
    pub fn new(target: &str, level: LevelFilter) -> Self {
        Self { target: target.to_string(), level }
    }

    /// A handle that discards everything.
    pub fn silent() -> Self {
        Self::new("rteval", LevelFilter::Off)
    }

    /// Child handle logging under `<target>::<name>` at the same level.
    pub fn scoped(&self, name: &str) -> Self {
        Self { target: format!("{}::{}", self.target, name), level: self.level }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    pub fn log(&self, level: Level, message: impl Display) {
        if self.enabled(level) {
            log::log!(target: self.target.as_str(), level, "{}", message);
        }
    }

    pub fn error(&self, message: impl Display) {
        self.log(Level::Error, message);
    }

    pub fn warn(&self, message: impl Display) {
        self.log(Level::Warn, message);
    }

    pub fn info(&self, message: impl Display) {
        self.log(Level::Info, message);
    }

    pub fn debug(&self, message: impl Display) {
        self.log(Level::Debug, message);
    }
}
