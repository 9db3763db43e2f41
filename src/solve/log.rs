use std::fmt;

use serde::{Deserialize, Serialize};

/// Verbosity of a request's solution log.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Off,
    Info,
    Debug,
    Trace,
}

/// Trace of the decisions taken while answering one request, returned to the
/// caller alongside the answer. Lines are only formatted when their level is
/// enabled.
#[derive(Clone, Debug, Default)]
pub struct SolutionLog {
    level: LogLevel,
    lines: Vec<String>,
}

impl SolutionLog {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            lines: Vec::new(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Off && level <= self.level
    }

    pub fn log(&mut self, level: LogLevel, line: impl fmt::Display) {
        if self.enabled(level) {
            self.lines.push(line.to_string());
        }
    }

    pub fn info(&mut self, line: impl fmt::Display) {
        self.log(LogLevel::Info, line);
    }

    pub fn debug(&mut self, line: impl fmt::Display) {
        self.log(LogLevel::Debug, line);
    }

    pub fn trace(&mut self, line: impl fmt::Display) {
        self.log(LogLevel::Trace, line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Only between requests.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}
