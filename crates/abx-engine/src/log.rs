//! Log-sink capability provider backing the script-facing `console` object.

use parking_lot::Mutex;

/// Severity of a `console` write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Log,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Trace => "",
            LogLevel::Log => "",
            LogLevel::Info => "[Info] ",
            LogLevel::Warn => "[Warning] ",
            LogLevel::Error => "[Error] ",
        }
    }
}

/// Receives `console` output. `source` is the caller tag (`[file:line]`) or
/// empty when unknown.
pub trait LogSink: Send + Sync {
    fn write(&self, level: LogLevel, message: &str, source: &str);
}

/// Default sink: one line per write to stderr, serialized with a mutex so
/// concurrent workers never interleave output.
pub struct DefaultLogSink {
    guard: Mutex<()>,
}

impl DefaultLogSink {
    pub fn new() -> Self {
        Self {
            guard: Mutex::new(()),
        }
    }
}

impl Default for DefaultLogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for DefaultLogSink {
    fn write(&self, level: LogLevel, message: &str, source: &str) {
        let mut line = String::new();
        if !source.is_empty() {
            line.push_str(source);
            line.push(' ');
        }
        line.push_str(level.prefix());
        line.push_str(message);
        let _guard = self.guard.lock();
        eprintln!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_carry_distinct_prefixes() {
        assert_eq!(LogLevel::Info.prefix(), "[Info] ");
        assert_eq!(LogLevel::Warn.prefix(), "[Warning] ");
        assert_eq!(LogLevel::Error.prefix(), "[Error] ");
        assert_eq!(LogLevel::Log.prefix(), "");
    }
}
