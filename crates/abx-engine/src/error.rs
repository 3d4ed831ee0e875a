//! Error types for the engine embedding.

use std::fmt;

use rquickjs::{CaughtError, Ctx};

use crate::value::coerce_string;

/// A script exception mapped to plain data.
///
/// Carries everything the engine reports about the throw site plus the
/// offending source line sliced out of the evaluated text when the engine
/// gives us a line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    /// Script name or synthetic origin the source was evaluated under.
    pub origin: String,
    /// 1-based line number of the throw site, when the engine reports one.
    pub line: Option<u32>,
    /// The exception message (or the stringified thrown value).
    pub message: String,
    /// The source line at `line`, when the evaluated source is known.
    pub source_line: Option<String>,
    /// Engine stack trace, when available.
    pub stack: Option<String>,
}

impl ScriptError {
    /// Builds a `ScriptError` from a caught engine error. Must be called
    /// while the throwing context is still active.
    pub(crate) fn from_caught<'js>(
        ctx: &Ctx<'js>,
        caught: CaughtError<'js>,
        origin: &str,
        source: Option<&str>,
    ) -> Self {
        let mut err = ScriptError {
            origin: origin.to_string(),
            line: None,
            message: String::new(),
            source_line: None,
            stack: None,
        };
        match caught {
            CaughtError::Exception(exception) => {
                err.message = exception
                    .message()
                    .unwrap_or_else(|| "uncaught exception".to_string());
                err.stack = exception.stack().filter(|s| !s.is_empty());
                // The engine reports the throw site only through the
                // backtrace; frames read `at <func> (<file>:<line>:<col>)`.
                if let Some((file, line)) = err.stack.as_deref().and_then(throw_site) {
                    // Bare evals run under the engine's synthetic
                    // `eval_script` name; the caller-supplied origin is the
                    // better label for those.
                    if file != "eval_script" {
                        err.origin = file;
                    }
                    err.line = Some(line);
                }
            }
            CaughtError::Value(value) => {
                err.message = coerce_string(ctx, &value)
                    .unwrap_or_else(|| "uncaught value".to_string());
            }
            CaughtError::Error(error) => {
                err.message = error.to_string();
            }
        }
        if let (Some(line), Some(source)) = (err.line, source) {
            err.source_line = source
                .lines()
                .nth(line.saturating_sub(1) as usize)
                .map(|l| l.to_string());
        }
        err
    }
}

/// Extracts `(file, line)` from the first located frame of an engine
/// backtrace. Native frames carry no location and are skipped.
fn throw_site(stack: &str) -> Option<(String, u32)> {
    for frame in stack.lines() {
        let frame = frame.trim();
        let frame = frame.strip_prefix("at ").unwrap_or(frame);
        let location = match (frame.rfind('('), frame.rfind(')')) {
            (Some(open), Some(close)) if open < close => &frame[open + 1..close],
            _ => frame,
        };
        if location.is_empty() || location == "native" {
            continue;
        }
        if let Some(parsed) = parse_location(location) {
            return Some(parsed);
        }
    }
    None
}

/// Splits `file:line` or `file:line:column`. The file part may itself
/// contain colons, so numbers are peeled off the right-hand end.
fn parse_location(location: &str) -> Option<(String, u32)> {
    let segments: Vec<&str> = location.split(':').collect();
    let mut end = segments.len();
    let mut numbers: Vec<u32> = Vec::new();
    while end > 1 && numbers.len() < 2 {
        match segments[end - 1].parse() {
            Ok(n) => {
                numbers.push(n);
                end -= 1;
            }
            Err(_) => break,
        }
    }
    let line = *numbers.last()?;
    Some((segments[..end].join(":"), line))
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.origin, line, self.message)?,
            None => write!(f, "{}: {}", self.origin, self.message)?,
        }
        if let Some(source_line) = &self.source_line {
            write!(f, "\n  {}", source_line.trim())?;
        }
        if let Some(stack) = &self.stack {
            write!(f, "\n{}", stack.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Errors surfaced by the embedding layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A script threw; details preserved as plain data.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// A value was called (or requested as an entry point) but is not a
    /// function.
    #[error("value is not callable")]
    NotCallable,

    /// The environment was already disposed.
    #[error("environment is disposed")]
    Disposed,

    /// Engine-internal failure outside script execution.
    #[error("engine error: {0}")]
    Engine(String),
}

impl From<rquickjs::Error> for EngineError {
    fn from(err: rquickjs::Error) -> Self {
        EngineError::Engine(err.to_string())
    }
}
