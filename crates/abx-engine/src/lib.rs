//! Embedded scripting runtime for the abx ad blocker.
//!
//! The filtering logic itself lives in a JavaScript payload; this crate owns
//! the QuickJS embedding around it: the [`Environment`] (one runtime +
//! context per blocker instance), retained value handles, the async worker
//! threads behind `setTimeout`/`fileSystem`/`webRequest`, and the pluggable
//! capability providers those workers call into.

mod env;
mod error;
mod globals;
mod value;
mod workers;

pub mod fs;
pub mod log;
pub mod web;

pub use env::{CallArg, Environment, EnvironmentId, EventCallback};
pub use error::{EngineError, ScriptError};
pub use value::{JsSnapshot, JsValueHandle};
