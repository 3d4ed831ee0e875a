//! Engine value handles and plain-data snapshots.
//!
//! A [`JsValueHandle`] keeps a script value alive across context entries: a
//! cloned `Context` (which holds the runtime) plus a `Persistent` reference
//! the engine GC tracks. Every accessor enters the owning context itself, so
//! the "only while the context is active" rule holds by construction.

use rquickjs::convert::Coerced;
use rquickjs::function::Args;
use rquickjs::{CatchResultExt, Context, Ctx, FromJs, Persistent, Type, Value};

use crate::error::{EngineError, ScriptError};

/// A retained reference to a script value.
#[derive(Clone)]
pub struct JsValueHandle {
    context: Context,
    value: Persistent<Value<'static>>,
}

impl std::fmt::Debug for JsValueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsValueHandle").finish_non_exhaustive()
    }
}

impl JsValueHandle {
    pub(crate) fn new<'js>(ctx: &Ctx<'js>, context: Context, value: Value<'js>) -> Self {
        Self {
            context,
            value: Persistent::save(ctx, value),
        }
    }

    /// Restores the underlying value inside an active entry of the owning
    /// context.
    pub(crate) fn restore_in<'js>(&self, ctx: &Ctx<'js>) -> Result<Value<'js>, EngineError> {
        self.value.clone().restore(ctx).map_err(EngineError::from)
    }

    /// Calls the value as a function with the global object as receiver.
    pub fn call(&self, args: &[JsValueHandle]) -> Result<JsValueHandle, EngineError> {
        self.context.with(|ctx| {
            let value = self.restore_in(&ctx)?;
            let function = value.into_function().ok_or(EngineError::NotCallable)?;
            let mut call_args = Args::new(ctx.clone(), args.len());
            call_args.this(ctx.globals())?;
            for arg in args {
                call_args.push_arg(arg.restore_in(&ctx)?)?;
            }
            let result: Value = function
                .call_arg(call_args)
                .catch(&ctx)
                .map_err(|caught| ScriptError::from_caught(&ctx, caught, "callback", None))?;
            Ok(JsValueHandle::new(&ctx, self.context.clone(), result))
        })
    }

    pub fn is_callable(&self) -> bool {
        self.context.with(|ctx| {
            self.restore_in(&ctx)
                .map(|v| v.is_function())
                .unwrap_or(false)
        })
    }

    /// JS truthiness of the value.
    pub fn to_bool(&self) -> bool {
        self.context.with(|ctx| {
            self.restore_in(&ctx)
                .map(|v| is_truthy(&v))
                .unwrap_or(false)
        })
    }

    /// String coercion; a value that refuses to coerce comes back empty.
    pub fn to_string_lossy(&self) -> String {
        self.context.with(|ctx| {
            self.restore_in(&ctx)
                .ok()
                .and_then(|v| coerce_string(&ctx, &v))
                .unwrap_or_default()
        })
    }

    /// Detaches a plain-data image of the value.
    pub fn snapshot(&self) -> JsSnapshot {
        self.context.with(|ctx| match self.restore_in(&ctx) {
            Ok(value) => snapshot_value(&ctx, &value),
            Err(_) => JsSnapshot::Undefined,
        })
    }
}

/// Plain-data image of an engine value. Objects and arrays are carried as
/// their compact-JSON rendering; anything that cannot be serialized (a
/// function, a cyclic object) collapses to `Undefined`.
#[derive(Debug, Clone, PartialEq)]
pub enum JsSnapshot {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Json(String),
}

impl JsSnapshot {
    pub fn truthy(&self) -> bool {
        match self {
            JsSnapshot::Undefined | JsSnapshot::Null => false,
            JsSnapshot::Bool(b) => *b,
            JsSnapshot::Number(n) => *n != 0.0 && !n.is_nan(),
            JsSnapshot::String(s) => !s.is_empty(),
            JsSnapshot::Json(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsSnapshot::String(s) | JsSnapshot::Json(s) => Some(s),
            _ => None,
        }
    }
}

pub(crate) fn is_truthy(value: &Value<'_>) -> bool {
    match value.type_of() {
        Type::Uninitialized | Type::Undefined | Type::Null => false,
        Type::Bool => value.as_bool().unwrap_or(false),
        Type::Int => value.as_int().unwrap_or(0) != 0,
        Type::Float => {
            let f = value.as_float().unwrap_or(0.0);
            f != 0.0 && !f.is_nan()
        }
        Type::String => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .map(|s| !s.is_empty())
            .unwrap_or(false),
        _ => true,
    }
}

pub(crate) fn coerce_string<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<String> {
    Coerced::<String>::from_js(ctx, value.clone()).ok().map(|c| c.0)
}

pub(crate) fn snapshot_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> JsSnapshot {
    match value.type_of() {
        Type::Uninitialized | Type::Undefined => JsSnapshot::Undefined,
        Type::Null => JsSnapshot::Null,
        Type::Bool => JsSnapshot::Bool(value.as_bool().unwrap_or(false)),
        Type::Int => JsSnapshot::Number(value.as_int().unwrap_or(0) as f64),
        Type::Float => JsSnapshot::Number(value.as_float().unwrap_or(f64::NAN)),
        Type::String => JsSnapshot::String(
            value
                .as_string()
                .and_then(|s| s.to_string().ok())
                .unwrap_or_default(),
        ),
        _ => match ctx.json_stringify(value.clone()) {
            Ok(Some(json)) => match json.to_string() {
                Ok(json) => JsSnapshot::Json(json),
                Err(_) => JsSnapshot::Undefined,
            },
            _ => JsSnapshot::Undefined,
        },
    }
}
