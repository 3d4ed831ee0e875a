//! Context Environment: one engine runtime + context, the host-side event
//! map, the worker set and the capability providers.
//!
//! Native callbacks find their environment through an explicit registry
//! keyed by a process-unique id; the id is stored in a hidden global of the
//! managed context. `Context::with` doubles as the engine lock and the
//! context-activation scope, so every entry point here enters it fresh and
//! never nests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rquickjs::function::Args;
use rquickjs::{CatchResultExt, Context, Ctx, Runtime, Value};

use crate::error::{EngineError, ScriptError};
use crate::fs::{DefaultFileSystem, FileSystem};
use crate::globals;
use crate::log::{DefaultLogSink, LogSink};
use crate::value::{snapshot_value, JsSnapshot, JsValueHandle};
use crate::web::{DefaultHttpClient, HttpClient};
use crate::workers::{WorkerHandle, WorkerId};

pub type EnvironmentId = u64;

/// Host-side event handler. Receives plain-data snapshots only; no engine
/// value ever crosses this boundary, so handlers cannot re-enter the engine
/// by accident or retain values past the environment's life.
pub type EventCallback = Arc<dyn Fn(&[JsSnapshot]) + Send + Sync>;

/// Hidden context global holding the environment id.
const ENV_ID_GLOBAL: &str = "__abxEnvId";

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<EnvironmentId, Weak<EnvInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<EnvironmentId, Weak<EnvInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) struct EnvInner {
    id: EnvironmentId,
    context: Context,
    // Keeps the engine alive as long as the context; dropped last.
    _runtime: Runtime,
    events: Mutex<HashMap<String, EventCallback>>,
    pub(crate) workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
    next_worker_id: AtomicU32,
    fs: Mutex<Option<Arc<dyn FileSystem>>>,
    log: Mutex<Option<Arc<dyn LogSink>>>,
    http: Mutex<Option<Arc<dyn HttpClient>>>,
    disposed: AtomicBool,
}

impl EnvInner {
    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn allocate_worker_id(&self) -> WorkerId {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Cancels every registered worker, then joins them all. Joining happens
    /// outside any lock and outside any context entry.
    fn teardown_workers(&self) {
        let drained: Vec<WorkerHandle> = self
            .workers
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &drained {
            handle.cancel.cancel();
        }
        for mut handle in drained {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        registry().lock().remove(&self.id);
        if !self.disposed.swap(true, Ordering::SeqCst) {
            // dispose() was never called; run the same teardown so no
            // worker can outlive the runtime it points into.
            self.teardown_workers();
        }
    }
}

/// A marshalled argument for [`Environment::call_entry`].
#[derive(Debug, Clone)]
pub enum CallArg {
    Str(String),
    Bool(bool),
}

impl From<&str> for CallArg {
    fn from(s: &str) -> Self {
        CallArg::Str(s.to_string())
    }
}

impl From<String> for CallArg {
    fn from(s: String) -> Self {
        CallArg::Str(s)
    }
}

impl From<bool> for CallArg {
    fn from(b: bool) -> Self {
        CallArg::Bool(b)
    }
}

/// Handle to one scripting environment. Cheap to clone; the last clone (and
/// the last finished worker) tears the engine down.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    /// Creates a fresh runtime + context, registers it and installs the
    /// native globals.
    pub fn new() -> Result<Self, EngineError> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;
        let id = NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(EnvInner {
            id,
            context,
            _runtime: runtime,
            events: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            next_worker_id: AtomicU32::new(0),
            fs: Mutex::new(None),
            log: Mutex::new(None),
            http: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        registry().lock().insert(id, Arc::downgrade(&inner));
        let env = Environment { inner };
        env.inner.context.with(|ctx| -> Result<(), EngineError> {
            ctx.globals().set(ENV_ID_GLOBAL, id as f64)?;
            globals::install(&ctx)?;
            Ok(())
        })?;
        Ok(env)
    }

    /// Resolves the environment owning the active context. `None` for a
    /// context this crate does not manage, or after dispose.
    pub fn current(ctx: &Ctx<'_>) -> Option<Environment> {
        let id: f64 = ctx.globals().get(ENV_ID_GLOBAL).ok()?;
        let inner = registry().lock().get(&(id as EnvironmentId))?.upgrade()?;
        Some(Environment { inner })
    }

    pub fn id(&self) -> EnvironmentId {
        self.inner.id
    }

    pub(crate) fn inner(&self) -> &Arc<EnvInner> {
        &self.inner
    }

    pub(crate) fn make_handle<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> JsValueHandle {
        JsValueHandle::new(ctx, self.inner.context.clone(), value)
    }

    /// Compiles and runs `source`. `origin` names the script in error
    /// reports.
    pub fn evaluate(&self, source: &str, origin: &str) -> Result<JsValueHandle, EngineError> {
        self.ensure_live()?;
        self.inner.context.with(|ctx| {
            match ctx.eval::<Value, _>(source).catch(&ctx) {
                Ok(value) => Ok(self.make_handle(&ctx, value)),
                Err(caught) => {
                    Err(ScriptError::from_caught(&ctx, caught, origin, Some(source)).into())
                }
            }
        })
    }

    /// Evaluates an entry-point expression, requires it to be callable, and
    /// calls it with the global object as receiver. The whole sequence runs
    /// in a single context entry; the result comes back as a snapshot.
    pub fn call_entry(&self, entry: &str, args: &[CallArg]) -> Result<JsSnapshot, EngineError> {
        self.ensure_live()?;
        self.inner.context.with(|ctx| {
            let target: Value = ctx
                .eval::<Value, _>(entry)
                .catch(&ctx)
                .map_err(|caught| ScriptError::from_caught(&ctx, caught, entry, None))?;
            let function = target.into_function().ok_or(EngineError::NotCallable)?;
            let mut call_args = Args::new(ctx.clone(), args.len());
            call_args.this(ctx.globals())?;
            for arg in args {
                match arg {
                    CallArg::Str(s) => call_args.push_arg(s.as_str())?,
                    CallArg::Bool(b) => call_args.push_arg(*b)?,
                }
            }
            let result: Value = function
                .call_arg(call_args)
                .catch(&ctx)
                .map_err(|caught| ScriptError::from_caught(&ctx, caught, entry, None))?;
            Ok(snapshot_value(&ctx, &result))
        })
    }

    /// Registers (or replaces) the host handler for `name`.
    pub fn set_event_callback(&self, name: &str, callback: EventCallback) {
        self.inner.events.lock().insert(name.to_string(), callback);
    }

    /// Removes the handler for `name`; removing an absent name is a no-op.
    pub fn remove_event_callback(&self, name: &str) {
        self.inner.events.lock().remove(name);
    }

    /// Invokes the handler for `name`, if any. The handler runs outside the
    /// event-map lock, so it may remove or replace itself.
    pub fn trigger_event(&self, name: &str, args: &[JsSnapshot]) {
        let callback = self.inner.events.lock().get(name).cloned();
        if let Some(callback) = callback {
            callback(args);
        }
    }

    pub fn file_system(&self) -> Arc<dyn FileSystem> {
        let mut slot = self.inner.fs.lock();
        slot.get_or_insert_with(|| Arc::new(DefaultFileSystem::new()))
            .clone()
    }

    pub fn set_file_system(&self, fs: Arc<dyn FileSystem>) {
        *self.inner.fs.lock() = Some(fs);
    }

    pub fn log_sink(&self) -> Arc<dyn LogSink> {
        let mut slot = self.inner.log.lock();
        slot.get_or_insert_with(|| Arc::new(DefaultLogSink::new()))
            .clone()
    }

    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        *self.inner.log.lock() = Some(sink);
    }

    pub fn http_client(&self) -> Arc<dyn HttpClient> {
        let mut slot = self.inner.http.lock();
        slot.get_or_insert_with(|| Arc::new(DefaultHttpClient::new()))
            .clone()
    }

    pub fn set_http_client(&self, client: Arc<dyn HttpClient>) {
        *self.inner.http.lock() = Some(client);
    }

    /// Tears the environment down: marks it disposed, cancels and joins all
    /// workers, unregisters the id. Calling twice is an error.
    pub fn dispose(&self) -> Result<(), EngineError> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        self.inner.teardown_workers();
        registry().lock().remove(&self.inner.id);
        self.inner.context.with(|ctx| {
            let _ = ctx.globals().set(ENV_ID_GLOBAL, rquickjs::Undefined);
        });
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.inner.is_disposed() {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }
}
