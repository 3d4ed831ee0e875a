//! Async worker framework.
//!
//! Every `setTimeout`, file-system and HTTP request from script land spawns
//! one OS thread, registered in the owning environment's worker set. A
//! worker carries only its id, a `Weak` reference to the environment and
//! plain request data; the script callback (and any extra arguments) never
//! leave the engine. They are stashed in a hidden context object keyed by
//! worker id and reclaimed when the worker re-enters the context to deliver
//! its result. Cancellation is a flag+condvar token; the token is re-checked
//! inside the completion context entry so a cancel that races the wakeup
//! still suppresses the callback.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rquickjs::function::Args;
use rquickjs::{Array, CatchResultExt, Ctx, Object, Value};

use crate::env::{EnvInner, Environment};
use crate::error::{EngineError, ScriptError};

pub(crate) type WorkerId = u32;

/// Hidden context global mapping worker id to `[callback, extraArgs...]`.
pub(crate) const WORKER_STASH_GLOBAL: &str = "__abxWorkerStash";

/// Cooperative cancellation flag shared between the environment and one
/// worker thread.
pub(crate) struct CancelToken {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Sleeps until cancelled or until `timeout` elapses. Returns whether
    /// the token was cancelled.
    fn wait_cancelled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let _ = self.cond.wait_for(&mut cancelled, deadline - now);
        }
        *cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerKind {
    Timer,
    Io,
    Http,
}

pub(crate) struct WorkerHandle {
    pub(crate) kind: WorkerKind,
    pub(crate) cancel: Arc<CancelToken>,
    pub(crate) join: Option<JoinHandle<()>>,
}

/// A file-system request captured on the script thread, executed on the
/// worker thread.
pub(crate) enum FsJob {
    Read { path: String },
    Write { path: String, data: String },
    Remove { path: String },
    Move { from: String, to: String },
    Stat { path: String },
}

enum FsOutcome {
    /// `read`: content or error text.
    Read(Result<String, String>),
    /// `write`/`remove`/`move`: error text, empty on success.
    Simple(String),
    /// `stat`: stat record or error text.
    Stat(Result<crate::fs::FileStat, String>),
}

impl Environment {
    pub(crate) fn spawn_timer<'js>(
        &self,
        ctx: &Ctx<'js>,
        delay_ms: f64,
        callback: Value<'js>,
        extra_args: Vec<Value<'js>>,
    ) -> Result<WorkerId, EngineError> {
        // Delays coerce to a bounded integer range so the deadline
        // arithmetic cannot overflow.
        let delay = Duration::from_millis(delay_ms.clamp(0.0, i32::MAX as f64) as u64);
        self.launch(
            ctx,
            WorkerKind::Timer,
            callback,
            extra_args,
            move |weak, cancel, id| {
                if cancel.wait_cancelled(delay) {
                    return;
                }
                deliver(weak, cancel, id, run_callback);
            },
        )
    }

    pub(crate) fn spawn_fs<'js>(
        &self,
        ctx: &Ctx<'js>,
        job: FsJob,
        callback: Value<'js>,
    ) -> Result<WorkerId, EngineError> {
        let provider = self.file_system();
        self.launch(
            ctx,
            WorkerKind::Io,
            callback,
            Vec::new(),
            move |weak, cancel, id| {
                let outcome = match &job {
                    FsJob::Read { path } => {
                        FsOutcome::Read(provider.read(path).map_err(|e| e.to_string()))
                    }
                    FsJob::Write { path, data } => FsOutcome::Simple(
                        provider
                            .write(path, data)
                            .err()
                            .map(|e| e.to_string())
                            .unwrap_or_default(),
                    ),
                    FsJob::Remove { path } => FsOutcome::Simple(match provider.remove(path) {
                        Ok(true) => String::new(),
                        Ok(false) => format!("cannot remove \"{path}\": no such file"),
                        Err(e) => e.to_string(),
                    }),
                    FsJob::Move { from, to } => FsOutcome::Simple(
                        provider
                            .rename(from, to)
                            .err()
                            .map(|e| e.to_string())
                            .unwrap_or_default(),
                    ),
                    FsJob::Stat { path } => {
                        FsOutcome::Stat(provider.stat(path).map_err(|e| e.to_string()))
                    }
                };
                deliver(weak, cancel, id, move |ctx, callback, _extra| {
                    let arg = fs_outcome_value(ctx, outcome)?;
                    run_callback(ctx, callback, vec![arg])
                });
            },
        )
    }

    pub(crate) fn spawn_http<'js>(
        &self,
        ctx: &Ctx<'js>,
        url: String,
        headers: Vec<(String, String)>,
        callback: Value<'js>,
    ) -> Result<WorkerId, EngineError> {
        let provider = self.http_client();
        self.launch(
            ctx,
            WorkerKind::Http,
            callback,
            Vec::new(),
            move |weak, cancel, id| {
                let response = provider.get(&url, &headers);
                deliver(weak, cancel, id, move |ctx, callback, _extra| {
                    let obj = Object::new(ctx.clone())?;
                    obj.set("status", response.status.code() as f64)?;
                    obj.set("responseStatus", response.response_status as i32)?;
                    obj.set("responseText", response.response_text.as_str())?;
                    let header_list = Array::new(ctx.clone())?;
                    for (i, (name, value)) in response.response_headers.iter().enumerate() {
                        let pair = Array::new(ctx.clone())?;
                        pair.set(0, name.as_str())?;
                        pair.set(1, value.as_str())?;
                        header_list.set(i, pair)?;
                    }
                    obj.set("responseHeaders", header_list)?;
                    run_callback(ctx, callback, vec![obj.into_value()])
                });
            },
        )
    }

    /// Cancels a timer worker, drops its stashed callback and forgets it.
    /// Non-timer ids are ignored, as are ids of workers that already
    /// finished. Never joins; joining here would deadlock against a worker
    /// waiting for the engine lock the calling script holds.
    pub(crate) fn cancel_timer(&self, ctx: &Ctx<'_>, id: WorkerId) {
        let cancel = {
            let workers = self.inner().workers.lock();
            workers
                .get(&id)
                .filter(|handle| handle.kind == WorkerKind::Timer)
                .map(|handle| handle.cancel.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
            self.inner().workers.lock().remove(&id);
            stash_remove(ctx, id);
        }
    }

    fn launch<'js, F>(
        &self,
        ctx: &Ctx<'js>,
        kind: WorkerKind,
        callback: Value<'js>,
        extra: Vec<Value<'js>>,
        body: F,
    ) -> Result<WorkerId, EngineError>
    where
        F: FnOnce(&Weak<EnvInner>, &CancelToken, WorkerId) + Send + 'static,
    {
        let inner = self.inner();
        let id = inner.allocate_worker_id();
        stash_insert(ctx, id, callback, extra)?;
        let cancel = CancelToken::new();
        // Register before spawning so the worker can always find (and
        // remove) its own entry when it finishes first.
        inner.workers.lock().insert(
            id,
            WorkerHandle {
                kind,
                cancel: cancel.clone(),
                join: None,
            },
        );
        let weak = Arc::downgrade(inner);
        let thread_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("abx-worker-{id}"))
            .spawn(move || {
                body(&weak, &thread_cancel, id);
                if let Some(inner) = weak.upgrade() {
                    inner.workers.lock().remove(&id);
                }
            });
        match spawned {
            Ok(join) => {
                if let Some(handle) = inner.workers.lock().get_mut(&id) {
                    handle.join = Some(join);
                }
                Ok(id)
            }
            Err(e) => {
                inner.workers.lock().remove(&id);
                stash_remove(ctx, id);
                Err(EngineError::Engine(format!(
                    "failed to spawn worker thread: {e}"
                )))
            }
        }
    }
}

/// Enters the environment's context, reclaims the worker's stashed callback
/// and invokes the completion closure, unless the environment died or the
/// worker was cancelled in the meantime.
fn deliver<F>(weak: &Weak<EnvInner>, cancel: &CancelToken, id: WorkerId, invoke: F)
where
    F: for<'js> FnOnce(&Ctx<'js>, Value<'js>, Vec<Value<'js>>) -> Result<(), EngineError>,
{
    let inner = match weak.upgrade() {
        Some(inner) => inner,
        None => return,
    };
    if cancel.is_cancelled() || inner.is_disposed() {
        return;
    }
    inner.context().with(|ctx| {
        let (callback, extra) = match stash_take(&ctx, id) {
            Some(entry) => entry,
            None => return,
        };
        if cancel.is_cancelled() || inner.is_disposed() {
            return;
        }
        if let Err(err) = invoke(&ctx, callback, extra) {
            log::warn!("async worker callback failed: {err}");
        }
    });
}

fn stash_object<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let globals = ctx.globals();
    if let Ok(stash) = globals.get::<_, Object>(WORKER_STASH_GLOBAL) {
        return Ok(stash);
    }
    let stash = Object::new(ctx.clone())?;
    globals.set(WORKER_STASH_GLOBAL, stash.clone())?;
    Ok(stash)
}

/// Parks the callback and its extra arguments in the stash while the
/// spawning context entry is still active.
fn stash_insert<'js>(
    ctx: &Ctx<'js>,
    id: WorkerId,
    callback: Value<'js>,
    extra: Vec<Value<'js>>,
) -> rquickjs::Result<()> {
    let entry = Array::new(ctx.clone())?;
    entry.set(0, callback)?;
    for (i, value) in extra.into_iter().enumerate() {
        entry.set(i + 1, value)?;
    }
    stash_object(ctx)?.set(id.to_string().as_str(), entry)
}

/// Removes and returns the stash entry for `id`. `None` when the entry was
/// already dropped by a cancel.
fn stash_take<'js>(ctx: &Ctx<'js>, id: WorkerId) -> Option<(Value<'js>, Vec<Value<'js>>)> {
    let stash = stash_object(ctx).ok()?;
    let key = id.to_string();
    let entry: Array = stash.get(key.as_str()).ok()?;
    let _ = stash.remove(key.as_str());
    let callback: Value = entry.get(0).ok()?;
    let mut extra = Vec::with_capacity(entry.len().saturating_sub(1));
    for i in 1..entry.len() {
        extra.push(entry.get::<Value>(i).ok()?);
    }
    Some((callback, extra))
}

fn stash_remove(ctx: &Ctx<'_>, id: WorkerId) {
    if let Ok(stash) = ctx.globals().get::<_, Object>(WORKER_STASH_GLOBAL) {
        let _ = stash.remove(id.to_string().as_str());
    }
}

fn run_callback<'js>(
    ctx: &Ctx<'js>,
    callback: Value<'js>,
    args: Vec<Value<'js>>,
) -> Result<(), EngineError> {
    let function = callback.into_function().ok_or(EngineError::NotCallable)?;
    let mut call_args = Args::new(ctx.clone(), args.len());
    call_args.this(ctx.globals())?;
    for arg in args {
        call_args.push_arg(arg)?;
    }
    function
        .call_arg::<()>(call_args)
        .catch(ctx)
        .map_err(|caught| ScriptError::from_caught(ctx, caught, "async callback", None))?;
    Ok(())
}

fn fs_outcome_value<'js>(ctx: &Ctx<'js>, outcome: FsOutcome) -> Result<Value<'js>, EngineError> {
    match outcome {
        FsOutcome::Read(result) => {
            let obj = Object::new(ctx.clone())?;
            match result {
                Ok(content) => {
                    obj.set("content", content.as_str())?;
                    obj.set("error", "")?;
                }
                Err(error) => {
                    obj.set("content", "")?;
                    obj.set("error", error.as_str())?;
                }
            }
            Ok(obj.into_value())
        }
        FsOutcome::Simple(error) => {
            let value = rquickjs::String::from_str(ctx.clone(), &error)?;
            Ok(value.into_value())
        }
        FsOutcome::Stat(result) => {
            let obj = Object::new(ctx.clone())?;
            match result {
                Ok(stat) => {
                    obj.set("exists", stat.exists)?;
                    obj.set("isFile", stat.is_file)?;
                    obj.set("isDirectory", stat.is_directory)?;
                    obj.set("lastWriteTime", stat.last_write_time as f64)?;
                    obj.set("error", "")?;
                }
                Err(error) => {
                    obj.set("exists", false)?;
                    obj.set("isFile", false)?;
                    obj.set("isDirectory", false)?;
                    obj.set("lastWriteTime", 0.0)?;
                    obj.set("error", error.as_str())?;
                }
            }
            Ok(obj.into_value())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_wakes_a_waiting_worker() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || waiter.wait_cancelled(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancel_token_times_out_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.wait_cancelled(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_before_wait_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.wait_cancelled(Duration::from_secs(30)));
    }
}
