//! Native globals exposed to scripts: `setTimeout`/`clearTimeout`,
//! `trigger`, `fileSystem.*`, `webRequest.get` and `console.*`.
//!
//! Argument errors are thrown back into the script synchronously, before
//! any worker thread exists. Failures of the work itself are delivered to
//! the script callback as data, never as exceptions.

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, FromJs, Function, Object, Value};

use crate::env::Environment;
use crate::log::LogLevel;
use crate::value::{coerce_string, snapshot_value};
use crate::workers::FsJob;

pub(crate) fn install(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set(
        "setTimeout",
        Function::new(ctx.clone(), set_timeout)?.with_name("setTimeout")?,
    )?;
    globals.set(
        "clearTimeout",
        Function::new(ctx.clone(), clear_timeout)?.with_name("clearTimeout")?,
    )?;
    globals.set(
        "trigger",
        Function::new(ctx.clone(), trigger)?.with_name("trigger")?,
    )?;

    let file_system = Object::new(ctx.clone())?;
    file_system.set("read", Function::new(ctx.clone(), fs_read)?.with_name("read")?)?;
    file_system.set(
        "write",
        Function::new(ctx.clone(), fs_write)?.with_name("write")?,
    )?;
    file_system.set(
        "remove",
        Function::new(ctx.clone(), fs_remove)?.with_name("remove")?,
    )?;
    file_system.set(
        "move",
        Function::new(ctx.clone(), fs_move)?.with_name("move")?,
    )?;
    file_system.set(
        "stat",
        Function::new(ctx.clone(), fs_stat)?.with_name("stat")?,
    )?;
    file_system.set(
        "resolve",
        Function::new(ctx.clone(), fs_resolve)?.with_name("resolve")?,
    )?;
    globals.set("fileSystem", file_system)?;

    let web_request = Object::new(ctx.clone())?;
    web_request.set("get", Function::new(ctx.clone(), web_get)?.with_name("get")?)?;
    globals.set("webRequest", web_request)?;

    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), console_log)?.with_name("log")?,
    )?;
    console.set(
        "info",
        Function::new(ctx.clone(), console_info)?.with_name("info")?,
    )?;
    console.set(
        "warn",
        Function::new(ctx.clone(), console_warn)?.with_name("warn")?,
    )?;
    console.set(
        "error",
        Function::new(ctx.clone(), console_error)?.with_name("error")?,
    )?;
    console.set(
        "trace",
        Function::new(ctx.clone(), console_trace)?.with_name("trace")?,
    )?;
    globals.set("console", console)?;
    Ok(())
}

fn current_env(ctx: &Ctx<'_>) -> rquickjs::Result<Environment> {
    Environment::current(ctx)
        .ok_or_else(|| Exception::throw_message(ctx, "no scripting environment is active"))
}

fn throw_engine_error(ctx: &Ctx<'_>, err: crate::error::EngineError) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

fn set_timeout<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<f64> {
    let args = args.0;
    if args.len() < 2 {
        return Err(Exception::throw_message(
            &ctx,
            "setTimeout requires at least 2 parameters!",
        ));
    }
    if !args[0].is_function() {
        return Err(Exception::throw_message(
            &ctx,
            "First argument to setTimeout must be a function!",
        ));
    }
    let Coerced(delay) = Coerced::<f64>::from_js(&ctx, args[1].clone())?;
    let env = current_env(&ctx)?;
    match env.spawn_timer(&ctx, delay, args[0].clone(), args[2..].to_vec()) {
        Ok(id) => Ok(id as f64),
        Err(err) => Err(throw_engine_error(&ctx, err)),
    }
}

fn clear_timeout<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let args = args.0;
    if args.len() != 1 {
        return Err(Exception::throw_message(
            &ctx,
            "clearTimeout requires 1 parameter!",
        ));
    }
    if !args[0].is_number() {
        return Err(Exception::throw_message(
            &ctx,
            "First argument to clearTimeout must be a timer id!",
        ));
    }
    let Coerced(id) = Coerced::<f64>::from_js(&ctx, args[0].clone())?;
    current_env(&ctx)?.cancel_timer(&ctx, id as u32);
    Ok(())
}

fn trigger<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let args = args.0;
    if args.is_empty() {
        return Err(Exception::throw_message(
            &ctx,
            "trigger expects at least one parameter",
        ));
    }
    let Coerced(name) = Coerced::<String>::from_js(&ctx, args[0].clone())?;
    let snapshots: Vec<_> = args[1..]
        .iter()
        .map(|value| snapshot_value(&ctx, value))
        .collect();
    current_env(&ctx)?.trigger_event(&name, &snapshots);
    Ok(())
}

fn fs_read<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let args = args.0;
    if args.len() != 2 {
        return Err(Exception::throw_message(
            &ctx,
            "fileSystem.read requires 2 parameters",
        ));
    }
    if !args[1].is_function() {
        return Err(Exception::throw_message(
            &ctx,
            "Second argument to fileSystem.read must be a function",
        ));
    }
    let Coerced(path) = Coerced::<String>::from_js(&ctx, args[0].clone())?;
    let env = current_env(&ctx)?;
    env.spawn_fs(&ctx, FsJob::Read { path }, args[1].clone())
        .map(|_| ())
        .map_err(|err| throw_engine_error(&ctx, err))
}

fn fs_write<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let args = args.0;
    if args.len() != 3 {
        return Err(Exception::throw_message(
            &ctx,
            "fileSystem.write requires 3 parameters",
        ));
    }
    if !args[2].is_function() {
        return Err(Exception::throw_message(
            &ctx,
            "Third argument to fileSystem.write must be a function",
        ));
    }
    let Coerced(path) = Coerced::<String>::from_js(&ctx, args[0].clone())?;
    let Coerced(data) = Coerced::<String>::from_js(&ctx, args[1].clone())?;
    let env = current_env(&ctx)?;
    env.spawn_fs(&ctx, FsJob::Write { path, data }, args[2].clone())
        .map(|_| ())
        .map_err(|err| throw_engine_error(&ctx, err))
}

fn fs_remove<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let args = args.0;
    if args.len() != 2 {
        return Err(Exception::throw_message(
            &ctx,
            "fileSystem.remove requires 2 parameters",
        ));
    }
    if !args[1].is_function() {
        return Err(Exception::throw_message(
            &ctx,
            "Second argument to fileSystem.remove must be a function",
        ));
    }
    let Coerced(path) = Coerced::<String>::from_js(&ctx, args[0].clone())?;
    let env = current_env(&ctx)?;
    env.spawn_fs(&ctx, FsJob::Remove { path }, args[1].clone())
        .map(|_| ())
        .map_err(|err| throw_engine_error(&ctx, err))
}

fn fs_move<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let args = args.0;
    if args.len() != 3 {
        return Err(Exception::throw_message(
            &ctx,
            "fileSystem.move requires 3 parameters",
        ));
    }
    if !args[2].is_function() {
        return Err(Exception::throw_message(
            &ctx,
            "Third argument to fileSystem.move must be a function",
        ));
    }
    let Coerced(from) = Coerced::<String>::from_js(&ctx, args[0].clone())?;
    let Coerced(to) = Coerced::<String>::from_js(&ctx, args[1].clone())?;
    let env = current_env(&ctx)?;
    env.spawn_fs(&ctx, FsJob::Move { from, to }, args[2].clone())
        .map(|_| ())
        .map_err(|err| throw_engine_error(&ctx, err))
}

fn fs_stat<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let args = args.0;
    if args.len() != 2 {
        return Err(Exception::throw_message(
            &ctx,
            "fileSystem.stat requires 2 parameters",
        ));
    }
    if !args[1].is_function() {
        return Err(Exception::throw_message(
            &ctx,
            "Second argument to fileSystem.stat must be a function",
        ));
    }
    let Coerced(path) = Coerced::<String>::from_js(&ctx, args[0].clone())?;
    let env = current_env(&ctx)?;
    env.spawn_fs(&ctx, FsJob::Stat { path }, args[1].clone())
        .map(|_| ())
        .map_err(|err| throw_engine_error(&ctx, err))
}

fn fs_resolve<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<String> {
    let args = args.0;
    if args.len() != 1 {
        return Err(Exception::throw_message(
            &ctx,
            "fileSystem.resolve requires 1 parameter",
        ));
    }
    let Coerced(path) = Coerced::<String>::from_js(&ctx, args[0].clone())?;
    Ok(current_env(&ctx)?.file_system().resolve(&path))
}

fn web_get<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let args = args.0;
    if args.len() != 3 {
        return Err(Exception::throw_message(
            &ctx,
            "webRequest.get requires 3 parameters",
        ));
    }
    let Coerced(url) = Coerced::<String>::from_js(&ctx, args[0].clone())?;
    let headers_obj = match args[1].clone().into_object() {
        Some(obj) => obj,
        None => {
            return Err(Exception::throw_message(
                &ctx,
                "Second argument to webRequest.get must be an object",
            ))
        }
    };
    if !args[2].is_function() {
        return Err(Exception::throw_message(
            &ctx,
            "Third argument to webRequest.get must be a function",
        ));
    }
    let mut headers = Vec::new();
    for prop in headers_obj.props::<String, Coerced<String>>() {
        let (name, Coerced(value)) = prop?;
        headers.push((name, value));
    }
    let env = current_env(&ctx)?;
    env.spawn_http(&ctx, url, headers, args[2].clone())
        .map(|_| ())
        .map_err(|err| throw_engine_error(&ctx, err))
}

fn console_log<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    console_write(&ctx, LogLevel::Log, &args.0)
}

fn console_info<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    console_write(&ctx, LogLevel::Info, &args.0)
}

fn console_warn<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    console_write(&ctx, LogLevel::Warn, &args.0)
}

fn console_error<'js>(ctx: Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    console_write(&ctx, LogLevel::Error, &args.0)
}

fn console_write<'js>(ctx: &Ctx<'js>, level: LogLevel, args: &[Value<'js>]) -> rquickjs::Result<()> {
    let mut message = String::new();
    for (i, value) in args.iter().enumerate() {
        if i > 0 {
            message.push(' ');
        }
        match coerce_string(ctx, value) {
            Some(text) => message.push_str(&text),
            None => message.push_str("<value>"),
        }
    }
    let source = caller_tag(ctx);
    if let Some(env) = Environment::current(ctx) {
        env.log_sink().write(level, &message, &source);
    }
    Ok(())
}

fn console_trace<'js>(ctx: Ctx<'js>, _args: Rest<Value<'js>>) -> rquickjs::Result<()> {
    let trace = capture_stack(&ctx)
        .lines()
        .skip(1)
        .filter(|line| !line.contains("(native)"))
        .collect::<Vec<_>>()
        .join("\n");
    if let Some(env) = Environment::current(&ctx) {
        env.log_sink().write(LogLevel::Trace, &trace, "");
    }
    Ok(())
}

fn capture_stack(ctx: &Ctx<'_>) -> String {
    ctx.eval::<Coerced<String>, _>("new Error().stack")
        .map(|c| c.0)
        .unwrap_or_default()
}

/// Best-effort `[file:line]` tag for the script frame that called into a
/// console native. The first stack frame is the probe eval itself and
/// native frames carry no location, so both are skipped.
fn caller_tag(ctx: &Ctx<'_>) -> String {
    let stack = capture_stack(ctx);
    for line in stack.lines().skip(1) {
        let line = line.trim();
        let location = match (line.rfind('('), line.rfind(')')) {
            (Some(open), Some(close)) if open < close => &line[open + 1..close],
            _ => line.strip_prefix("at ").unwrap_or(line),
        };
        if location.is_empty() || location == "native" {
            continue;
        }
        return format!("[{location}]");
    }
    String::new()
}
