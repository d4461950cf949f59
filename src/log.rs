//! Log module: the daemon's user-visible logging surface.
//!
//! The "log" module object is itself callable: `log(level, message)` routes
//! a severity-tagged single line to the current `log_target` member, an
//! object with a `write(line)` method. Targets for stderr and files are
//! provided; file targets timestamp each line. The runtime's own
//! diagnostics go through the `log` crate macros instead.

use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::io::Write;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::object::Object;
use crate::root::Root;
use crate::types::{Type, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn level_lookup(name: &str) -> Option<LogLevel> {
    match name {
        "error" => Some(LogLevel::Error),
        "warn" => Some(LogLevel::Warn),
        "info" => Some(LogLevel::Info),
        "debug" => Some(LogLevel::Debug),
        _ => None,
    }
}

fn level_tostring(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    }
}

struct LogState {
    level: Cell<LogLevel>,
}

fn string_arg(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::StringLiteral(s) => Ok((*s).to_string()),
        other => Err(Error::TypeMismatch {
            expected: Type::String,
            actual: other.type_(),
        }),
    }
}

/// A target writing to stderr, line by line.
fn stderr_target() -> Result<Object> {
    let target = Object::new();
    target.set_type_name("deai.builtin.log:StderrTarget");
    target.add_method("write", |_this: Object, line: String| -> Result<i32> {
        eprintln!("{}", line);
        Ok(0)
    })?;
    Ok(target)
}

/// A target appending timestamped lines to a file. With `overwrite` the
/// file is truncated instead.
fn file_target(path: &str, overwrite: bool) -> Result<Object> {
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if overwrite {
        options.truncate(true);
    } else {
        options.append(true);
    }
    let file = options.open(path)?;

    let target = Object::new();
    target.set_type_name("deai.builtin.log:FileTarget");
    let file = Rc::new(RefCell::new(file));
    target.add_method("write", move |_this: Object, line: String| -> Result<i32> {
        let mut file = file.borrow_mut();
        writeln!(
            file,
            "{} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            line
        )?;
        file.flush()?;
        Ok(0)
    })?;
    Ok(target)
}

/// Registers the "log" module on the root.
pub(crate) fn init_log_module(root: &Root) -> Result<()> {
    let lm = Object::new();
    lm.set_type_name("deai.builtin:LogModule");

    let state = Rc::new(LogState {
        level: Cell::new(LogLevel::Error),
    });

    lm.add_member_move("log_target", true, Value::Object(stderr_target()?))?;

    let st = state.clone();
    lm.set_call_raw(move |this, args| {
        if args.len() != 2 {
            return Err(Error::ArityMismatch {
                expected: 2,
                actual: args.len(),
            });
        }
        let level_name = string_arg(&args[0])?;
        let message = string_arg(&args[1])?;
        let level = level_lookup(&level_name).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown log level \"{}\"", level_name))
        })?;
        if level > st.level.get() {
            return Ok(Value::NInt(0));
        }

        let line = format!("[{}] {}", level_tostring(level), message);
        match this.get("log_target")? {
            Value::Object(target) => target.call_method("write", vec![Value::String(line)]),
            _ => Err(Error::NotCallable),
        }
    });

    lm.add_method(
        "file_target",
        |_this: Object, path: String, overwrite: bool| -> Result<Object> {
            file_target(&path, overwrite)
        },
    )?;
    lm.add_method("stderr_target", |_this: Object| -> Result<Object> {
        stderr_target()
    })?;

    let get = state.clone();
    let set = state.clone();
    lm.add_property(
        "log_level",
        move |_this: Object| -> Result<String> {
            Ok(level_tostring(get.level.get()).to_string())
        },
        move |_this: Object, name: String| -> Result<()> {
            let level = level_lookup(&name).ok_or_else(|| {
                Error::InvalidArgument(format!("unknown log level \"{}\"", name))
            })?;
            set.level.set(level);
            Ok(())
        },
    )?;

    root.register_module("log", lm)
}

// =============================================================================
// Tests
// =============================================================================
