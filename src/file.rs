//! Filesystem watch plugin: publishes inotify events as signals.
//!
//! A watch object rides an internal fdevent on its inotify descriptor; the
//! "read" listener drains the kernel queue and fans each record out as a
//! named signal carrying `(watched-path, sub-path)`, with a rename
//! correlation cookie on `moved-from`/`moved-to`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::callable::{new_closure, Capture};
use crate::error::{Error, Result};
use crate::event::Interest;
use crate::object::Object;
use crate::root::Root;
use crate::signal::Listener;
use crate::types::{Array, Type, Value};

/// Signals carrying `(watched-path, sub-path)`.
const PATH_SIGNALS: [(u32, &str); 10] = [
    (libc::IN_CREATE, "create"),
    (libc::IN_ACCESS, "access"),
    (libc::IN_ATTRIB, "attrib"),
    (libc::IN_CLOSE_WRITE, "close-write"),
    (libc::IN_CLOSE_NOWRITE, "close-nowrite"),
    (libc::IN_DELETE, "delete"),
    (libc::IN_DELETE_SELF, "delete-self"),
    (libc::IN_MODIFY, "modify"),
    (libc::IN_MOVE_SELF, "move-self"),
    (libc::IN_OPEN, "open"),
];

struct WatchState {
    fd: RawFd,
    byname: RefCell<HashMap<String, i32>>,
    bywd: RefCell<HashMap<i32, String>>,
    fdev: RefCell<Option<Object>>,
    fdev_listener: RefCell<Option<Listener>>,
}

fn add_watch(state: &WatchState, path: &str) -> Result<()> {
    let c_path = CString::new(path)
        .map_err(|_| Error::InvalidArgument("path contains a NUL byte".to_string()))?;
    let wd = unsafe { libc::inotify_add_watch(state.fd, c_path.as_ptr(), libc::IN_ALL_EVENTS) };
    if wd < 0 {
        return Err(Error::from_os(std::io::Error::last_os_error()));
    }
    state.byname.borrow_mut().insert(path.to_string(), wd);
    state.bywd.borrow_mut().insert(wd, path.to_string());
    Ok(())
}

fn remove_watch(state: &WatchState, path: &str) -> Result<()> {
    let wd = state
        .byname
        .borrow_mut()
        .remove(path)
        .ok_or_else(|| Error::NotFound(path.to_string()))?;
    unsafe { libc::inotify_rm_watch(state.fd, wd) };
    state.bywd.borrow_mut().remove(&wd);
    Ok(())
}

fn path_items(paths: &Array) -> Result<Vec<String>> {
    if !paths.is_empty() && paths.elem_type() != Type::String {
        return Err(Error::InvalidArgument(
            "expected an array of strings".to_string(),
        ));
    }
    let mut items = Vec::with_capacity(paths.len());
    for item in paths.items() {
        match item {
            Value::String(s) => items.push(s.clone()),
            Value::StringLiteral(s) => items.push((*s).to_string()),
            other => {
                return Err(Error::TypeMismatch {
                    expected: Type::String,
                    actual: other.type_(),
                })
            }
        }
    }
    Ok(items)
}

fn dispatch_record(watch: &Object, mask: u32, cookie: u32, watched: &str, sub_path: &str) {
    let base = vec![
        Value::String(watched.to_string()),
        Value::String(sub_path.to_string()),
    ];
    for (bit, name) in PATH_SIGNALS {
        if mask & bit != 0 {
            let _ = watch.emit(name, base.clone());
        }
    }
    for (bit, name) in [
        (libc::IN_MOVED_FROM, "moved-from"),
        (libc::IN_MOVED_TO, "moved-to"),
    ] {
        if mask & bit != 0 {
            let mut payload = base.clone();
            payload.push(Value::UInt(cookie as u64));
            let _ = watch.emit(name, payload);
        }
    }
}

fn drain_events(state: &WatchState, watch: &Object) -> Result<()> {
    const BUF_LEN: usize = 4096;
    #[repr(C, align(8))]
    struct EventBuf([u8; BUF_LEN]);

    let header = std::mem::size_of::<libc::inotify_event>();
    let mut buf = EventBuf([0; BUF_LEN]);
    loop {
        let n = unsafe {
            libc::read(
                state.fd,
                buf.0.as_mut_ptr() as *mut libc::c_void,
                BUF_LEN,
            )
        };
        if n <= 0 {
            // Non-blocking fd: EAGAIN means the queue is drained.
            break;
        }
        let n = n as usize;
        let mut offset = 0;
        while offset + header <= n {
            let ev = unsafe {
                std::ptr::read_unaligned(buf.0.as_ptr().add(offset) as *const libc::inotify_event)
            };
            let name_len = ev.len as usize;
            if offset + header + name_len > n {
                break;
            }
            let name_bytes = &buf.0[offset + header..offset + header + name_len];
            let sub_path = name_bytes
                .split(|b| *b == 0)
                .next()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .unwrap_or_default();

            let watched = state.bywd.borrow().get(&ev.wd).cloned();
            if let Some(watched) = watched {
                dispatch_record(watch, ev.mask, ev.cookie, &watched, &sub_path);
            }
            offset += header + name_len;
        }
    }
    Ok(())
}

/// Creates a watch object over the given paths.
fn new_watch(root: &Root, paths: &Array) -> Result<Object> {
    let initial = path_items(paths)?;

    let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
    if fd < 0 {
        return Err(Error::from_os(std::io::Error::last_os_error()));
    }

    let watch = Object::new();
    watch.set_type_name("deai.builtin.file:watch");
    for (_, name) in PATH_SIGNALS {
        watch.register_signal(name, vec![Type::String, Type::String])?;
    }
    watch.register_signal("moved-from", vec![Type::String, Type::String, Type::UInt])?;
    watch.register_signal("moved-to", vec![Type::String, Type::String, Type::UInt])?;

    let state = Rc::new(WatchState {
        fd,
        byname: RefCell::new(HashMap::new()),
        bywd: RefCell::new(HashMap::new()),
        fdev: RefCell::new(None),
        fdev_listener: RefCell::new(None),
    });

    let st = state.clone();
    watch.add_method("add", move |_this: Object, paths: Array| -> Result<()> {
        for path in path_items(&paths)? {
            add_watch(&st, &path)?;
        }
        Ok(())
    })?;
    let st = state.clone();
    watch.add_method("add_one", move |_this: Object, path: String| -> Result<()> {
        add_watch(&st, &path)
    })?;
    let st = state.clone();
    watch.add_method("remove", move |_this: Object, path: String| -> Result<()> {
        remove_watch(&st, &path)
    })?;

    // The inotify descriptor rides an fdevent from the event module; the
    // fdevent owns the fd and closes it on destruction.
    let fdev = match root
        .module("event")?
        .call_method(
            "fdevent",
            vec![Value::NInt(fd), Value::NUInt(Interest::READ.bits())],
        )? {
        Value::Object(fdev) => fdev,
        _ => return Err(Error::NotCallable),
    };

    let st = state.clone();
    let handler = new_closure(
        move |watch: Object, _fdev: Object| -> Result<()> { drain_events(&st, &watch) },
        vec![Capture::Weak(watch.downgrade())],
    )?;
    *state.fdev_listener.borrow_mut() = Some(fdev.listen("read", handler, false)?);
    *state.fdev.borrow_mut() = Some(fdev);

    let st = state.clone();
    watch.set_destructor(move || {
        if let Some(listener) = st.fdev_listener.borrow_mut().take() {
            let _ = listener.stop();
        }
        if let Some(fdev) = st.fdev.borrow_mut().take() {
            fdev.destroy();
        }
    });

    for path in initial {
        add_watch(&state, &path)?;
    }
    Ok(watch)
}

/// Plugin entry: registers the "file" module with its `watch` constructor.
pub(crate) fn plugin_init(root: &Root) -> Result<()> {
    let fm = Object::new();
    fm.set_type_name("deai.builtin:FileModule");
    let weak = root.downgrade();
    fm.add_method("watch", move |_this: Object, paths: Array| -> Result<Object> {
        let root = weak.upgrade().ok_or(Error::Dangling)?;
        new_watch(&root, &paths)
    })?;
    root.register_module("file", fm)
}
