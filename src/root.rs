//! Root context: the process-wide object owning the event loop and the
//! module registry.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{self, EventLoop};
use crate::object::{Object, WeakObject};
use crate::types::{Array, Value};

struct RootState {
    event_loop: Rc<EventLoop>,
    /// Insertion-ordered so teardown can run in reverse registration order.
    modules: RefCell<Vec<(String, Object)>>,
    exit_code: Cell<i32>,
}

/// Handle to the root context. The root is itself an object ("deai:Core");
/// this wrapper pairs it with the typed state its methods close over.
#[derive(Clone)]
pub struct Root {
    object: Object,
    state: Rc<RootState>,
}

/// Weak counterpart of [`Root`] for captures that must not keep the root
/// alive.
#[derive(Clone)]
pub struct WeakRoot {
    object: WeakObject,
    state: Weak<RootState>,
}

impl WeakRoot {
    pub fn upgrade(&self) -> Option<Root> {
        Some(Root {
            object: self.object.upgrade()?,
            state: self.state.upgrade()?,
        })
    }
}

impl Root {
    /// Creates the root context with its event loop and the built-in
    /// "event" and "log" modules.
    pub fn new() -> Result<Root> {
        let object = Object::new();
        object.set_type_name("deai:Core");
        // Never emitted; loop-bound objects couple their teardown to it.
        object.register_signal("destroyed", vec![])?;

        let state = Rc::new(RootState {
            event_loop: Rc::new(EventLoop::new()),
            modules: RefCell::new(Vec::new()),
            exit_code: Cell::new(0),
        });

        let st = state.clone();
        object.add_method("quit", move |_this: Object| -> Result<()> {
            st.event_loop.request_quit();
            Ok(())
        })?;
        object.add_method("chdir", |_this: Object, path: String| -> Result<()> {
            std::env::set_current_dir(path)?;
            Ok(())
        })?;
        let st = state.clone();
        object.add_method(
            "load_plugin",
            move |this: Object, path: String| -> Result<()> {
                let root = Root {
                    object: this,
                    state: st.clone(),
                };
                crate::plugin::load_plugin(&root, &path)
            },
        )?;
        let st = state.clone();
        object.add_method(
            "load_plugin_from_dir",
            move |this: Object, dir: String| -> Result<i64> {
                let root = Root {
                    object: this,
                    state: st.clone(),
                };
                crate::plugin::load_plugin_from_dir(&root, &dir).map(|n| n as i64)
            },
        )?;
        let st = state.clone();
        object.add_method(
            "register_module",
            move |this: Object, name: String, module: Object| -> Result<()> {
                let root = Root {
                    object: this,
                    state: st.clone(),
                };
                root.register_module(&name, module)
            },
        )?;
        let get = state.clone();
        let set = state.clone();
        object.add_property(
            "exit_code",
            move |_this: Object| -> Result<i32> { Ok(get.exit_code.get()) },
            move |_this: Object, code: i32| -> Result<()> {
                set.exit_code.set(code);
                Ok(())
            },
        )?;

        let weak_state = Rc::downgrade(&state);
        object.set_destructor(move || {
            let Some(state) = weak_state.upgrade() else { return };
            state.event_loop.request_quit();
            let modules: Vec<(String, Object)> = state.modules.borrow_mut().drain(..).collect();
            for (name, module) in modules.into_iter().rev() {
                log::debug!("tearing down module {}", name);
                module.destroy();
            }
        });

        let root = Root { object, state };
        event::init_event_module(&root)?;
        crate::log::init_log_module(&root)?;
        Ok(root)
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.state.event_loop
    }

    pub fn downgrade(&self) -> WeakRoot {
        WeakRoot {
            object: self.object.downgrade(),
            state: Rc::downgrade(&self.state),
        }
    }

    /// Registers a module object under `name`. The registry holds a strong
    /// reference until teardown.
    pub fn register_module(&self, name: &str, module: Object) -> Result<()> {
        let mut modules = self.state.modules.borrow_mut();
        if modules.iter().any(|(existing, _)| existing == name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        log::debug!("registered module {}", name);
        modules.push((name.to_string(), module));
        Ok(())
    }

    /// Looks up a registered module, returning a strong reference.
    pub fn module(&self, name: &str) -> Result<Object> {
        self.state
            .modules
            .borrow()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, module)| module.clone())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Exposes the process arguments as the `argv` array member.
    pub fn set_argv(&self, argv: Vec<String>) -> Result<()> {
        self.object
            .add_member_move("argv", false, Value::Array(Array::from_strings(argv)))
    }

    pub fn exit_code(&self) -> i32 {
        self.state.exit_code.get()
    }

    /// Drives the loop until quit is requested.
    pub fn run(&self) {
        self.state.event_loop.run();
    }

    /// Drives the loop for at most `duration`.
    pub fn run_for(&self, duration: Duration) {
        self.state.event_loop.run_for(duration);
    }

    pub fn quit(&self) {
        self.state.event_loop.request_quit();
    }

    /// Tears the root down: stops the loop, destroys modules in reverse
    /// registration order and releases every loop-bound object through the
    /// destroyed-listener coupling.
    pub fn destroy(&self) {
        self.object.destroy();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    #[test]
    fn builtin_modules_are_registered() {
        let root = Root::new().unwrap();
        assert!(root.module("event").is_ok());
        assert!(root.module("log").is_ok());
        assert!(matches!(root.module("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn module_registration_collides_by_name() {
        let root = Root::new().unwrap();
        root.register_module("extra", Object::new()).unwrap();
        assert!(matches!(
            root.register_module("extra", Object::new()),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn register_module_method_matches_rust_api() {
        let root = Root::new().unwrap();
        let module = Object::new();
        root.object()
            .call_method(
                "register_module",
                vec![
                    Value::String("scripted".to_string()),
                    Value::Object(module.clone()),
                ],
            )
            .unwrap();
        assert_eq!(root.module("scripted").unwrap(), module);
    }

    #[test]
    fn argv_is_exposed_as_an_array_member() {
        let root = Root::new().unwrap();
        root.set_argv(vec!["deai".to_string(), "--".to_string()]).unwrap();
        match root.object().get("argv").unwrap() {
            Value::Array(argv) => {
                assert_eq!(argv.elem_type(), Type::String);
                assert_eq!(argv.len(), 2);
            }
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn exit_code_property_round_trips() {
        let root = Root::new().unwrap();
        assert_eq!(root.object().get("exit_code").unwrap(), Value::NInt(0));
        root.object().set("exit_code", Value::Int(3)).unwrap();
        assert_eq!(root.exit_code(), 3);
    }

    #[test]
    fn destroy_tears_down_modules_in_reverse_order() {
        let root = Root::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = Object::new();
        let o = order.clone();
        first.set_destructor(move || o.borrow_mut().push("first"));
        root.register_module("first", first).unwrap();

        let second = Object::new();
        let o = order.clone();
        second.set_destructor(move || o.borrow_mut().push("second"));
        root.register_module("second", second).unwrap();

        root.destroy();
        assert_eq!(*order.borrow(), ["second", "first"]);
    }

    #[test]
    fn chdir_method_changes_directory() {
        let root = Root::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let before = std::env::current_dir().unwrap();
        root.object()
            .call_method(
                "chdir",
                vec![Value::String(dir.path().to_str().unwrap().to_string())],
            )
            .unwrap();
        let after = std::env::current_dir().unwrap();
        assert_eq!(after.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
        std::env::set_current_dir(before).unwrap();
    }
}
