//! Signal/listener core: named event slots on objects, subscription and
//! emission.
//!
//! Emission takes a snapshot of the listener list and dispatches in
//! insertion order; the source object is prepended to the payload, so a
//! handler for a signal of declared arity N is called with N+1 arguments.
//! A failing handler is logged and swallowed; one broken listener never
//! starves the others.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::object::{probe_key, Object, ObjectCore, WeakObject};
use crate::types::{Type, Value};

// =============================================================================
// Slots and listeners
// =============================================================================

pub(crate) struct SignalSlot {
    /// Argument types declared at registration; `None` for slots created on
    /// first subscription to an undeclared signal.
    pub(crate) arg_types: Option<Vec<Type>>,
    pub(crate) listeners: Vec<Rc<ListenerEntry>>,
}

pub(crate) struct ListenerEntry {
    pub(crate) handler: Object,
    pub(crate) once: bool,
    pub(crate) attached: Cell<bool>,
}

/// Handle to an active subscription.
pub struct Listener {
    source: WeakObject,
    name: String,
    entry: Rc<ListenerEntry>,
}

impl Listener {
    pub fn is_attached(&self) -> bool {
        self.entry.attached.get()
    }

    /// Detaches the listener from its slot. The handler's `__detach` hook is
    /// NOT invoked on this path; when the slot goes empty the source's
    /// `__del_listener_<name>` hook fires. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<()> {
        let source = match self.source.upgrade() {
            Some(source) => source,
            None => {
                self.entry.attached.set(false);
                return Ok(());
            }
        };
        stop_entry(&source, &self.name, &self.entry);
        Ok(())
    }
}

fn detach_hook(handler: &Object) -> Option<Object> {
    match handler.raw_get("__detach") {
        Some(Value::Object(o)) if o.has_call() => Some(o),
        _ => None,
    }
}

fn edge_hook(source: &Object, prefix: &str, name: &str) -> Option<Object> {
    match source.raw_get(probe_key(prefix, name)) {
        Some(Value::Object(o)) if o.has_call() => Some(o),
        _ => None,
    }
}

fn stop_entry(source: &Object, name: &str, entry: &Rc<ListenerEntry>) {
    if !entry.attached.replace(false) {
        return;
    }
    let now_empty = {
        let mut signals = source.core.signals.borrow_mut();
        match signals.get_mut(name) {
            Some(slot) => {
                slot.listeners.retain(|e| !Rc::ptr_eq(e, entry));
                slot.listeners.is_empty()
            }
            None => false,
        }
    };
    if now_empty {
        if let Some(hook) = edge_hook(source, "__del_listener_", name) {
            if let Err(err) = hook.call(vec![]) {
                log::warn!("__del_listener_{} hook failed: {}", name, err);
            }
        }
    }
}

/// Detaches every listener of `core` and invokes the handlers' `__detach`
/// hooks. Shared by explicit clears and the apoptosis path; the
/// `__del_listener` edge hooks do not fire here.
pub(crate) fn clear_listeners_of_core(core: &ObjectCore) {
    let entries: Vec<Rc<ListenerEntry>> = {
        let mut signals = core.signals.borrow_mut();
        let mut all = Vec::new();
        for slot in signals.values_mut() {
            for entry in slot.listeners.drain(..) {
                entry.attached.set(false);
                all.push(entry);
            }
        }
        all
    };
    for entry in entries {
        if let Some(hook) = detach_hook(&entry.handler) {
            if let Err(err) = hook.call(vec![]) {
                log::warn!("__detach hook failed: {}", err);
            }
        }
    }
}

// =============================================================================
// Object surface
// =============================================================================

impl Object {
    /// Declares a signal slot and its argument types. The source object is
    /// not part of the declaration; it is prepended implicitly on emission.
    /// Re-declaring an existing signal fails with `AlreadyExists`.
    pub fn register_signal(&self, name: &str, arg_types: Vec<Type>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        for t in &arg_types {
            if t.size_of() == 0 {
                return Err(Error::InvalidArgument(format!(
                    "{} is not a valid signal argument type",
                    t
                )));
            }
        }
        let mut signals = self.core.signals.borrow_mut();
        match signals.get_mut(name) {
            Some(slot) if slot.arg_types.is_some() => Err(Error::AlreadyExists(name.to_string())),
            Some(slot) => {
                slot.arg_types = Some(arg_types);
                Ok(())
            }
            None => {
                signals.insert(
                    name.to_string(),
                    SignalSlot {
                        arg_types: Some(arg_types),
                        listeners: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Subscribes `handler` to the named signal. Subscribing to an
    /// undeclared signal creates an untyped slot. On the first listener for
    /// a name, the source's `__add_listener_<name>` hook is invoked,
    /// permitting lazy subscription to the underlying OS resource.
    pub fn listen(&self, name: &str, handler: Object, once: bool) -> Result<Listener> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        let entry = Rc::new(ListenerEntry {
            handler,
            once,
            attached: Cell::new(true),
        });
        let first = {
            let mut signals = self.core.signals.borrow_mut();
            let slot = signals.entry(name.to_string()).or_insert_with(|| SignalSlot {
                arg_types: None,
                listeners: Vec::new(),
            });
            let first = slot.listeners.is_empty();
            slot.listeners.push(entry.clone());
            first
        };
        if first {
            if let Some(hook) = edge_hook(self, "__add_listener_", name) {
                if let Err(err) = hook.call(vec![]) {
                    log::warn!("__add_listener_{} hook failed: {}", name, err);
                }
            }
        }
        Ok(Listener {
            source: self.downgrade(),
            name: name.to_string(),
            entry,
        })
    }

    /// Emits the named signal. Listeners are dispatched in insertion order
    /// against a snapshot taken before iteration: subscriptions made during
    /// the emission are not invoked, removals during the emission still see
    /// the in-flight event. Handler errors are logged and swallowed. In
    /// debug builds the payload is verified against the declared slot types.
    pub fn emit(&self, name: &str, args: Vec<Value>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        let snapshot = {
            let signals = self.core.signals.borrow();
            let slot = match signals.get(name) {
                Some(slot) => slot,
                None => return Ok(()),
            };
            if cfg!(debug_assertions) {
                if let Some(declared) = &slot.arg_types {
                    if declared.len() != args.len() {
                        return Err(Error::ArityMismatch {
                            expected: declared.len(),
                            actual: args.len(),
                        });
                    }
                    for (arg, expected) in args.iter().zip(declared) {
                        let actual = arg.type_();
                        if actual != Type::Nil && !actual.compatible_with(*expected) {
                            return Err(Error::TypeMismatch {
                                expected: *expected,
                                actual,
                            });
                        }
                    }
                }
            }
            slot.listeners.clone()
        };

        for entry in snapshot {
            let mut payload = Vec::with_capacity(args.len() + 1);
            payload.push(Value::Object(self.clone()));
            payload.extend(args.iter().cloned());
            if let Err(err) = entry.handler.call(payload) {
                log::warn!(
                    "listener for signal \"{}\" on {} failed: {}",
                    name,
                    self.type_name(),
                    err
                );
            }
            // A handler that detached itself mid-dispatch opts out of the
            // once bookkeeping.
            if entry.once && entry.attached.get() {
                stop_entry(self, name, &entry);
            }
        }
        Ok(())
    }

    /// Detaches all listeners, invoking each handler's `__detach` hook.
    /// Unlike [`Listener::stop`], this is the path that notifies handlers.
    pub fn clear_listeners(&self) {
        clear_listeners_of_core(&self.core);
    }
}

/// Couples `target`'s lifetime to `source`'s teardown: subscribes a trivial
/// handler to `source`'s `destroyed` signal whose `__detach` hook destroys
/// `target` when `source` goes through apoptosis. The signal itself is never
/// emitted; the coupling works through listener clearing.
pub fn listen_to_destroyed(source: &Object, target: &Object) -> Result<Listener> {
    let handler = Object::new();
    handler.set_type_name("deai:DestroyedHandler");
    let weak = target.downgrade();
    handler.add_method("__detach", move |_this: Object| -> Result<()> {
        if let Some(target) = weak.upgrade() {
            target.destroy();
        }
        Ok(())
    })?;
    source.listen("destroyed", handler, false)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::new_closure;
    use std::cell::RefCell;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, tag: &str) -> Object {
        let log = log.clone();
        let tag = tag.to_string();
        new_closure(
            move |_src: Object| -> Result<()> {
                log.borrow_mut().push(tag.clone());
                Ok(())
            },
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn listeners_run_in_insertion_order() {
        let src = Object::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let _a = src.listen("tick", recorder(&log, "a"), false).unwrap();
        let _b = src.listen("tick", recorder(&log, "b"), false).unwrap();
        let _c = src.listen("tick", recorder(&log, "c"), false).unwrap();

        src.emit("tick", vec![]).unwrap();
        src.emit("tick", vec![]).unwrap();
        assert_eq!(*log.borrow(), ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn once_listener_fires_at_most_once() {
        let src = Object::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let _l = src.listen("tick", recorder(&log, "once"), true).unwrap();

        src.emit("tick", vec![]).unwrap();
        src.emit("tick", vec![]).unwrap();
        assert_eq!(*log.borrow(), ["once"]);
    }

    #[test]
    fn payload_carries_source_and_args() {
        let src = Object::new();
        src.set_type_name("deai:source");
        src.register_signal("value", vec![Type::Int]).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let handler = new_closure(
            move |source: Object, v: i64| -> Result<()> {
                seen2.borrow_mut().push((source.type_name(), v));
                Ok(())
            },
            vec![],
        )
        .unwrap();
        let _l = src.listen("value", handler, false).unwrap();

        src.emit("value", vec![Value::Int(42)]).unwrap();
        assert_eq!(*seen.borrow(), [("deai:source".to_string(), 42)]);
    }

    #[test]
    fn declared_signal_rejects_wrong_payload_in_debug() {
        let src = Object::new();
        src.register_signal("value", vec![Type::Int]).unwrap();
        let _l = src
            .listen("value", recorder(&Rc::new(RefCell::new(Vec::new())), "x"), false)
            .unwrap();

        if cfg!(debug_assertions) {
            assert!(matches!(
                src.emit("value", vec![]),
                Err(Error::ArityMismatch { .. })
            ));
            assert!(matches!(
                src.emit("value", vec![Value::Bool(true)]),
                Err(Error::TypeMismatch { .. })
            ));
        }
    }

    #[test]
    fn register_signal_twice_fails() {
        let src = Object::new();
        src.register_signal("tick", vec![]).unwrap();
        assert!(matches!(
            src.register_signal("tick", vec![]),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn failing_listener_does_not_starve_others() {
        let src = Object::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let bad = new_closure(
            |_src: Object| -> Result<()> { Err(Error::NotCallable) },
            vec![],
        )
        .unwrap();
        let _a = src.listen("tick", bad, false).unwrap();
        let _b = src.listen("tick", recorder(&log, "ok"), false).unwrap();

        src.emit("tick", vec![]).unwrap();
        assert_eq!(*log.borrow(), ["ok"]);
    }

    #[test]
    fn listener_added_during_emission_waits_for_next_round() {
        let src = Object::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        // The first handler registers a new listener when it runs.
        let late_log = log.clone();
        let registering = new_closure(
            move |source: Object| -> Result<()> {
                late_log.borrow_mut().push("first".to_string());
                let inner_log = late_log.clone();
                let late = new_closure(
                    move |_s: Object| -> Result<()> {
                        inner_log.borrow_mut().push("late".to_string());
                        Ok(())
                    },
                    vec![],
                )
                .unwrap();
                // Keep the subscription alive past this call.
                std::mem::forget(source.listen("tick", late, false).unwrap());
                Ok(())
            },
            vec![],
        )
        .unwrap();
        let _r = src.listen("tick", registering, false).unwrap();

        src.emit("tick", vec![]).unwrap();
        assert_eq!(*log.borrow(), ["first"]);

        src.emit("tick", vec![]).unwrap();
        assert_eq!(*log.borrow(), ["first", "first", "late"]);
    }

    #[test]
    fn listener_removed_during_emission_still_sees_inflight_event() {
        let src = Object::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let holder: Rc<RefCell<Option<Listener>>> = Rc::new(RefCell::new(None));
        let holder2 = holder.clone();
        let log2 = log.clone();
        let stopper = new_closure(
            move |_src: Object| -> Result<()> {
                log2.borrow_mut().push("stopper".to_string());
                if let Some(l) = holder2.borrow().as_ref() {
                    l.stop()?;
                }
                Ok(())
            },
            vec![],
        )
        .unwrap();
        let _a = src.listen("tick", stopper, false).unwrap();
        let victim = src.listen("tick", recorder(&log, "victim"), false).unwrap();
        *holder.borrow_mut() = Some(victim);

        // The snapshot was taken before the stopper ran, so the victim is
        // still invoked for the in-flight emission but not afterwards.
        src.emit("tick", vec![]).unwrap();
        assert_eq!(*log.borrow(), ["stopper", "victim"]);

        src.emit("tick", vec![]).unwrap();
        assert_eq!(*log.borrow(), ["stopper", "victim", "stopper"]);
    }

    #[test]
    fn reentrant_emission_terminates() {
        let src = Object::new();
        let depth = Rc::new(Cell::new(0));
        let count = Rc::new(Cell::new(0));
        let depth2 = depth.clone();
        let count2 = count.clone();
        let handler = new_closure(
            move |source: Object| -> Result<()> {
                count2.set(count2.get() + 1);
                if depth2.get() < 3 {
                    depth2.set(depth2.get() + 1);
                    source.emit("tick", vec![])?;
                }
                Ok(())
            },
            vec![],
        )
        .unwrap();
        let _l = src.listen("tick", handler, false).unwrap();

        src.emit("tick", vec![]).unwrap();
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn clear_invokes_detach_but_stop_does_not() {
        let src = Object::new();
        let detached = Rc::new(Cell::new(0));

        let make_handler = |detached: &Rc<Cell<i32>>| {
            let handler = new_closure(|_src: Object| -> Result<()> { Ok(()) }, vec![]).unwrap();
            let d = detached.clone();
            handler
                .add_method("__detach", move |_this: Object| -> Result<()> {
                    d.set(d.get() + 1);
                    Ok(())
                })
                .unwrap();
            handler
        };

        // stop_listener: silent to the handler.
        let l = src.listen("tick", make_handler(&detached), false).unwrap();
        l.stop().unwrap();
        assert_eq!(detached.get(), 0);

        // clear_listeners: __detach invoked exactly once.
        let _l2 = src.listen("tick", make_handler(&detached), false).unwrap();
        src.clear_listeners();
        assert_eq!(detached.get(), 1);
        src.clear_listeners();
        assert_eq!(detached.get(), 1);
    }

    #[test]
    fn destroy_clears_listeners_with_detach() {
        let src = Object::new();
        let detached = Rc::new(Cell::new(0));
        let handler = new_closure(|_src: Object| -> Result<()> { Ok(()) }, vec![]).unwrap();
        let d = detached.clone();
        handler
            .add_method("__detach", move |_this: Object| -> Result<()> {
                d.set(d.get() + 1);
                Ok(())
            })
            .unwrap();
        let _l = src.listen("tick", handler, false).unwrap();

        src.destroy();
        assert_eq!(detached.get(), 1);
        assert!(matches!(src.emit("tick", vec![]), Err(Error::Destroyed)));
        assert!(matches!(
            src.listen("tick", Object::new(), false),
            Err(Error::Destroyed)
        ));
    }

    #[test]
    fn add_and_del_listener_hooks_are_edge_triggered() {
        let src = Object::new();
        let edges = Rc::new(RefCell::new(Vec::new()));
        let add = edges.clone();
        src.add_method("__add_listener_tick", move |_this: Object| -> Result<()> {
            add.borrow_mut().push("add");
            Ok(())
        })
        .unwrap();
        let del = edges.clone();
        src.add_method("__del_listener_tick", move |_this: Object| -> Result<()> {
            del.borrow_mut().push("del");
            Ok(())
        })
        .unwrap();

        let h = |_src: Object| -> Result<()> { Ok(()) };
        let a = src.listen("tick", new_closure(h, vec![]).unwrap(), false).unwrap();
        let b = src.listen("tick", new_closure(h, vec![]).unwrap(), false).unwrap();
        assert_eq!(*edges.borrow(), ["add"]);

        a.stop().unwrap();
        assert_eq!(*edges.borrow(), ["add"]);
        b.stop().unwrap();
        assert_eq!(*edges.borrow(), ["add", "del"]);
    }

    #[test]
    fn destroyed_coupling_tears_down_target() {
        let source = Object::new();
        source.register_signal("destroyed", vec![]).unwrap();
        let target = Object::new();
        let _l = listen_to_destroyed(&source, &target).unwrap();

        assert!(!target.is_destroyed());
        source.destroy();
        assert!(target.is_destroyed());
    }
}
