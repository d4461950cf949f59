//! Object core: the member table, reference counting and the destruction
//! state machine, plus the getter/setter member protocol.
//!
//! An [`Object`] is a cheap handle over a shared core; cloning a handle
//! acquires a strong reference and dropping one releases it. All mutation
//! happens on the event-loop thread, so the interior is `RefCell`/`Cell`
//! based with no locking.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::callable::{self, CallSlot};
use crate::error::{Error, Result};
use crate::signal::{self, SignalSlot};
use crate::types::{Type, Value};

/// Default type tag of objects that never had one installed.
pub const DEFAULT_TYPE_NAME: &str = "deai:object";

// =============================================================================
// Probe-key interner
// =============================================================================

// `__get_<name>`-style probe keys are interned process-wide instead of being
// concatenated on every access. The set only ever grows; keys are leaked by
// construction.
static PROBE_KEYS: Lazy<Mutex<HashSet<&'static str>>> = Lazy::new(|| Mutex::new(HashSet::new()));

pub(crate) fn probe_key(prefix: &str, name: &str) -> &'static str {
    let mut keys = PROBE_KEYS.lock();
    let candidate = format!("{}{}", prefix, name);
    if let Some(existing) = keys.get(candidate.as_str()) {
        return existing;
    }
    let leaked: &'static str = Box::leak(candidate.into_boxed_str());
    keys.insert(leaked);
    leaked
}

// =============================================================================
// Core types
// =============================================================================

/// Destruction state. Transitions are one-way:
/// Healthy -> Apoptosing -> (Orphaned | Dead).
///
/// `Orphaned` means the destructor has run but strong references remain; the
/// husk lingers until the final strong reference drops, with no further
/// destructor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Healthy,
    Apoptosing,
    Orphaned,
    Dead,
}

/// A named slot on an object.
#[derive(Debug, Clone)]
pub struct Member {
    pub value: Value,
    pub writable: bool,
    /// Whether the object owns the value. All values are dropped with the
    /// member in this implementation; the flag records the insertion policy.
    pub own: bool,
}

pub(crate) struct ObjectCore {
    pub(crate) members: RefCell<HashMap<String, Member>>,
    pub(crate) signals: RefCell<HashMap<String, SignalSlot>>,
    pub(crate) dtor: RefCell<Option<Box<dyn FnOnce()>>>,
    pub(crate) call: RefCell<Option<CallSlot>>,
    pub(crate) state: Cell<ObjectState>,
}

/// Strong handle to an object. `Clone` acquires a reference, `Drop` releases
/// one; the core is torn down when the last strong handle goes away.
#[derive(Clone)]
pub struct Object {
    pub(crate) core: Rc<ObjectCore>,
}

/// Weak handle; upgrades fail once the object's memory is released.
#[derive(Clone)]
pub struct WeakObject {
    core: Weak<ObjectCore>,
}

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        self.core.upgrade().map(|core| Object { core })
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("addr", &Rc::as_ptr(&self.core))
            .field("state", &self.core.state.get())
            .finish()
    }
}

impl Default for Object {
    fn default() -> Self {
        Object::new()
    }
}

// =============================================================================
// Object operations
// =============================================================================

impl Object {
    /// Creates a Healthy object with one strong reference, empty member and
    /// signal maps, no destructor and no call slot.
    pub fn new() -> Object {
        Object {
            core: Rc::new(ObjectCore {
                members: RefCell::new(HashMap::new()),
                signals: RefCell::new(HashMap::new()),
                dtor: RefCell::new(None),
                call: RefCell::new(None),
                state: Cell::new(ObjectState::Healthy),
            }),
        }
    }

    pub fn state(&self) -> ObjectState {
        self.core.state.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.state.get() != ObjectState::Healthy
    }

    /// Number of strong references currently held.
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.core)
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject {
            core: Rc::downgrade(&self.core),
        }
    }

    // =========================================================================
    // Type tag
    // =========================================================================

    /// Installs the `__type` tag (a string literal, never freed). Replaces a
    /// previous tag.
    pub fn set_type_name(&self, name: &'static str) {
        self.core.members.borrow_mut().insert(
            "__type".to_string(),
            Member {
                value: Value::StringLiteral(name),
                writable: false,
                own: false,
            },
        );
    }

    pub fn type_name(&self) -> String {
        match self.raw_get("__type") {
            Some(Value::String(s)) => s,
            Some(Value::StringLiteral(s)) => s.to_string(),
            _ => DEFAULT_TYPE_NAME.to_string(),
        }
    }

    pub fn check_type(&self, name: &str) -> bool {
        self.type_name() == name
    }

    // =========================================================================
    // Members
    // =========================================================================

    fn ensure_healthy(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        Ok(())
    }

    fn add_member(&self, name: &str, writable: bool, own: bool, value: Value) -> Result<()> {
        self.ensure_healthy()?;
        callable::reject_strong_self_capture(self, &value)?;
        let mut members = self.core.members.borrow_mut();
        if members.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        members.insert(
            name.to_string(),
            Member {
                value,
                writable,
                own,
            },
        );
        Ok(())
    }

    /// Adds a member, transferring ownership of the value to the object.
    pub fn add_member_move(&self, name: &str, writable: bool, value: Value) -> Result<()> {
        self.add_member(name, writable, true, value)
    }

    /// Adds a member borrowing the value: the slot holds a shallow copy and
    /// is marked not-owned. Object values still contribute a strong
    /// reference.
    pub fn add_member_ref(&self, name: &str, writable: bool, value: &Value) -> Result<()> {
        self.add_member(name, writable, false, value.clone())
    }

    /// Adds a member with a deep copy of the value, owned by the object.
    pub fn add_member_clone(&self, name: &str, writable: bool, value: &Value) -> Result<()> {
        self.add_member(name, writable, true, value.clone())
    }

    /// Removes a member, dropping its value (releasing the strong reference
    /// for object members).
    pub fn remove_member(&self, name: &str) -> Result<()> {
        self.ensure_healthy()?;
        self.core
            .members
            .borrow_mut()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Raw member lookup; no getter is consulted.
    pub fn lookup(&self, name: &str) -> Option<Member> {
        self.core.members.borrow().get(name).cloned()
    }

    /// Raw value lookup; no getter is consulted.
    pub fn raw_get(&self, name: &str) -> Option<Value> {
        self.core
            .members
            .borrow()
            .get(name)
            .map(|m| m.value.clone())
    }

    /// Names of all plain members. Protocol slots (leading `__`) are hidden
    /// from casual enumeration.
    pub fn member_names(&self) -> Vec<String> {
        self.core
            .members
            .borrow()
            .keys()
            .filter(|k| !k.starts_with("__"))
            .cloned()
            .collect()
    }

    fn callable_member(&self, name: &str) -> Option<Object> {
        match self.raw_get(name) {
            Some(Value::Object(o)) if o.has_call() => Some(o),
            _ => None,
        }
    }

    pub fn has_call(&self) -> bool {
        self.core.call.borrow().is_some()
    }

    // =========================================================================
    // Member protocol (getters and setters)
    // =========================================================================

    /// Reads `self.name` through the full resolution chain: explicit member,
    /// then `__get_<name>`, then the generic `__get`.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.ensure_healthy()?;
        if let Some(member) = self.lookup(name) {
            return Ok(member.value);
        }
        if let Some(getter) = self.callable_member(probe_key("__get_", name)) {
            return getter.call(vec![]);
        }
        if let Some(getter) = self.callable_member("__get") {
            return getter.call(vec![Value::String(name.to_string())]);
        }
        Err(Error::NotFound(name.to_string()))
    }

    /// Writes `self.name = value` through the resolution chain:
    /// `__set_<name>`, then a writable member (converted to the member's
    /// declared type; member types never change on write), then the generic
    /// `__set`.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        self.ensure_healthy()?;
        if let Some(setter) = self.callable_member(probe_key("__set_", name)) {
            return setter.call(vec![value]).map(|_| ());
        }

        let declared = {
            let members = self.core.members.borrow();
            members
                .get(name)
                .filter(|m| m.writable)
                .map(|m| m.value.type_())
        };
        if let Some(declared) = declared {
            let converted = value.convert(declared)?;
            let mut members = self.core.members.borrow_mut();
            if let Some(member) = members.get_mut(name) {
                member.value = converted;
                return Ok(());
            }
        }

        if let Some(setter) = self.callable_member("__set") {
            return setter
                .call(vec![Value::String(name.to_string()), value])
                .map(|_| ());
        }
        Err(Error::NotFound(name.to_string()))
    }

    // =========================================================================
    // Lifetime
    // =========================================================================

    /// Installs the native destructor, replacing any previous one. The
    /// destructor must not keep the object alive; if it does, the object
    /// lingers until the final strong reference drops and the destructor is
    /// not run again.
    pub fn set_destructor(&self, dtor: impl FnOnce() + 'static) {
        if self.is_destroyed() {
            return;
        }
        *self.core.dtor.borrow_mut() = Some(Box::new(dtor));
    }

    /// Initiates apoptosis: runs the destructor (native slot, then a
    /// callable `__dtor` member if present), clears all listeners (invoking
    /// their `__detach` hooks), removes all members and marks the object
    /// destroyed. Idempotent: repeated calls are no-ops.
    pub fn destroy(&self) {
        if self.core.state.get() != ObjectState::Healthy {
            return;
        }
        self.core.state.set(ObjectState::Apoptosing);

        let dtor = self.core.dtor.borrow_mut().take();
        if let Some(dtor) = dtor {
            dtor();
        }
        if let Some(dtor_member) = self.callable_member("__dtor") {
            if let Err(err) = dtor_member.call(vec![]) {
                log::warn!("__dtor of {} failed: {}", self.type_name(), err);
            }
        }

        signal::clear_listeners_of_core(&self.core);
        self.core.members.borrow_mut().clear();
        *self.core.call.borrow_mut() = None;

        // The handle running destroy accounts for one strong reference.
        let next = if Rc::strong_count(&self.core) > 1 {
            ObjectState::Orphaned
        } else {
            ObjectState::Dead
        };
        self.core.state.set(next);
    }
}

impl Drop for ObjectCore {
    fn drop(&mut self) {
        // The final strong reference dropped without an explicit destroy:
        // run the teardown here. Members and the call slot are released by
        // the normal field drops that follow.
        if self.state.get() == ObjectState::Healthy {
            self.state.set(ObjectState::Apoptosing);
            let dtor = self.dtor.borrow_mut().take();
            if let Some(dtor) = dtor {
                dtor();
            }
            signal::clear_listeners_of_core(self);
            self.state.set(ObjectState::Dead);
        }
    }
}

// =============================================================================
// Property helpers
// =============================================================================

impl Object {
    /// Registers a read-only property by installing a `__get_<name>` method.
    pub fn add_property_ro<A, G>(&self, name: &str, getter: G) -> Result<()>
    where
        G: callable::TypedFunction<A> + 'static,
    {
        self.add_method(&format!("__get_{}", name), getter)
    }

    /// Registers a read-write property by installing `__get_<name>` and
    /// `__set_<name>` methods.
    pub fn add_property<A, B, G, S>(&self, name: &str, getter: G, setter: S) -> Result<()>
    where
        G: callable::TypedFunction<A> + 'static,
        S: callable::TypedFunction<B> + 'static,
    {
        self.add_method(&format!("__get_{}", name), getter)?;
        self.add_method(&format!("__set_{}", name), setter)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;

    #[test]
    fn member_add_lookup_remove() {
        let obj = Object::new();
        obj.add_member_move("x", false, Value::Int(3)).unwrap();

        let m = obj.lookup("x").unwrap();
        assert_eq!(m.value.type_(), Type::Int);
        assert!(m.own);

        assert!(matches!(
            obj.add_member_move("x", false, Value::Int(4)),
            Err(Error::AlreadyExists(_))
        ));

        obj.remove_member("x").unwrap();
        assert!(matches!(obj.remove_member("x"), Err(Error::NotFound(_))));
    }

    #[test]
    fn protocol_slots_hidden_from_enumeration() {
        let obj = Object::new();
        obj.set_type_name("deai:test");
        obj.add_member_move("visible", false, Value::Int(1)).unwrap();
        obj.add_member_move("__hidden", false, Value::Int(2)).unwrap();

        let names = obj.member_names();
        assert_eq!(names, vec!["visible".to_string()]);
    }

    #[test]
    fn type_name_defaults() {
        let obj = Object::new();
        assert_eq!(obj.type_name(), "deai:object");
        assert!(obj.check_type("deai:object"));
        obj.set_type_name("deai:test");
        assert!(obj.check_type("deai:test"));
    }

    #[test]
    fn object_member_holds_strong_reference() {
        let inner = Object::new();
        let count = inner.strong_count();
        let holder = Object::new();
        holder
            .add_member_move("inner", false, Value::Object(inner.clone()))
            .unwrap();
        assert_eq!(inner.strong_count(), count + 1);
        holder.remove_member("inner").unwrap();
        assert_eq!(inner.strong_count(), count);
    }

    #[test]
    fn copy_free_balance_for_object_values() {
        let obj = Object::new();
        let value = Value::Object(obj.clone());
        let baseline = obj.strong_count();
        let copy = value.clone();
        assert_eq!(obj.strong_count(), baseline + 1);
        drop(copy);
        assert_eq!(obj.strong_count(), baseline);
    }

    #[test]
    fn destroy_runs_destructor_exactly_once() {
        let ran = Rc::new(StdCell::new(0));
        let obj = Object::new();
        let ran2 = ran.clone();
        obj.set_destructor(move || ran2.set(ran2.get() + 1));

        obj.destroy();
        obj.destroy();
        assert_eq!(ran.get(), 1);
        assert!(obj.is_destroyed());
    }

    #[test]
    fn drop_without_destroy_runs_destructor() {
        let ran = Rc::new(StdCell::new(0));
        let obj = Object::new();
        let ran2 = ran.clone();
        obj.set_destructor(move || ran2.set(ran2.get() + 1));
        drop(obj);
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn operations_fail_after_destroy() {
        let obj = Object::new();
        obj.add_member_move("x", true, Value::Int(1)).unwrap();
        obj.destroy();

        assert!(matches!(obj.get("x"), Err(Error::Destroyed)));
        assert!(matches!(obj.set("x", Value::Int(2)), Err(Error::Destroyed)));
        assert!(matches!(
            obj.add_member_move("y", false, Value::Int(1)),
            Err(Error::Destroyed)
        ));
        assert!(matches!(obj.remove_member("x"), Err(Error::Destroyed)));
    }

    #[test]
    fn destroy_clears_members() {
        let inner = Object::new();
        let baseline = inner.strong_count();
        let holder = Object::new();
        holder
            .add_member_move("inner", false, Value::Object(inner.clone()))
            .unwrap();
        holder.destroy();
        assert_eq!(inner.strong_count(), baseline);
    }

    #[test]
    fn orphaned_when_references_remain() {
        let obj = Object::new();
        let extra = obj.clone();
        obj.destroy();
        assert_eq!(obj.state(), ObjectState::Orphaned);
        drop(extra);
    }

    #[test]
    fn getter_and_setter_protocol() {
        let obj = Object::new();
        let recorded = Rc::new(StdCell::new(0i64));

        obj.add_method("__get_x", |_this: Object| -> Result<i64> { Ok(7) })
            .unwrap();
        let rec = recorded.clone();
        obj.add_method("__set_x", move |_this: Object, v: i64| -> Result<()> {
            rec.set(v);
            Ok(())
        })
        .unwrap();

        assert_eq!(obj.get("x").unwrap(), Value::Int(7));
        obj.set("x", Value::Int(9)).unwrap();
        assert_eq!(recorded.get(), 9);
    }

    #[test]
    fn raw_get_skips_getters() {
        let obj = Object::new();
        obj.add_method("__get_x", |_this: Object| -> Result<i64> { Ok(7) })
            .unwrap();
        assert!(obj.raw_get("x").is_none());
        assert!(obj.get("x").is_ok());
    }

    #[test]
    fn generic_getter_and_setter() {
        let obj = Object::new();
        let last = Rc::new(RefCell::new(String::new()));

        obj.add_method("__get", |_this: Object, name: String| -> Result<String> {
            Ok(format!("got {}", name))
        })
        .unwrap();
        let last2 = last.clone();
        obj.add_method(
            "__set",
            move |_this: Object, name: String, v: i64| -> Result<()> {
                *last2.borrow_mut() = format!("{}={}", name, v);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(
            obj.get("anything").unwrap(),
            Value::String("got anything".to_string())
        );
        obj.set("k", Value::Int(5)).unwrap();
        assert_eq!(&*last.borrow(), "k=5");
    }

    #[test]
    fn write_converts_to_member_type() {
        let obj = Object::new();
        obj.add_member_move("n", true, Value::NInt(1)).unwrap();

        // An in-range 64-bit write narrows to the member's declared type.
        obj.set("n", Value::Int(5)).unwrap();
        assert_eq!(obj.raw_get("n").unwrap(), Value::NInt(5));

        // The declared type never changes on write.
        assert!(matches!(
            obj.set("n", Value::Float(1.0)),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn non_writable_member_rejects_writes() {
        let obj = Object::new();
        obj.add_member_move("ro", false, Value::Int(1)).unwrap();
        assert!(matches!(obj.set("ro", Value::Int(2)), Err(Error::NotFound(_))));
        assert_eq!(obj.raw_get("ro").unwrap(), Value::Int(1));
    }

    #[test]
    fn property_helper_installs_both_accessors() {
        let obj = Object::new();
        let cell = Rc::new(StdCell::new(1.0f64));
        let g = cell.clone();
        let s = cell.clone();
        obj.add_property(
            "ratio",
            move |_this: Object| -> Result<f64> { Ok(g.get()) },
            move |_this: Object, v: f64| -> Result<()> {
                s.set(v);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(obj.get("ratio").unwrap(), Value::Float(1.0));
        obj.set("ratio", Value::Float(2.5)).unwrap();
        assert_eq!(cell.get(), 2.5);
    }
}
