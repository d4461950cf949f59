//! Call core: typed method and closure objects, and dynamic invocation.
//!
//! Callables are ordinary objects whose call slot is populated. Typed
//! callables carry a return tag, the expected run-time argument types and a
//! vector of pre-captured values; invocation converts every positional
//! argument through the type core (including the nil-filling rules), prepends
//! the captures and dispatches to a plain Rust function. The finite table of
//! call shapes is generated over arities 0..=6, which replaces the original
//! runtime-FFI trampoline without changing the contract.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::object::{Object, ObjectCore, WeakObject};
use crate::types::{FromValue, IntoValue, Type, Value};

/// Upper bound on captured plus run-time arguments of a single call.
pub const MAX_NARGS: usize = 16;

// =============================================================================
// Call slots
// =============================================================================

/// A value captured by a closure at construction time.
pub enum Capture {
    /// Deep-copied; owned by the closure and dropped with it.
    Strong(Value),
    /// Borrowed by identity; dereferenced at call time and failing with
    /// `Dangling` once the target is gone or destroyed.
    Weak(WeakObject),
}

impl Clone for Capture {
    fn clone(&self) -> Self {
        match self {
            Capture::Strong(v) => Capture::Strong(v.clone()),
            Capture::Weak(w) => Capture::Weak(w.clone()),
        }
    }
}

pub(crate) struct TypedCall {
    rtype: Type,
    /// Expected types of the run-time arguments (captures excluded).
    atypes: Vec<Type>,
    captures: Vec<Capture>,
    func: Box<dyn Fn(Vec<Value>) -> Result<Value>>,
}

#[derive(Clone)]
pub(crate) enum CallSlot {
    /// Untyped entry point receiving the receiver and raw arguments; used by
    /// surfaces that do their own argument handling (the log module).
    Raw(Rc<dyn Fn(&Object, &[Value]) -> Result<Value>>),
    Typed(Rc<TypedCall>),
}

impl TypedCall {
    fn dispatch(&self, args: &[Value]) -> Result<Value> {
        if args.len() != self.atypes.len() {
            return Err(Error::ArityMismatch {
                expected: self.atypes.len(),
                actual: args.len(),
            });
        }

        let mut full = Vec::with_capacity(self.captures.len() + args.len());
        for capture in &self.captures {
            match capture {
                Capture::Strong(v) => full.push(v.clone()),
                Capture::Weak(w) => {
                    let target = w.upgrade().ok_or(Error::Dangling)?;
                    if target.is_destroyed() {
                        return Err(Error::Dangling);
                    }
                    full.push(Value::Object(target));
                }
            }
        }
        // Converted scratch values live in `full` and are dropped after the
        // dispatch; the caller's arguments are never mutated.
        for (arg, expected) in args.iter().zip(&self.atypes) {
            full.push(arg.convert(*expected)?);
        }
        let result = (self.func)(full)?;
        debug_assert!(
            result.type_().compatible_with(self.rtype),
            "typed call returned {} where {} was declared",
            result.type_(),
            self.rtype
        );
        Ok(result)
    }

    fn has_strong_capture_of(&self, core: &Rc<ObjectCore>) -> bool {
        self.captures.iter().any(|c| match c {
            Capture::Strong(Value::Object(o)) => Rc::ptr_eq(&o.core, core),
            _ => false,
        })
    }
}

/// Refuses to install a callable member whose strong captures include the
/// host object itself; such a member would pin its own host forever.
pub(crate) fn reject_strong_self_capture(host: &Object, value: &Value) -> Result<()> {
    if let Value::Object(candidate) = value {
        if let Some(CallSlot::Typed(tc)) = candidate.core.call.borrow().as_ref() {
            if tc.has_strong_capture_of(&host.core) {
                return Err(Error::InvalidArgument(
                    "callable member strongly captures its own host object".to_string(),
                ));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Typed function shapes
// =============================================================================

/// A plain Rust function exposable through the variant call pipeline. One
/// impl exists per arity; `Shape` is the `fn(args...) -> ret` signature the
/// implementation is selected by.
pub trait TypedFunction<Shape>: 'static {
    fn arg_types() -> Vec<Type>;
    fn ret_type() -> Type;
    fn invoke(&self, args: Vec<Value>) -> Result<Value>;
}

macro_rules! impl_typed_function {
    ($($arg:ident),*) => {
        impl<Fun, Ret, $($arg),*> TypedFunction<fn($($arg),*) -> Ret> for Fun
        where
            Fun: Fn($($arg),*) -> Result<Ret> + 'static,
            Ret: IntoValue,
            $($arg: FromValue,)*
        {
            fn arg_types() -> Vec<Type> {
                vec![$($arg::TYPE),*]
            }

            fn ret_type() -> Type {
                Ret::TYPE
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn invoke(&self, args: Vec<Value>) -> Result<Value> {
                let expected = args.len();
                let mut iter = args.into_iter();
                $(
                    let $arg = $arg::from_value(iter.next().ok_or(
                        Error::ArityMismatch { expected, actual: 0 },
                    )?)?;
                )*
                Ok((self)($($arg),*)?.into_value())
            }
        }
    };
}

impl_typed_function!();
impl_typed_function!(A0);
impl_typed_function!(A0, A1);
impl_typed_function!(A0, A1, A2);
impl_typed_function!(A0, A1, A2, A3);
impl_typed_function!(A0, A1, A2, A3, A4);
impl_typed_function!(A0, A1, A2, A3, A4, A5);

fn check_shape(types: &[Type]) -> Result<()> {
    if types.len() > MAX_NARGS {
        return Err(Error::TooManyArgs);
    }
    for t in types {
        if t.size_of() == 0 {
            return Err(Error::InvalidArgument(format!(
                "{} is not a valid argument type",
                t
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Construction
// =============================================================================

/// Creates a closure object: `func`'s leading parameters are bound to
/// `captures` now, the rest become run-time arguments. Capture types must
/// match the bound parameters; a weak capture binds an object parameter.
pub fn new_closure<Shape, F>(func: F, captures: Vec<Capture>) -> Result<Object>
where
    F: TypedFunction<Shape>,
{
    let all_types = F::arg_types();
    check_shape(&all_types)?;
    if captures.len() > all_types.len() {
        return Err(Error::InvalidArgument(
            "more captures than function parameters".to_string(),
        ));
    }

    for (capture, expected) in captures.iter().zip(&all_types) {
        let actual = match capture {
            Capture::Strong(v) => v.type_(),
            Capture::Weak(_) => Type::Object,
        };
        if !actual.compatible_with(*expected) {
            return Err(Error::TypeMismatch {
                expected: *expected,
                actual,
            });
        }
    }

    let atypes = all_types[captures.len()..].to_vec();
    let obj = Object::new();
    obj.set_type_name("deai:closure");
    *obj.core.call.borrow_mut() = Some(CallSlot::Typed(Rc::new(TypedCall {
        rtype: F::ret_type(),
        atypes,
        captures,
        func: Box::new(move |vals| func.invoke(vals)),
    })));
    Ok(obj)
}

impl Object {
    /// Installs an untyped call slot on this object.
    pub fn set_call_raw(&self, func: impl Fn(&Object, &[Value]) -> Result<Value> + 'static) {
        *self.core.call.borrow_mut() = Some(CallSlot::Raw(Rc::new(func)));
    }

    /// Adds a method member: a callable binding `func` with this object as
    /// the implicit first argument. The receiver is captured weakly, so a
    /// method never keeps its own object alive; invoking it after the
    /// receiver is gone fails with `Dangling`.
    pub fn add_method<Shape, F>(&self, name: &str, func: F) -> Result<()>
    where
        F: TypedFunction<Shape>,
    {
        let all_types = F::arg_types();
        if all_types.first() != Some(&Type::Object) {
            return Err(Error::InvalidArgument(
                "a method must take the receiver object as its first parameter".to_string(),
            ));
        }
        check_shape(&all_types)?;

        let method = Object::new();
        method.set_type_name("deai:method");
        *method.core.call.borrow_mut() = Some(CallSlot::Typed(Rc::new(TypedCall {
            rtype: F::ret_type(),
            atypes: all_types[1..].to_vec(),
            captures: vec![Capture::Weak(self.downgrade())],
            func: Box::new(move |vals| func.invoke(vals)),
        })));
        self.add_member_move(name, false, Value::Object(method))
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Invokes this object's call slot with positional arguments.
    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        if args.len() > MAX_NARGS {
            return Err(Error::TooManyArgs);
        }
        let slot = self
            .core
            .call
            .borrow()
            .clone()
            .ok_or(Error::NotCallable)?;
        match slot {
            CallSlot::Raw(func) => func(self, &args),
            CallSlot::Typed(tc) => tc.dispatch(&args),
        }
    }

    /// Resolves `name` through the member protocol and invokes the result.
    pub fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match self.get(name)? {
            Value::Object(callee) => callee.call(args),
            _ => Err(Error::NotCallable),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn closure_dispatches_with_exact_types() {
        let cl = new_closure(
            |a: i64, b: i64| -> Result<i64> { Ok(a + b) },
            vec![],
        )
        .unwrap();
        assert!(cl.check_type("deai:closure"));

        let sum = cl.call(vec![Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(sum, Value::Int(5));
    }

    #[test]
    fn closure_arity_mismatch() {
        let cl = new_closure(|a: i64| -> Result<i64> { Ok(a) }, vec![]).unwrap();

        assert!(matches!(
            cl.call(vec![]),
            Err(Error::ArityMismatch { expected: 1, actual: 0 })
        ));
        assert!(matches!(
            cl.call(vec![Value::Int(1), Value::Int(2)]),
            Err(Error::ArityMismatch { expected: 1, actual: 2 })
        ));
        assert!(cl.call(vec![Value::Int(1)]).is_ok());
    }

    #[test]
    fn arguments_are_converted() {
        let cl = new_closure(|v: f64| -> Result<f64> { Ok(v * 2.0) }, vec![]).unwrap();
        // An integer argument converts to the declared float parameter.
        assert_eq!(cl.call(vec![Value::Int(4)]).unwrap(), Value::Float(8.0));
    }

    #[test]
    fn out_of_range_argument_never_enters_body() {
        let entered = Rc::new(Cell::new(false));
        let flag = entered.clone();
        let cl = new_closure(
            move |_v: i32| -> Result<()> {
                flag.set(true);
                Ok(())
            },
            vec![],
        )
        .unwrap();

        let err = cl.call(vec![Value::Int(i64::MAX)]).unwrap_err();
        assert!(matches!(err, Error::OutOfRange(Type::NInt)));
        assert!(!entered.get());
    }

    #[test]
    fn nil_argument_fills_object_parameter() {
        let cl = new_closure(
            |o: Object| -> Result<String> { Ok(o.type_name()) },
            vec![],
        )
        .unwrap();
        assert_eq!(
            cl.call(vec![Value::Nil]).unwrap(),
            Value::String("deai:object".to_string())
        );
    }

    #[test]
    fn strong_capture_is_copied() {
        let cl = new_closure(
            |greeting: String, name: String| -> Result<String> {
                Ok(format!("{} {}", greeting, name))
            },
            vec![Capture::Strong(Value::String("hello".to_string()))],
        )
        .unwrap();

        assert_eq!(
            cl.call(vec![Value::String("world".to_string())]).unwrap(),
            Value::String("hello world".to_string())
        );
    }

    #[test]
    fn weak_capture_dangles_after_destroy() {
        let target = Object::new();
        let cl = new_closure(
            |o: Object| -> Result<String> { Ok(o.type_name()) },
            vec![Capture::Weak(target.downgrade())],
        )
        .unwrap();

        assert!(cl.call(vec![]).is_ok());
        target.destroy();
        assert!(matches!(cl.call(vec![]), Err(Error::Dangling)));
    }

    #[test]
    fn capture_type_mismatch_is_refused() {
        let result = new_closure(
            |_a: i64, _b: i64| -> Result<()> { Ok(()) },
            vec![Capture::Strong(Value::Float(1.0))],
        );
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn method_receives_receiver_and_dangles_when_gone() {
        let obj = Object::new();
        obj.set_type_name("deai:test");
        obj.add_method("whoami", |this: Object| -> Result<String> {
            Ok(this.type_name())
        })
        .unwrap();

        assert_eq!(
            obj.call_method("whoami", vec![]).unwrap(),
            Value::String("deai:test".to_string())
        );

        let method = match obj.raw_get("whoami").unwrap() {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        drop(obj);
        assert!(matches!(method.call(vec![]), Err(Error::Dangling)));
    }

    #[test]
    fn method_must_take_receiver_first() {
        let obj = Object::new();
        let result = obj.add_method("bad", |_x: i64| -> Result<()> { Ok(()) });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn strong_self_capture_is_refused_at_insertion() {
        let obj = Object::new();
        let cl = new_closure(
            |_o: Object| -> Result<()> { Ok(()) },
            vec![Capture::Strong(Value::Object(obj.clone()))],
        )
        .unwrap();

        let err = obj
            .add_member_move("leaky", false, Value::Object(cl.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // The same closure is fine on a different host.
        let other = Object::new();
        other
            .add_member_move("ok", false, Value::Object(cl))
            .unwrap();
    }

    #[test]
    fn not_callable_and_destroyed() {
        let obj = Object::new();
        assert!(matches!(obj.call(vec![]), Err(Error::NotCallable)));

        let cl = new_closure(|| -> Result<()> { Ok(()) }, vec![]).unwrap();
        cl.destroy();
        assert!(matches!(cl.call(vec![]), Err(Error::Destroyed)));
    }

    #[test]
    fn too_many_arguments() {
        let cl = new_closure(|| -> Result<()> { Ok(()) }, vec![]).unwrap();
        let args = vec![Value::Int(0); MAX_NARGS + 1];
        assert!(matches!(cl.call(args), Err(Error::TooManyArgs)));
    }

    #[test]
    fn raw_call_slot_receives_receiver() {
        let obj = Object::new();
        obj.set_call_raw(|this, args| {
            Ok(Value::String(format!("{} args on {}", args.len(), this.type_name())))
        });
        assert_eq!(
            obj.call(vec![Value::Int(1), Value::Int(2)]).unwrap(),
            Value::String("2 args on deai:object".to_string())
        );
    }

    #[test]
    fn call_method_resolves_through_getters() {
        let obj = Object::new();
        let helper = new_closure(|| -> Result<i64> { Ok(11) }, vec![]).unwrap();
        let helper_value = Value::Object(helper);
        obj.add_method("__get_lazy", move |_this: Object| -> Result<Object> {
            match &helper_value {
                Value::Object(o) => Ok(o.clone()),
                _ => unreachable!(),
            }
        })
        .unwrap();

        assert_eq!(obj.call_method("lazy", vec![]).unwrap(), Value::Int(11));
        assert!(matches!(
            obj.call_method("missing", vec![]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn non_callable_member_is_not_called() {
        let obj = Object::new();
        obj.add_member_move("data", false, Value::Object(Object::new()))
            .unwrap();
        assert!(matches!(
            obj.call_method("data", vec![]),
            Err(Error::NotCallable)
        ));
    }

}
