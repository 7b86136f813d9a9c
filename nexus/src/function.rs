//! The Function Descriptor (spec.md section 4.3): wraps a user operation
//! with argument types, a mutability mask per argument, a return type, an
//! optional precondition, and execution bookkeeping.
//!
//! Compile-time signature reflection is generated by `IntoDescriptor`, a
//! family of trait impls over zero-to-four-argument closures (DESIGN NOTES:
//! "implemented once via a macro_rules! that emits one impl ... per
//! arity"). Arguments bind through `Ref<T>`/`RefMut<T>` marker wrapper
//! types rather than raw `&T`/`&mut T` so that a *single* generic impl per
//! arity suffices instead of one per mutability combination — the same
//! "parameter extractor" idiom web frameworks use for handler functions.

use std::any::{Any, TypeId};
use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use crate::value::Value;

/// A borrowed, non-mutable argument binding.
pub struct Ref<'a, T>(&'a T);

impl<'a, T> Deref for Ref<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.0
    }
}

/// A borrowed, mutable argument binding.
pub struct RefMut<'a, T>(&'a mut T);

impl<'a, T> Deref for RefMut<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.0
    }
}

impl<'a, T> DerefMut for RefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.0
    }
}

/// Binds one op argument position to a `Value` pool slot, for exactly the
/// lifetime of one `execute` call.
pub trait ArgBinding<'v> {
    const MUTABLE: bool;
    type Owned: Any;
    fn bind(v: &'v mut Value) -> Self;
}

impl<'v, T: Any> ArgBinding<'v> for Ref<'v, T> {
    const MUTABLE: bool = false;
    type Owned = T;
    fn bind(v: &'v mut Value) -> Self {
        Ref(v
            .downcast_ref::<T>()
            .unwrap_or_else(|| panic!("nexus: argument type mismatch for {}", v.type_name())))
    }
}

impl<'v, T: Any> ArgBinding<'v> for RefMut<'v, T> {
    const MUTABLE: bool = true;
    type Owned = T;
    fn bind(v: &'v mut Value) -> Self {
        RefMut(
            v.downcast_mut::<T>()
                .unwrap_or_else(|| panic!("nexus: argument type mismatch")),
        )
    }
}

/// Blanket return-value conversion: any `Any` type maps to `Some(Value)`,
/// except `()`, which maps to `None` ("void returns yield void `Value`",
/// spec.md section 4.3). Checked by runtime `TypeId` comparison inside a
/// single blanket impl rather than two overlapping impls, since `()` is
/// itself `Any` and a specialized `impl RetVal for ()` would conflict with
/// a blanket `impl<T: Any> RetVal for T`.
pub trait RetVal: Any + Sized {
    fn return_type_id() -> Option<TypeId> {
        if TypeId::of::<Self>() == TypeId::of::<()>() {
            None
        } else {
            Some(TypeId::of::<Self>())
        }
    }
    fn return_type_name() -> Option<&'static str> {
        if TypeId::of::<Self>() == TypeId::of::<()>() {
            None
        } else {
            Some(std::any::type_name::<Self>())
        }
    }
    fn into_descriptor_return(self) -> Option<Value> {
        if TypeId::of::<Self>() == TypeId::of::<()>() {
            None
        } else {
            Some(Value::new(self))
        }
    }
}
impl<T: Any> RetVal for T {}

/// A precondition attached to a `FunctionDescriptor` via `when`/`when_not`
/// (spec.md section 4.3). Takes `&[&Value]` rather than `&[Value]` because
/// the Machine evaluates preconditions against candidate arguments that
/// still live scattered across several `ValueSet`s, before committing to
/// take them out of the pool.
pub struct Precondition {
    matcher: Box<dyn Fn(&[&Value]) -> bool>,
}

impl Precondition {
    /// A single-argument precondition, applied to *every* argument of type
    /// `T` among the op's arguments (all must pass).
    pub fn on1<T: Any>(f: impl Fn(&T) -> bool + 'static) -> Self {
        Precondition {
            matcher: Box::new(move |args: &[&Value]| {
                args.iter()
                    .filter_map(|v| v.downcast_ref::<T>())
                    .all(|v| f(v))
            }),
        }
    }

    /// A multi-argument precondition, applied one-for-one to the op's
    /// argument prefix `(A, B)`. Vacuously true if the op's arity or types
    /// don't match the prefix (the author is expected to attach it only to
    /// ops where they do).
    pub fn on2<A: Any, B: Any>(f: impl Fn(&A, &B) -> bool + 'static) -> Self {
        Precondition {
            matcher: Box::new(move |args: &[&Value]| {
                match (
                    args.get(0).and_then(|v| v.downcast_ref::<A>()),
                    args.get(1).and_then(|v| v.downcast_ref::<B>()),
                ) {
                    (Some(a), Some(b)) => f(a, b),
                    _ => true,
                }
            }),
        }
    }
}

/// Runtime metadata wrapping a user callable for dynamic dispatch by the
/// Machine (spec.md section 3 "Function Descriptor", section 4.3).
pub struct FunctionDescriptor {
    pub name: &'static str,
    pub arg_types: Vec<TypeId>,
    pub arg_type_names: Vec<&'static str>,
    pub arg_is_mutable: Vec<bool>,
    pub return_type: Option<TypeId>,
    pub return_type_name: Option<&'static str>,
    execute_fn: Box<dyn Fn(&mut [Value]) -> Option<Value>>,
    precondition: Option<Box<dyn Fn(&[Value]) -> bool>>,
    pub min_executions: u32,
    executions: Cell<u32>,
    pub is_invariant: bool,
    pub is_optional: bool,
    internal_index: Cell<Option<usize>>,
}

impl FunctionDescriptor {
    fn new(
        name: &'static str,
        arg_types: Vec<TypeId>,
        arg_type_names: Vec<&'static str>,
        arg_is_mutable: Vec<bool>,
        return_type: Option<TypeId>,
        return_type_name: Option<&'static str>,
        execute_fn: Box<dyn Fn(&mut [Value]) -> Option<Value>>,
    ) -> Self {
        debug_assert_eq!(arg_types.len(), arg_is_mutable.len());
        FunctionDescriptor {
            name,
            arg_types,
            arg_type_names,
            arg_is_mutable,
            return_type,
            return_type_name,
            execute_fn,
            precondition: None,
            min_executions: 0,
            executions: Cell::new(0),
            is_invariant: false,
            is_optional: false,
            internal_index: Cell::new(None),
        }
    }

    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }

    /// Minimum number of times this op must execute before the Machine's
    /// loop may terminate (spec.md section 4.4).
    pub fn min_executions(mut self, n: u32) -> Self {
        self.min_executions = n;
        self
    }

    /// Marks this descriptor as an invariant: `arity >= 1`, return type
    /// `void` or `bool` (spec.md section 3).
    pub fn invariant(mut self) -> Self {
        assert!(
            self.return_type.is_none() || self.return_type == Some(TypeId::of::<bool>()),
            "nexus: invariant `{}` must return void or bool",
            self.name
        );
        assert!(
            self.arity() >= 1,
            "nexus: invariant `{}` must have arity >= 1",
            self.name
        );
        self.is_invariant = true;
        self.is_optional = true;
        self
    }

    pub fn when(mut self, pred: Precondition) -> Self {
        self.precondition = Some(pred.matcher);
        self
    }

    pub fn when_not(mut self, pred: Precondition) -> Self {
        let inner = pred.matcher;
        self.precondition = Some(Box::new(move |args| !inner(args)));
        self
    }

    pub fn has_precondition(&self) -> bool {
        self.precondition.is_some()
    }

    pub fn satisfies_precondition(&self, args: &[&Value]) -> bool {
        self.precondition.as_ref().map_or(true, |p| p(args))
    }

    /// Invokes the wrapped callable, incrementing the execution counter.
    pub fn execute(&self, args: &mut [Value]) -> Option<Value> {
        self.executions.set(self.executions.get() + 1);
        (self.execute_fn)(args)
    }

    pub fn executions(&self) -> u32 {
        self.executions.get()
    }

    pub fn reset_executions(&self) {
        self.executions.set(0);
    }

    pub fn internal_index(&self) -> Option<usize> {
        self.internal_index.get()
    }

    pub fn set_internal_index(&self, idx: usize) {
        self.internal_index.set(Some(idx));
    }

    /// Whether this op is a *safe generator* of its return type: a
    /// non-invariant function whose return type appears nowhere in its
    /// argument list (spec.md GLOSSARY).
    pub fn is_safe_generator_of(&self, ty: TypeId) -> bool {
        !self.is_invariant
            && self.return_type == Some(ty)
            && !self.arg_types.contains(&ty)
    }
}

/// Implemented for zero-to-four-argument closures; extracted into a
/// `FunctionDescriptor` by `op()`.
pub trait IntoDescriptor<Args> {
    fn into_descriptor(self, name: &'static str) -> FunctionDescriptor;
}

macro_rules! impl_into_descriptor {
    ($($A:ident),*) => {
        #[allow(non_snake_case, unused_mut, unused_variables)]
        impl<Func, $($A,)* R> IntoDescriptor<($($A,)*)> for Func
        where
            Func: Fn($($A),*) -> R + 'static,
            $( for<'v> $A: ArgBinding<'v> + 'static, )*
            R: RetVal,
        {
            fn into_descriptor(self, name: &'static str) -> FunctionDescriptor {
                let arg_types = vec![$( TypeId::of::<$A::Owned>() ),*];
                let arg_type_names = vec![$( std::any::type_name::<$A::Owned>() ),*];
                let arg_is_mutable = vec![$( $A::MUTABLE ),*];
                FunctionDescriptor::new(
                    name,
                    arg_types,
                    arg_type_names,
                    arg_is_mutable,
                    R::return_type_id(),
                    R::return_type_name(),
                    Box::new(move |args: &mut [Value]| {
                        let mut iter = args.iter_mut();
                        $( let $A = $A::bind(iter.next().expect("nexus: arity mismatch")); )*
                        let ret = (self)($($A),*);
                        ret.into_descriptor_return()
                    }),
                )
            }
        }
    };
}

impl_into_descriptor!();
impl_into_descriptor!(A0);
impl_into_descriptor!(A0, A1);
impl_into_descriptor!(A0, A1, A2);
impl_into_descriptor!(A0, A1, A2, A3);

/// Builds a `FunctionDescriptor` from any supported closure shape.
pub fn op<Func, Args>(name: &'static str, f: Func) -> FunctionDescriptor
where
    Func: IntoDescriptor<Args>,
{
    f.into_descriptor(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stack(Vec<i32>);

    fn push(mut s: RefMut<Stack>, v: Ref<i32>) {
        s.0.push(*v);
    }

    fn gen_int() -> i32 {
        0
    }

    #[test]
    fn reflects_arity_and_mutability() {
        let d = op("push", push);
        assert_eq!(d.arity(), 2);
        assert_eq!(d.arg_is_mutable, vec![true, false]);
        assert_eq!(d.return_type, None);
    }

    #[test]
    fn safe_generator_detection() {
        let d = op("gen_int", gen_int);
        assert!(d.is_safe_generator_of(TypeId::of::<i32>()));
    }
}
