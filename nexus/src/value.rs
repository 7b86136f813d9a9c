//! The heterogeneous Value Pool (spec.md section 4.3 / DESIGN NOTES
//! "heterogeneous value pool"). A `Value` is a type-erased, owned slot
//! realized as `Box<dyn Any>` plus a `TypeId` recorded at construction;
//! `Box<dyn Any>`'s ordinary drop glue gives "destruction frees exactly
//! once" for free, so no custom deleter function pointer is needed.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// An owned, type-erased value living in exactly one pool slot at a time
/// (spec.md section 5: "Value ownership in the Machine is exclusive").
pub struct Value {
    type_id: TypeId,
    type_name: &'static str,
    inner: Box<dyn Any>,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Value").field("type", &self.type_name).finish()
    }
}

impl Value {
    pub fn new<T: Any>(v: T) -> Self {
        Value {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            inner: Box::new(v),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.inner.downcast_mut()
    }

    pub fn into_inner<T: Any>(self) -> Result<T, Self> {
        if self.type_id == TypeId::of::<T>() {
            Ok(*self.inner.downcast::<T>().expect("type_id matched"))
        } else {
            Err(self)
        }
    }
}

/// The small per-type vtable from DESIGN NOTES: `{drop, clone?, to_string?,
/// equal?}`, minus `drop`/`clone`, which `Box<dyn Any>` already provides
/// and which spec.md never requires (Values are moved, not cloned).
pub struct TypeOps {
    pub name: &'static str,
    to_string: Option<Box<dyn Fn(&Value) -> String>>,
    equal: Option<Box<dyn Fn(&Value, &Value) -> bool>>,
}

impl TypeOps {
    pub fn new<T: Any>() -> Self {
        TypeOps {
            name: std::any::type_name::<T>(),
            to_string: None,
            equal: None,
        }
    }

    pub fn with_to_string<T: Any>(mut self, f: impl Fn(&T) -> String + 'static) -> Self {
        self.to_string = Some(Box::new(move |v: &Value| {
            v.downcast_ref::<T>()
                .map(|t| f(t))
                .unwrap_or_else(|| "<type mismatch>".to_string())
        }));
        self
    }

    pub fn with_debug<T: Any + fmt::Debug>(self) -> Self {
        self.with_to_string::<T>(|t| format!("{:?}", t))
    }

    pub fn with_equal<T: Any>(mut self, f: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equal = Some(Box::new(move |a: &Value, b: &Value| {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => f(a, b),
                _ => false,
            }
        }));
        self
    }

    pub fn with_eq<T: Any + PartialEq>(self) -> Self {
        self.with_equal::<T>(|a, b| a == b)
    }
}

/// Registry of `TypeOps`, populated as `FunctionDescriptor`s declaring a
/// type are added to a Machine (spec.md 4.3's "small vtable ... per
/// registered type"). Lets printer/equality registration stay opt-in and
/// per-type rather than requiring every pool type to implement a nexus
/// trait.
#[derive(Default)]
pub struct TypeRegistry {
    ops: HashMap<TypeId, TypeOps>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: TypeId, ops: TypeOps) {
        self.ops.entry(id).or_insert(ops);
    }

    /// Best-effort representative string for a value, falling back to a
    /// placeholder (spec.md section 4.2 step 4).
    pub fn repr(&self, v: &Value) -> String {
        self.ops
            .get(&v.type_id())
            .and_then(|ops| ops.to_string.as_ref())
            .map(|f| f(v))
            .unwrap_or_else(|| format!("<{}>", v.type_name()))
    }

    /// Type-registered equality; in the absence of a registered `equal`,
    /// values of that type are never considered equal (spec.md section 3:
    /// "Identity equality is never defined on values — only user-supplied
    /// per-type equality is used").
    pub fn equal(&self, a: &Value, b: &Value) -> bool {
        if a.type_id() != b.type_id() {
            return false;
        }
        self.ops
            .get(&a.type_id())
            .and_then(|ops| ops.equal.as_ref())
            .map(|f| f(a, b))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_roundtrip() {
        let v = Value::new(42i32);
        assert_eq!(v.downcast_ref::<i32>(), Some(&42));
        assert_eq!(v.downcast_ref::<u8>(), None);
    }

    #[test]
    fn repr_falls_back_without_registration() {
        let reg = TypeRegistry::new();
        let v = Value::new(42i32);
        assert_eq!(reg.repr(&v), "<i32>");
    }

    #[test]
    fn repr_uses_registered_printer() {
        let mut reg = TypeRegistry::new();
        reg.register(TypeId::of::<i32>(), TypeOps::new::<i32>().with_debug::<i32>());
        let v = Value::new(42i32);
        assert_eq!(reg.repr(&v), "42");
    }
}
