// Strand Value Types
// Tagged runtime values and the refcount contract of heap objects

use std::fmt;
use std::rc::Rc;

use crate::error::{Fault, FaultResult};

/// Refcount of a heap object.
///
/// Three states: live (> 0), zero (transient, while the payload is cleared)
/// and released (-1, the object sits in its pool). Any other transition
/// is a lifecycle bug and aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refs(i32);

impl Refs {
    pub const RELEASED: i32 = -1;

    pub fn released() -> Self {
        Refs(Self::RELEASED)
    }

    pub fn count(&self) -> i32 {
        self.0
    }

    pub fn is_released(&self) -> bool {
        self.0 == Self::RELEASED
    }

    /// Bring a pooled object back to life with a count of 1
    pub fn revive(&mut self) {
        if self.0 != Self::RELEASED {
            panic!("Expected to be released, refs {}", self.0);
        }
        self.0 = 1;
    }

    pub fn retain(&mut self) {
        if self.0 == Self::RELEASED {
            panic!("Invalid retain of a released object");
        }
        self.0 += 1;
    }

    /// Returns true when the count dropped to zero
    pub fn release(&mut self) -> bool {
        if self.0 == Self::RELEASED {
            panic!("Invalid release of a released object");
        }
        if self.0 == 0 {
            panic!("Double free (refs 0)");
        }
        self.0 -= 1;
        self.0 == 0
    }

    /// Re-arm the released sentinel once the payload is cleared
    pub fn rearm(&mut self) {
        if self.0 != 0 {
            panic!("Freeing invalid object, refs {}", self.0);
        }
        self.0 = Self::RELEASED;
    }
}

impl Default for Refs {
    fn default() -> Self {
        Self::released()
    }
}

/// Address of a refcounted object inside the VM heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    Closure(u32),
    List(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueKind {
    #[default]
    Nil,
    Bool,
    Num,
    Str,
    Closure,
    List,
}

impl ValueKind {
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Bool => "bool",
            ValueKind::Num => "number",
            ValueKind::Str => "string",
            ValueKind::Closure => "func",
            ValueKind::List => "list",
        }
    }
}

/// A stack slot.
///
/// `refc` is set iff the slot owns a live heap reference. Copying a value
/// does not retain it, owners go through `Heap::retain`/`Heap::release`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Value {
    pub kind: ValueKind,
    pub num: f64,
    pub obj: Option<Rc<str>>,
    pub refc: Option<Handle>,
}

impl Value {
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn num(num: f64) -> Self {
        Self {
            kind: ValueKind::Num,
            num,
            ..Self::default()
        }
    }

    pub fn bool(b: bool) -> Self {
        Self {
            kind: ValueKind::Bool,
            num: if b { 1.0 } else { 0.0 },
            ..Self::default()
        }
    }

    pub fn str(s: &str) -> Self {
        Self {
            kind: ValueKind::Str,
            obj: Some(Rc::from(s)),
            ..Self::default()
        }
    }

    pub(crate) fn from_handle(handle: Handle) -> Self {
        let kind = match handle {
            Handle::Closure(_) => ValueKind::Closure,
            Handle::List(_) => ValueKind::List,
        };
        Self {
            kind,
            refc: Some(handle),
            ..Self::default()
        }
    }

    pub fn is_nil(&self) -> bool {
        self.kind == ValueKind::Nil
    }

    pub fn handle(&self) -> Option<Handle> {
        self.refc
    }

    pub fn as_num(&self) -> FaultResult<f64> {
        match self.kind {
            ValueKind::Num | ValueKind::Bool => Ok(self.num),
            _ => Err(self.mismatch("number")),
        }
    }

    pub fn as_bool(&self) -> FaultResult<bool> {
        match self.kind {
            ValueKind::Bool | ValueKind::Num => Ok(self.num != 0.0),
            _ => Err(self.mismatch("bool")),
        }
    }

    pub fn as_str(&self) -> FaultResult<&str> {
        match (&self.kind, &self.obj) {
            (ValueKind::Str, Some(s)) => Ok(&**s),
            _ => Err(self.mismatch("string")),
        }
    }

    pub fn as_closure(&self) -> FaultResult<u32> {
        match self.refc {
            Some(Handle::Closure(id)) => Ok(id),
            _ => Err(self.mismatch("func")),
        }
    }

    /// Forget both the handle and the payload, no refcount is touched
    pub fn clear(&mut self) {
        *self = Value::default();
    }

    fn mismatch(&self, expected: &'static str) -> Fault {
        Fault::TypeMismatch {
            expected,
            found: self.kind.name().to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValueKind::Nil => write!(f, "null"),
            ValueKind::Bool => write!(f, "{}", self.num != 0.0),
            ValueKind::Num => write!(f, "{}", self.num),
            ValueKind::Str => write!(f, "{}", self.obj.as_deref().unwrap_or("")),
            ValueKind::Closure => match self.refc {
                Some(Handle::Closure(id)) => write!(f, "<func #{}>", id),
                _ => write!(f, "<func>"),
            },
            ValueKind::List => match self.refc {
                Some(Handle::List(id)) => write!(f, "<list #{}>", id),
                _ => write!(f, "<list>"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refs_retain_release() {
        let mut refs = Refs::released();
        refs.revive();
        refs.retain();
        assert_eq!(refs.count(), 2);
        assert!(!refs.release());
        assert_eq!(refs.count(), 1);
        assert!(refs.release());
        refs.rearm();
        assert!(refs.is_released());
    }

    #[test]
    #[should_panic(expected = "released object")]
    fn test_refs_retain_released_panics() {
        let mut refs = Refs::released();
        refs.retain();
    }

    #[test]
    #[should_panic(expected = "Double free")]
    fn test_refs_release_zero_panics() {
        let mut refs = Refs::released();
        refs.revive();
        assert!(refs.release());
        refs.release();
    }

    #[test]
    fn test_value_clear_drops_handle_and_obj() {
        let mut v = Value::from_handle(Handle::Closure(3));
        v.obj = Some(Rc::from("stale"));
        v.clear();
        assert!(v.refc.is_none());
        assert!(v.obj.is_none());
        assert!(v.is_nil());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::num(2.5).as_num().unwrap(), 2.5);
        assert!(Value::bool(true).as_bool().unwrap());
        assert_eq!(Value::str("hi").as_str().unwrap(), "hi");
        assert!(matches!(
            Value::str("hi").as_num(),
            Err(Fault::TypeMismatch { expected: "number", .. })
        ));
    }
}
