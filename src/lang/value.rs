use std::rc::Rc;

use crate::runtime::object::Handle;

/// Signature of a host-provided function callable from scripts.
///
/// Natives receive their arguments as a slice and report failures as plain
/// messages; the VM wraps those into a `RuntimeError` with the call site line.
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

/// A host function registered into the global table before execution starts.
pub struct NativeFunction {
    pub name: Rc<str>,
    pub arity: u8,
    pub function: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

/// Runtime value in the Cinder language.
///
/// A tagged union: two values are equal only when they carry the same tag and
/// the same content (strings) or identity (heap references, natives). There is
/// no implicit coercion between tags.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absence value, written `nil`.
    Nil,

    /// Boolean value.
    Bool(bool),

    /// 64-bit floating-point number.
    Number(f64),

    /// UTF-8 string, compared by content. Interned by the heap so identical
    /// literals share storage.
    Str(Rc<str>),

    /// Host-registered native function.
    Native(Rc<NativeFunction>),

    /// Reference to a garbage-collected heap object.
    Obj(Handle),
}

impl Value {
    /// Only `nil` and `false` are falsey; every other value is truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Native(_) => "native function",
            Value::Obj(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    /// Format a value using Cinder surface syntax.
    ///
    /// Integral numbers render without a trailing `.0`. Heap references render
    /// as an opaque placeholder; the heap-aware formatter
    /// (`Heap::show`) resolves them to their real representation.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Native(n) => write!(f, "<native fn {}>", n.name),
            Value::Obj(h) => write!(f, "<obj {}>", h.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_number_renders_without_fraction() {
        assert_eq!(Value::Number(1.0).to_string(), "1");
        assert_eq!(Value::Number(55.0).to_string(), "55");
        assert_eq!(Value::Number(-3.0).to_string(), "-3");
    }

    #[test]
    fn test_fractional_number_keeps_fraction() {
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
    }

    #[test]
    fn test_literals_render_as_words() {
        assert_eq!(Value::Nil.to_string(), "nil");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Bool(false).to_string(), "false");
    }

    #[test]
    fn test_string_renders_raw_content() {
        assert_eq!(Value::Str(Rc::from("hi")).to_string(), "hi");
    }

    #[test]
    fn test_no_cross_tag_equality() {
        assert_ne!(Value::Number(1.0), Value::Str(Rc::from("1")));
        assert_ne!(Value::Bool(false), Value::Nil);
        assert_ne!(Value::Number(0.0), Value::Bool(false));
    }

    #[test]
    fn test_string_equality_is_by_content() {
        assert_eq!(Value::Str(Rc::from("ab")), Value::Str(Rc::from("ab")));
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
        assert!(!Value::Str(Rc::from("")).is_falsey());
    }
}
