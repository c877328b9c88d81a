//! Opaque event payload.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Payload carried by an event outcome.
///
/// Cloning is cheap (reference counted). An empty value is the default.
#[derive(Clone, Default)]
pub struct Value(Option<Rc<dyn Any>>);

impl Value {
    /// Wrap any `'static` value.
    pub fn new<T: Any>(v: T) -> Self {
        Value(Some(Rc::new(v)))
    }

    /// The empty value.
    pub fn none() -> Self {
        Value(None)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the payload as `T` if it has that type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Clone the payload out as `T` if it has that type.
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Two values are the same if they share one allocation (or are both empty).
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => write!(f, "Value(none)"),
            Some(v) => {
                if let Some(x) = v.downcast_ref::<f64>() {
                    write!(f, "Value({})", x)
                } else if let Some(x) = v.downcast_ref::<i64>() {
                    write!(f, "Value({})", x)
                } else if let Some(x) = v.downcast_ref::<&'static str>() {
                    write!(f, "Value({:?})", x)
                } else if let Some(x) = v.downcast_ref::<String>() {
                    write!(f, "Value({:?})", x)
                } else {
                    write!(f, "Value(..)")
                }
            }
        }
    }
}
