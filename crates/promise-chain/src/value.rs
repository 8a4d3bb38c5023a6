//! Settlement payloads.
//!
//! A promise settles with an ordered, positional sequence of values. The
//! sequence may be empty and may mix kinds freely; reactions pick values
//! out by position using the typed accessors on [`Values`], which report
//! mismatches as [`ValueError`] so that a reaction can propagate them with
//! `?` and reject its chained promise.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("no value at position {index}")]
    Missing { index: usize },
    #[error("expected {expected} at position {index}, found {found}")]
    Mismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
}

/// A single positional value.
#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// Host data carried through a promise untouched.
    /// Two opaque values are equal only if they share the same allocation.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(Arc::new(value))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Opaque(_) => "opaque",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "Nil"),
            Self::Boolean(b) => write!(f, "Boolean({b})"),
            Self::Integer(i) => write!(f, "Integer({i})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Opaque(_) => write!(f, "<opaque>"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Nil
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i.into())
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Integer(i.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Nil, Into::into)
    }
}

/// Build a [`Values`] sequence from any number of positional values.
///
/// ```
/// use promise_chain::values;
/// let v = values![1, "two", 3.0];
/// assert_eq!(v.len(), 3);
/// ```
#[macro_export]
macro_rules! values {
    () => {
        $crate::Values::empty()
    };
    ($($v:expr),+ $(,)?) => {
        $crate::Values::from(vec![$($crate::Value::from($v)),+])
    };
}

/// The ordered value sequence a promise settles with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Values(Vec<Value>);

impl Values {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// The sole value produced when a fault is converted into a rejection.
    pub fn from_fault(err: &anyhow::Error) -> Self {
        Self(vec![Value::String(format!("{err:#}"))])
    }

    /// The sole value produced when a panic is converted into a rejection.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panicked with a non-string payload".to_string()
        };
        Self(vec![Value::String(message)])
    }

    pub fn value(&self, index: usize) -> Result<&Value, ValueError> {
        self.0.get(index).ok_or(ValueError::Missing { index })
    }

    pub fn integer(&self, index: usize) -> Result<i64, ValueError> {
        match self.value(index)? {
            Value::Integer(i) => Ok(*i),
            other => Err(mismatch(index, "integer", other)),
        }
    }

    /// Integers are widened, so arithmetic reactions accept either kind.
    pub fn number(&self, index: usize) -> Result<f64, ValueError> {
        match self.value(index)? {
            Value::Number(n) => Ok(*n),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(mismatch(index, "number", other)),
        }
    }

    pub fn boolean(&self, index: usize) -> Result<bool, ValueError> {
        match self.value(index)? {
            Value::Boolean(b) => Ok(*b),
            other => Err(mismatch(index, "boolean", other)),
        }
    }

    pub fn string(&self, index: usize) -> Result<&str, ValueError> {
        match self.value(index)? {
            Value::String(s) => Ok(s),
            other => Err(mismatch(index, "string", other)),
        }
    }

    pub fn opaque<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, ValueError> {
        match self.value(index)? {
            Value::Opaque(arc) => Arc::clone(arc)
                .downcast::<T>()
                .map_err(|_| ValueError::Mismatch {
                    index,
                    expected: std::any::type_name::<T>(),
                    found: "opaque",
                }),
            other => Err(mismatch(index, "opaque", other)),
        }
    }
}

fn mismatch(index: usize, expected: &'static str, found: &Value) -> ValueError {
    ValueError::Mismatch {
        index,
        expected,
        found: found.kind(),
    }
}

impl Deref for Values {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl IntoIterator for Values {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Value> for Values {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Values {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (idx, value) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

impl From<Vec<Value>> for Values {
    fn from(v: Vec<Value>) -> Self {
        Self(v)
    }
}

impl From<Value> for Values {
    fn from(v: Value) -> Self {
        Self(vec![v])
    }
}

impl From<()> for Values {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

macro_rules! single {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Values {
                fn from(v: $t) -> Self {
                    Self(vec![Value::from(v)])
                }
            }
        )*
    };
}

single!(bool, i64, i32, u32, f64, String, &str);

macro_rules! tuple {
    ($($name:ident),+) => {
        impl<$($name: Into<Value>),+> From<($($name,)+)> for Values {
            #[allow(non_snake_case)]
            fn from(($($name,)+): ($($name,)+)) -> Self {
                Self(vec![$($name.into()),+])
            }
        }
    };
}

tuple!(A);
tuple!(A, B);
tuple!(A, B, C);
tuple!(A, B, C, D);
