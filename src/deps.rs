//! Dependency lists and the comparator that decides whether an effect re-runs.
//!
//! Entries are compared shallowly: primitives by value, compound values by
//! pointer identity. Nothing is ever compared structurally, so two distinct
//! `Arc`s holding equal data count as a change.
//!
//! Floats follow "same value" semantics: `NaN` equals `NaN` and `0.0` differs
//! from `-0.0`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// One entry of a dependency list.
#[derive(Clone)]
pub enum Dep {
    /// The unit value.
    Unit,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// An unsigned integer.
    UInt(u64),
    /// A float, compared with same-value semantics.
    Float(f64),
    /// A character.
    Char(char),
    /// A string, compared by content.
    Str(Arc<str>),
    /// A shared compound value, compared by pointer identity.
    Ref(Arc<dyn Any + Send + Sync>),
}

impl Dep {
    /// Depend on the identity of a shared value.
    ///
    /// The entry stays equal across renders only while the very same allocation
    /// is passed in again.
    pub fn by_ref<T: Any + Send + Sync>(value: &Arc<T>) -> Self {
        Dep::Ref(value.clone() as Arc<dyn Any + Send + Sync>)
    }

    /// Shallow comparison used by the scheduler.
    pub fn same(&self, other: &Dep) -> bool {
        match (self, other) {
            (Dep::Unit, Dep::Unit) => true,
            (Dep::Bool(a), Dep::Bool(b)) => a == b,
            (Dep::Int(a), Dep::Int(b)) => a == b,
            (Dep::UInt(a), Dep::UInt(b)) => a == b,
            (Dep::Float(a), Dep::Float(b)) => same_float(*a, *b),
            (Dep::Char(a), Dep::Char(b)) => a == b,
            (Dep::Str(a), Dep::Str(b)) => a == b,
            (Dep::Ref(a), Dep::Ref(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

fn same_float(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a.to_bits() == b.to_bits()
}

impl fmt::Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dep::Unit => f.write_str("()"),
            Dep::Bool(v) => write!(f, "{v:?}"),
            Dep::Int(v) => write!(f, "{v:?}"),
            Dep::UInt(v) => write!(f, "{v:?}u"),
            Dep::Float(v) => write!(f, "{v:?}"),
            Dep::Char(v) => write!(f, "{v:?}"),
            Dep::Str(v) => write!(f, "{v:?}"),
            Dep::Ref(v) => write!(f, "Ref({:p})", Arc::as_ptr(v)),
        }
    }
}

macro_rules! dep_from {
    ($variant:ident: $($ty:ty),*) => {
        $(
            impl From<$ty> for Dep {
                fn from(value: $ty) -> Self {
                    Dep::$variant(value.into())
                }
            }
        )*
    };
}

dep_from!(Bool: bool);
dep_from!(Int: i8, i16, i32, i64);
dep_from!(UInt: u8, u16, u32, u64);
dep_from!(Float: f32, f64);
dep_from!(Char: char);
dep_from!(Str: &str, String, Arc<str>);

impl From<()> for Dep {
    fn from((): ()) -> Self {
        Dep::Unit
    }
}

impl From<usize> for Dep {
    fn from(value: usize) -> Self {
        Dep::UInt(value as u64)
    }
}

impl From<isize> for Dep {
    fn from(value: isize) -> Self {
        Dep::Int(value as i64)
    }
}

/// The dependency declaration of one effect registration.
#[derive(Clone, Debug)]
pub enum Deps {
    /// No dependency list: the effect runs after every render.
    Always,
    /// Explicit list. An empty list runs the effect once.
    List(Vec<Dep>),
}

impl Deps {
    /// Explicit empty list: run on the first render only.
    pub fn once() -> Self {
        Deps::List(Vec::new())
    }

    /// Number of entries, or `None` for [`Deps::Always`].
    pub fn len(&self) -> Option<usize> {
        match self {
            Deps::Always => None,
            Deps::List(list) => Some(list.len()),
        }
    }

    /// Whether this is an explicit empty list.
    pub fn is_empty(&self) -> bool {
        matches!(self, Deps::List(list) if list.is_empty())
    }
}

impl From<Vec<Dep>> for Deps {
    fn from(list: Vec<Dep>) -> Self {
        Deps::List(list)
    }
}

/// Build a [`Deps::List`] from values convertible into [`Dep`].
///
/// ```
/// use hookflow::{deps, Deps};
///
/// let id = 7;
/// let list = deps![id, "user", 1.5];
/// assert_eq!(list.len(), Some(3));
/// assert!(deps![].is_empty());
/// ```
#[macro_export]
macro_rules! deps {
    () => {
        $crate::Deps::List(::std::vec::Vec::new())
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Deps::List(::std::vec![$($crate::Dep::from($value)),+])
    };
}

/// Decide whether an effect must run, given the dependencies committed by the
/// previous render (`None` on first registration).
pub fn deps_changed(previous: Option<&Deps>, next: &Deps) -> bool {
    let Deps::List(next) = next else {
        return true;
    };
    let Some(Deps::List(previous)) = previous else {
        return true;
    };
    if previous.len() != next.len() {
        cov_mark::hit!(deps_length_changed);
        tracing::warn!(
            previous = previous.len(),
            next = next.len(),
            "dependency list changed length between renders; treating as changed"
        );
        return true;
    }
    previous.iter().zip(next).any(|(a, b)| !a.same(b))
}
