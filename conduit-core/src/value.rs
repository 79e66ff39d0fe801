//! Type identities and bound argument values
//!
//! Resource methods are registered with explicit binding directives instead of
//! being introspected at runtime, so the values flowing from the binding
//! pipeline to a handler are carried as type-erased [`Arg`] slots. Handlers
//! recover their concrete types with [`Arguments::take`].

use std::any::{Any, TypeId};
use std::fmt;

/// Identity of a declared type: its `TypeId` plus its fully qualified name.
///
/// The name is what context-provider keys are built from, so two keys
/// compare equal exactly when they name the same type.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Type key of `T`
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name, e.g. `alloc::string::String`
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name, for log lines
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }

    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl std::hash::Hash for TypeKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for TypeKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(other.name).then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A single bound argument.
///
/// `Arg::absent()` is the null value: a cookie parameter on a request without
/// a `Cookie` header, or a context nobody provides.
pub struct Arg {
    value: Option<Box<dyn Any + Send>>,
    type_name: &'static str,
}

impl Arg {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Some(Box::new(value)),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn absent() -> Self {
        Self {
            value: None,
            type_name: "<absent>",
        }
    }

    pub fn is_absent(&self) -> bool {
        self.value.is_none()
    }

    /// Name of the type stored in this slot
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.as_ref().is_some_and(|v| v.is::<T>())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Whether the slot holds a value of exactly the keyed type
    pub fn holds(&self, key: &TypeKey) -> bool {
        self.value
            .as_ref()
            .is_some_and(|v| (**v).type_id() == key.id())
    }

    /// Take the value out as `T`.
    ///
    /// Returns `Ok(None)` for an absent slot and gives the slot back unchanged
    /// when it holds a different type.
    pub fn take<T: Any>(self) -> Result<Option<T>, Arg> {
        match self.value {
            None => Ok(None),
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Ok(Some(*value)),
                Err(boxed) => Err(Arg {
                    value: Some(boxed),
                    type_name: self.type_name,
                }),
            },
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(_) => write!(f, "Arg({})", self.type_name),
            None => f.write_str("Arg(<absent>)"),
        }
    }
}

/// Error returned when an argument slot cannot be taken as the requested type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("argument {index} is out of range ({len} arguments bound)")]
    OutOfRange { index: usize, len: usize },

    #[error("argument {index} was already taken")]
    AlreadyTaken { index: usize },

    #[error("argument {index} holds {actual}, not {expected}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        actual: &'static str,
    },
}

/// The ordered argument list handed to a resource method
#[derive(Debug, Default)]
pub struct Arguments {
    slots: Vec<Option<Arg>>,
}

impl Arguments {
    pub fn new(args: Vec<Arg>) -> Self {
        Self {
            slots: args.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Borrow the value at `index` as `T`, `None` when absent or of another type
    pub fn get_as<T: Any>(&self, index: usize) -> Option<&T> {
        self.get(index).and_then(Arg::downcast_ref::<T>)
    }

    /// Move the value at `index` out as `T`.
    ///
    /// An absent slot yields `Ok(None)`.
    pub fn take<T: Any>(&mut self, index: usize) -> Result<Option<T>, ArgumentError> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(ArgumentError::OutOfRange { index, len })?;
        let arg = slot.take().ok_or(ArgumentError::AlreadyTaken { index })?;
        match arg.take::<T>() {
            Ok(value) => Ok(value),
            Err(arg) => {
                let actual = arg.type_name();
                *slot = Some(arg);
                Err(ArgumentError::TypeMismatch {
                    index,
                    expected: std::any::type_name::<T>(),
                    actual,
                })
            }
        }
    }

    /// Replace the value at `index`, returning the previous one
    pub fn replace(&mut self, index: usize, arg: Arg) -> Option<Arg> {
        self.slots.get_mut(index).and_then(|slot| slot.replace(arg))
    }
}
