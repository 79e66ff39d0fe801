//! Custom context injection
//!
//! A [`ContextProvider`] builds a request-scoped value for a declared type
//! (optionally narrowed by a qualifier). Providers are looked up by
//! [`ContextKey`]; a miss resolves to [`ProviderLookup::Fallback`], which
//! logs and yields an absent value instead of failing the request.

use crate::http::{Request, Responder};
use crate::service::Microservice;
use crate::value::{Arg, TypeKey};
use parking_lot::RwLock;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Separates the declared type from the qualifier in a context key
pub const CONTEXT_SEPARATOR: char = '@';

/// `declared_type@qualifier`; the qualifier defaults to the type name
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(String);

impl ContextKey {
    pub fn new(declared: TypeKey, qualifier: Option<&str>) -> Self {
        let qualifier = qualifier.unwrap_or(declared.name());
        Self(format!("{}{}{}", declared.name(), CONTEXT_SEPARATOR, qualifier))
    }

    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::new(TypeKey::of::<T>(), None)
    }

    pub fn qualified<T: ?Sized + 'static>(qualifier: &str) -> Self {
        Self::new(TypeKey::of::<T>(), Some(qualifier))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn declared_type(&self) -> &str {
        self.0
            .split_once(CONTEXT_SEPARATOR)
            .map_or(self.0.as_str(), |(declared, _)| declared)
    }
}

impl fmt::Debug for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({})", self.0)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a provider sees of the call it builds a context for
#[derive(Clone, Copy)]
pub struct HttpMethodContext<'a> {
    /// Resource method, e.g. `UserService::get`
    pub method: &'a str,
    pub handler: &'a dyn Microservice,
    pub request: &'a Request,
    pub responder: &'a Responder,
}

impl fmt::Debug for HttpMethodContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMethodContext")
            .field("method", &self.method)
            .field("handler", &self.handler.name())
            .field("request", &self.request.request_line())
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ContextError(String);

impl ContextError {
    pub fn new(reason: impl fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// Keyed factory for a custom context value
pub trait ContextProvider: Send + Sync {
    fn context_key(&self) -> ContextKey;

    /// Build the value; an absent [`Arg`] is a valid result
    fn create_context(&self, context: &HttpMethodContext<'_>) -> Result<Arg, ContextError>;

    /// Called when the provider is removed from a registry
    fn on_remove(&self) {}
}

/// Provider backed by a closure
pub struct FnContextProvider<T, F> {
    key: ContextKey,
    factory: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> FnContextProvider<T, F>
where
    T: Send + 'static,
    F: Fn(&HttpMethodContext<'_>) -> Result<Option<T>, ContextError> + Send + Sync,
{
    /// Provider for `T` under the default qualifier
    pub fn new(factory: F) -> Self {
        Self {
            key: ContextKey::of::<T>(),
            factory,
            _marker: PhantomData,
        }
    }

    pub fn qualified(mut self, qualifier: &str) -> Self {
        self.key = ContextKey::qualified::<T>(qualifier);
        self
    }
}

impl<T, F> ContextProvider for FnContextProvider<T, F>
where
    T: Send + 'static,
    F: Fn(&HttpMethodContext<'_>) -> Result<Option<T>, ContextError> + Send + Sync,
{
    fn context_key(&self) -> ContextKey {
        self.key.clone()
    }

    fn create_context(&self, context: &HttpMethodContext<'_>) -> Result<Arg, ContextError> {
        Ok(match (self.factory)(context)? {
            Some(value) => Arg::new(value),
            None => Arg::absent(),
        })
    }
}

/// Null-object provider for keys nobody registered
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyContextProvider;

impl EmptyContextProvider {
    pub fn provide(&self, key: &ContextKey, context: &HttpMethodContext<'_>) -> Arg {
        warn!(
            key = %key,
            method = context.method,
            "Context for the given value type not found"
        );
        Arg::absent()
    }
}

/// Result of looking up a provider
#[derive(Clone)]
pub enum ProviderLookup {
    Found(Arc<dyn ContextProvider>),
    Fallback,
}

impl ProviderLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, ProviderLookup::Found(_))
    }

    /// Run the provider, or the null-object fallback on a miss
    pub fn provide(
        &self,
        key: &ContextKey,
        context: &HttpMethodContext<'_>,
    ) -> Result<Arg, ContextError> {
        match self {
            ProviderLookup::Found(provider) => provider.create_context(context),
            ProviderLookup::Fallback => Ok(EmptyContextProvider.provide(key, context)),
        }
    }
}

impl fmt::Debug for ProviderLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderLookup::Found(provider) => write!(f, "Found({})", provider.context_key()),
            ProviderLookup::Fallback => f.write_str("Fallback"),
        }
    }
}

/// A service field filled by context injection.
///
/// Service instances are shared by every request to them, so the field holds
/// whatever the most recent request injected.
pub struct ContextField<T> {
    value: RwLock<Option<Arc<T>>>,
}

impl<T> Default for ContextField<T> {
    fn default() -> Self {
        Self {
            value: RwLock::new(None),
        }
    }
}

impl<T> ContextField<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.value.read().clone()
    }

    pub fn set(&self, value: Option<T>) {
        *self.value.write() = value.map(Arc::new);
    }

    pub fn is_set(&self) -> bool {
        self.value.read().is_some()
    }
}

impl<T: fmt::Debug> fmt::Debug for ContextField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextField").field(&*self.value.read()).finish()
    }
}
