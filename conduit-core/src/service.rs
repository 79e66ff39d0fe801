// Microservice trait and lifecycle hooks

use crate::error::HookError;
use crate::value::TypeKey;
use std::any::Any;

pub type LifecycleResult = Result<(), HookError>;

/// A deployable handler instance.
///
/// Each lifecycle phase has exactly one hook, so a service can never expose
/// two competing post-construct or pre-destroy methods.
///
/// ```
/// use conduit_core::service::{LifecycleResult, Microservice};
///
/// struct Greeter;
///
/// impl Microservice for Greeter {
///     fn base_path(&self) -> Option<&str> {
///         Some("/greet")
///     }
///
///     fn post_construct(&self) -> LifecycleResult {
///         Ok(())
///     }
/// }
/// ```
pub trait Microservice: Any + Send + Sync {
    /// Route prefix declared by the service itself
    fn base_path(&self) -> Option<&str> {
        None
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Request filters this service applies itself
    fn request_filters(&self) -> Vec<TypeKey> {
        Vec::new()
    }

    /// Response filters this service applies itself
    fn response_filters(&self) -> Vec<TypeKey> {
        Vec::new()
    }

    /// Runs once, when the service is deployed
    fn post_construct(&self) -> LifecycleResult {
        Ok(())
    }

    /// Runs once, before the service is removed
    fn pre_destroy(&self) -> LifecycleResult {
        Ok(())
    }
}

impl dyn Microservice {
    pub fn is<T: Microservice>(&self) -> bool {
        (self as &dyn Any).is::<T>()
    }

    pub fn downcast_ref<T: Microservice>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}
