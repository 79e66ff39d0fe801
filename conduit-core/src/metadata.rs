// Derived metadata over the registered services

use crate::service::Microservice;
use crate::value::TypeKey;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Which base paths are taken and which filters the services apply
/// themselves.
///
/// Rebuilt from scratch whenever the service set changes, so it only ever
/// describes the services currently registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MicroserviceMetadata {
    base_paths: BTreeSet<String>,
    request_filters: BTreeSet<TypeKey>,
    response_filters: BTreeSet<TypeKey>,
}

impl MicroserviceMetadata {
    pub fn scan<'a, I>(services: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Arc<dyn Microservice>)>,
    {
        let mut metadata = Self::default();
        for (path, service) in services {
            metadata.base_paths.insert(path.clone());
            metadata.request_filters.extend(service.request_filters());
            metadata.response_filters.extend(service.response_filters());
        }
        metadata
    }

    pub fn base_paths(&self) -> impl Iterator<Item = &str> {
        self.base_paths.iter().map(String::as_str)
    }

    /// Whether some service applies this request filter itself
    pub fn applies_request_filter(&self, key: &TypeKey) -> bool {
        self.request_filters.contains(key)
    }

    pub fn applies_response_filter(&self, key: &TypeKey) -> bool {
        self.response_filters.contains(key)
    }

    pub fn service_request_filters(&self) -> impl Iterator<Item = &TypeKey> {
        self.request_filters.iter()
    }

    pub fn service_response_filters(&self) -> impl Iterator<Item = &TypeKey> {
        self.response_filters.iter()
    }
}
