//! Microservices registry
//!
//! Owns the deployed services, context providers, filters, interceptors,
//! exception mappers and media converters.
//!
//! Every mutation builds a new immutable [`RegistryState`] and publishes it
//! with a single atomic swap, so request threads reading a snapshot never see
//! a half-applied change. Writers are serialised by a mutex; readers take no
//! lock at all.

use crate::config::DispatchConfig;
use crate::context::{ContextKey, ContextProvider, ProviderLookup};
use crate::error::{LifecyclePhase, RegistryError};
use crate::exception::{DispatchErrorMapper, ExceptionMapper, Failure, FailureKind, MapperTable};
use crate::filter::{RequestFilter, ResponseFilter};
use crate::interceptor::Interceptor;
use crate::media::{ConverterRegistry, MediaTypeConverter};
use crate::metadata::MicroserviceMetadata;
use crate::service::Microservice;
use crate::value::TypeKey;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// One published version of the registry
#[derive(Clone)]
pub struct RegistryState {
    version: u64,
    services: BTreeMap<String, Arc<dyn Microservice>>,
    metadata: MicroserviceMetadata,
    context_providers: HashMap<ContextKey, Arc<dyn ContextProvider>>,
    request_filters: Vec<(TypeKey, Arc<dyn RequestFilter>)>,
    response_filters: Vec<(TypeKey, Arc<dyn ResponseFilter>)>,
    global_request_filters: Vec<(TypeKey, Arc<dyn RequestFilter>)>,
    global_response_filters: Vec<(TypeKey, Arc<dyn ResponseFilter>)>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    exception_mappers: MapperTable,
    converters: ConverterRegistry,
}

impl RegistryState {
    fn initial() -> Self {
        let mut exception_mappers = MapperTable::new();
        exception_mappers.insert(Arc::new(DispatchErrorMapper));
        Self {
            version: 0,
            services: BTreeMap::new(),
            metadata: MicroserviceMetadata::default(),
            context_providers: HashMap::new(),
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            global_request_filters: Vec::new(),
            global_response_filters: Vec::new(),
            interceptors: Vec::new(),
            exception_mappers,
            converters: ConverterRegistry::with_defaults(),
        }
    }

    /// Rebuild the service metadata and the global filter sets
    fn recompute(&mut self) {
        self.metadata = MicroserviceMetadata::scan(&self.services);
        self.global_request_filters = self
            .request_filters
            .iter()
            .filter(|(key, _)| !self.metadata.applies_request_filter(key))
            .cloned()
            .collect();
        self.global_response_filters = self
            .response_filters
            .iter()
            .filter(|(key, _)| !self.metadata.applies_response_filter(key))
            .cloned()
            .collect();
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &MicroserviceMetadata {
        &self.metadata
    }

    pub fn service_with_base_path(&self, base_path: &str) -> Option<Arc<dyn Microservice>> {
        self.services.get(base_path).cloned()
    }

    /// `(base path, service)` pairs ordered by path
    pub fn services(&self) -> impl Iterator<Item = (&str, &Arc<dyn Microservice>)> {
        self.services.iter().map(|(path, service)| (path.as_str(), service))
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn context_provider(&self, key: &ContextKey) -> ProviderLookup {
        match self.context_providers.get(key) {
            Some(provider) => ProviderLookup::Found(Arc::clone(provider)),
            None => ProviderLookup::Fallback,
        }
    }

    pub fn request_filter(&self, key: &TypeKey) -> Option<&Arc<dyn RequestFilter>> {
        self.request_filters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, filter)| filter)
    }

    pub fn response_filter(&self, key: &TypeKey) -> Option<&Arc<dyn ResponseFilter>> {
        self.response_filters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, filter)| filter)
    }

    /// Registered request filters no service applies itself, in registration order
    pub fn global_request_filters(&self) -> &[(TypeKey, Arc<dyn RequestFilter>)] {
        &self.global_request_filters
    }

    pub fn global_response_filters(&self) -> &[(TypeKey, Arc<dyn ResponseFilter>)] {
        &self.global_response_filters
    }

    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    /// Most specific mapper for the failure's kind
    pub fn exception_mapper(&self, failure: &dyn Failure) -> Option<Arc<dyn ExceptionMapper>> {
        self.exception_mappers.find(failure)
    }

    pub fn exception_mappers(&self) -> &MapperTable {
        &self.exception_mappers
    }

    pub fn media_converter(&self, content_type: Option<&str>) -> Arc<dyn MediaTypeConverter> {
        self.converters.select(content_type)
    }
}

impl fmt::Debug for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryState")
            .field("version", &self.version)
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("metadata", &self.metadata)
            .field("context_providers", &self.context_providers.keys().collect::<Vec<_>>())
            .field("request_filters", &self.request_filters.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("response_filters", &self.response_filters.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("interceptors", &self.interceptors.len())
            .field("exception_mappers", &self.exception_mappers)
            .field("converters", &self.converters)
            .finish()
    }
}

fn service_id(service: &Arc<dyn Microservice>) -> usize {
    Arc::as_ptr(service) as *const () as usize
}

fn same_service(a: &Arc<dyn Microservice>, b: &Arc<dyn Microservice>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub struct MicroservicesRegistry {
    state: ArcSwap<RegistryState>,
    writer: Mutex<()>,
    /// Services whose post-construct hook has run, by instance address. The
    /// weak handle keeps the allocation alive, so an address cannot be handed
    /// to another service while its entry exists.
    initialized: Mutex<HashMap<usize, Weak<dyn Microservice>>>,
    config: DispatchConfig,
}

impl Default for MicroservicesRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MicroservicesRegistry {
    /// Empty registry with the default configuration and the built-in
    /// binding-failure mapper
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            state: ArcSwap::from_pointee(RegistryState::initial()),
            writer: Mutex::new(()),
            initialized: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RegistryState> {
        self.state.load_full()
    }

    pub fn version(&self) -> u64 {
        self.state.load().version
    }

    fn update<R>(&self, change: impl FnOnce(&mut RegistryState) -> R) -> R {
        let _writer = self.writer.lock();
        let mut next = RegistryState::clone(&self.state.load());
        let result = change(&mut next);
        next.recompute();
        next.version += 1;
        self.state.store(Arc::new(next));
        result
    }

    // --- services ---

    /// Register a service under `base_path`, replacing whatever was there
    pub fn add_service(&self, base_path: &str, service: Arc<dyn Microservice>) {
        let name = service.name().to_string();
        let replaced = self.update(|state| state.services.insert(base_path.to_string(), service));
        if let Some(old) = replaced {
            self.forget_unregistered(&old);
            info!(base_path, service = %name, "Replaced microservice");
        } else {
            info!(base_path, service = %name, "Added microservice");
        }
    }

    /// Register services under the base paths they declare.
    ///
    /// Nothing is registered when any of them declares no base path.
    pub fn add_services<I>(&self, services: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = Arc<dyn Microservice>>,
    {
        let mut entries = Vec::new();
        for service in services {
            let base_path = service
                .base_path()
                .ok_or_else(|| RegistryError::MissingBasePath {
                    service: service.name().to_string(),
                })?
                .to_string();
            entries.push((base_path, service));
        }
        for (base_path, service) in &entries {
            info!(base_path = %base_path, service = service.name(), "Added microservice");
        }
        let replaced: Vec<_> = self.update(|state| {
            entries
                .into_iter()
                .filter_map(|(base_path, service)| state.services.insert(base_path, service))
                .collect()
        });
        for old in &replaced {
            self.forget_unregistered(old);
        }
        Ok(())
    }

    /// Remove every registration of this instance; `true` if any existed
    pub fn remove_service(&self, service: &Arc<dyn Microservice>) -> bool {
        let removed = self.update(|state| {
            let before = state.services.len();
            state.services.retain(|_, registered| !same_service(registered, service));
            before - state.services.len()
        });
        if removed > 0 {
            self.forget(service);
            info!(service = service.name(), "Removed microservice");
        }
        removed > 0
    }

    pub fn service_with_base_path(&self, base_path: &str) -> Option<Arc<dyn Microservice>> {
        self.state.load().service_with_base_path(base_path)
    }

    pub fn http_services(&self) -> Vec<Arc<dyn Microservice>> {
        self.state.load().services.values().cloned().collect()
    }

    pub fn service_count(&self) -> usize {
        self.state.load().service_count()
    }

    pub fn metadata(&self) -> MicroserviceMetadata {
        self.state.load().metadata.clone()
    }

    // --- lifecycle ---

    /// Run the post-construct hook of every registered service that has not
    /// run it yet
    pub fn init_services(&self) -> Result<(), RegistryError> {
        for service in self.http_services() {
            self.init_service(&service)?;
        }
        Ok(())
    }

    /// Run the post-construct hook unless it already ran for this instance
    pub fn init_service(&self, service: &Arc<dyn Microservice>) -> Result<(), RegistryError> {
        let id = service_id(service);
        {
            let mut initialized = self.initialized.lock();
            initialized.retain(|_, instance| instance.strong_count() > 0);
            if initialized.contains_key(&id) {
                return Ok(());
            }
            initialized.insert(id, Arc::downgrade(service));
        }
        if let Err(source) = service.post_construct() {
            self.initialized.lock().remove(&id);
            return Err(RegistryError::Lifecycle {
                service: service.name().to_string(),
                phase: LifecyclePhase::PostConstruct,
                source,
            });
        }
        debug!(service = service.name(), "Post-construct hook completed");
        Ok(())
    }

    pub fn pre_destroy_services(&self) -> Result<(), RegistryError> {
        let mut first_error = None;
        for service in self.http_services() {
            if let Err(e) = self.pre_destroy_service(&service) {
                warn!(error = %e, "Pre-destroy hook failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn pre_destroy_service(&self, service: &Arc<dyn Microservice>) -> Result<(), RegistryError> {
        self.forget(service);
        service
            .pre_destroy()
            .map_err(|source| RegistryError::Lifecycle {
                service: service.name().to_string(),
                phase: LifecyclePhase::PreDestroy,
                source,
            })?;
        debug!(service = service.name(), "Pre-destroy hook completed");
        Ok(())
    }

    /// Run the post-construct hook, then register. A failing hook leaves the
    /// registry untouched.
    pub fn deploy_service(
        &self,
        base_path: &str,
        service: Arc<dyn Microservice>,
    ) -> Result<(), RegistryError> {
        self.init_service(&service)?;
        self.add_service(base_path, service);
        Ok(())
    }

    /// Run the pre-destroy hook, then remove. The service is removed even
    /// when the hook fails; the failure is still returned.
    pub fn undeploy_service(&self, service: &Arc<dyn Microservice>) -> Result<(), RegistryError> {
        let hook = self.pre_destroy_service(service);
        self.remove_service(service);
        hook
    }

    fn forget(&self, service: &Arc<dyn Microservice>) {
        self.initialized.lock().remove(&service_id(service));
    }

    /// Drop the lifecycle entry of a replaced instance unless it is still
    /// registered under another base path
    fn forget_unregistered(&self, service: &Arc<dyn Microservice>) {
        let state = self.state.load();
        if !state.services.values().any(|registered| same_service(registered, service)) {
            self.forget(service);
        }
    }

    // --- context providers ---

    /// Register a provider under its key. The first registration for a key
    /// wins; returns `false` when the key was already taken.
    pub fn register_context_provider(&self, provider: Arc<dyn ContextProvider>) -> bool {
        let key = provider.context_key();
        let added = self.update(|state| {
            if state.context_providers.contains_key(&key) {
                false
            } else {
                state.context_providers.insert(key.clone(), provider);
                true
            }
        });
        if added {
            debug!(key = %key, "Registered context provider");
        } else {
            debug!(key = %key, "Context provider already registered, ignoring");
        }
        added
    }

    pub fn remove_context_provider(&self, key: &ContextKey) -> Option<Arc<dyn ContextProvider>> {
        let removed = self.update(|state| state.context_providers.remove(key));
        if let Some(provider) = &removed {
            provider.on_remove();
            debug!(key = %key, "Removed context provider");
        }
        removed
    }

    pub fn context_provider(&self, key: &ContextKey) -> ProviderLookup {
        self.state.load().context_provider(key)
    }

    // --- filters ---

    /// Register a request filter under `key`; `false` if the key is taken
    pub fn register_request_filter(&self, key: TypeKey, filter: Arc<dyn RequestFilter>) -> bool {
        let added = self.update(|state| {
            if state.request_filters.iter().any(|(k, _)| *k == key) {
                return false;
            }
            state.request_filters.push((key, filter));
            true
        });
        debug!(filter = key.name(), added, "Registered request filter");
        added
    }

    pub fn remove_request_filter(&self, key: &TypeKey) -> bool {
        self.update(|state| {
            let before = state.request_filters.len();
            state.request_filters.retain(|(k, _)| k != key);
            before != state.request_filters.len()
        })
    }

    /// Register a response filter under `key`; `false` if the key is taken
    pub fn register_response_filter(&self, key: TypeKey, filter: Arc<dyn ResponseFilter>) -> bool {
        let added = self.update(|state| {
            if state.response_filters.iter().any(|(k, _)| *k == key) {
                return false;
            }
            state.response_filters.push((key, filter));
            true
        });
        debug!(filter = key.name(), added, "Registered response filter");
        added
    }

    pub fn remove_response_filter(&self, key: &TypeKey) -> bool {
        self.update(|state| {
            let before = state.response_filters.len();
            state.response_filters.retain(|(k, _)| k != key);
            before != state.response_filters.len()
        })
    }

    pub fn global_request_filter_keys(&self) -> Vec<TypeKey> {
        let state = self.state.load();
        state.global_request_filters.iter().map(|(k, _)| *k).collect()
    }

    pub fn global_response_filter_keys(&self) -> Vec<TypeKey> {
        let state = self.state.load();
        state.global_response_filters.iter().map(|(k, _)| *k).collect()
    }

    // --- interceptors ---

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        debug!(interceptor = interceptor.name(), "Added interceptor");
        self.update(|state| state.interceptors.push(interceptor));
    }

    pub fn remove_interceptor(&self, interceptor: &Arc<dyn Interceptor>) -> bool {
        self.update(|state| {
            let before = state.interceptors.len();
            state
                .interceptors
                .retain(|i| !std::ptr::addr_eq(Arc::as_ptr(i), Arc::as_ptr(interceptor)));
            before != state.interceptors.len()
        })
    }

    pub fn interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        self.state.load().interceptors.clone()
    }

    // --- exception mappers ---

    /// Install a mapper for the kind it declares. Mappers for the universal
    /// kind are skipped with a warning.
    pub fn add_exception_mapper(&self, mapper: Arc<dyn ExceptionMapper>) -> bool {
        self.update(|state| state.exception_mappers.insert(mapper))
    }

    pub fn add_exception_mappers<I>(&self, mappers: I)
    where
        I: IntoIterator<Item = Arc<dyn ExceptionMapper>>,
    {
        self.update(|state| {
            for mapper in mappers {
                state.exception_mappers.insert(mapper);
            }
        });
    }

    pub fn remove_exception_mapper(&self, kind: &FailureKind) -> Option<Arc<dyn ExceptionMapper>> {
        self.update(|state| state.exception_mappers.remove(kind))
    }

    pub fn exception_mapper(&self, failure: &dyn Failure) -> Option<Arc<dyn ExceptionMapper>> {
        self.state.load().exception_mapper(failure)
    }

    // --- media converters ---

    pub fn register_media_converter(&self, converter: Arc<dyn MediaTypeConverter>) {
        debug!(media_type = converter.media_type(), "Registered media converter");
        self.update(|state| state.converters.register(converter));
    }

    pub fn media_converter(&self, content_type: Option<&str>) -> Arc<dyn MediaTypeConverter> {
        self.state.load().media_converter(content_type)
    }
}

impl fmt::Debug for MicroservicesRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicroservicesRegistry")
            .field("state", &*self.state.load())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        inits: AtomicUsize,
    }

    impl Microservice for Counting {
        fn base_path(&self) -> Option<&str> {
            Some("/counting")
        }

        fn post_construct(&self) -> crate::service::LifecycleResult {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_every_mutation_bumps_version() {
        let registry = MicroservicesRegistry::new();
        let before = registry.snapshot();
        registry.add_service("/a", Arc::new(Counting { inits: AtomicUsize::new(0) }));
        let after = registry.snapshot();

        assert_eq!(before.version() + 1, after.version());
        assert_eq!(before.service_count(), 0);
        assert_eq!(after.service_count(), 1);
    }

    #[test]
    fn test_post_construct_runs_once() {
        let registry = MicroservicesRegistry::new();
        let service = Arc::new(Counting { inits: AtomicUsize::new(0) });
        let dynamic: Arc<dyn Microservice> = service.clone();
        registry.add_services([dynamic]).unwrap();

        registry.init_services().unwrap();
        registry.init_services().unwrap();
        assert_eq!(service.inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_mapper_installed() {
        let registry = MicroservicesRegistry::new();
        assert_eq!(registry.snapshot().exception_mappers().len(), 1);
    }
}
