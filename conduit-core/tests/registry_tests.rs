//! Registry bookkeeping: services, lifecycle, filters and exception mappers

use conduit_core::{
    ExceptionMapper, Failure, FailureKind, Flow, Interceptor, LifecycleResult, LoggingInterceptor,
    Microservice, MicroservicesRegistry, RegistryError, Request, RequestFilter, Responder,
    Response, ResponseFilter, TypeKey,
};
use conduit_core::exception::BoxFailure;
use conduit_core::error::LifecyclePhase;
use http::StatusCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Auth;
struct Audit;
struct Cors;

struct Secured;

impl Microservice for Secured {
    fn base_path(&self) -> Option<&str> {
        Some("/secure")
    }

    fn request_filters(&self) -> Vec<TypeKey> {
        vec![TypeKey::of::<Auth>()]
    }

    fn response_filters(&self) -> Vec<TypeKey> {
        vec![TypeKey::of::<Audit>()]
    }
}

struct Open;

impl Microservice for Open {
    fn base_path(&self) -> Option<&str> {
        Some("/open")
    }
}

struct Pathless;
impl Microservice for Pathless {}

fn pass() -> Arc<dyn RequestFilter> {
    Arc::new(|_: &Request, _: &Responder| -> Result<Flow, BoxFailure> { Ok(Flow::Continue) })
}

struct Stamp;

impl ResponseFilter for Stamp {
    fn filter(&self, _request: &Request, _response: &mut Response) -> Result<(), BoxFailure> {
        Ok(())
    }
}

#[test]
fn test_add_then_remove_restores_metadata() {
    let registry = MicroservicesRegistry::new();
    registry.add_service("/open", Arc::new(Open));
    let before = registry.metadata();

    let secured: Arc<dyn Microservice> = Arc::new(Secured);
    registry.add_service("/secure", Arc::clone(&secured));
    assert_ne!(registry.metadata(), before);
    assert!(registry.metadata().applies_request_filter(&TypeKey::of::<Auth>()));

    assert!(registry.remove_service(&secured));
    assert_eq!(registry.metadata(), before);
    assert!(!registry.remove_service(&secured));
}

#[test]
fn test_global_filters_exclude_service_declared_ones() {
    let registry = MicroservicesRegistry::new();
    registry.register_request_filter(TypeKey::of::<Auth>(), pass());
    registry.register_request_filter(TypeKey::of::<Cors>(), pass());
    registry.register_response_filter(TypeKey::of::<Audit>(), Arc::new(Stamp));

    assert_eq!(
        registry.global_request_filter_keys(),
        vec![TypeKey::of::<Auth>(), TypeKey::of::<Cors>()]
    );

    let secured: Arc<dyn Microservice> = Arc::new(Secured);
    registry.add_service("/secure", Arc::clone(&secured));
    assert_eq!(registry.global_request_filter_keys(), vec![TypeKey::of::<Cors>()]);
    assert!(registry.global_response_filter_keys().is_empty());

    // still registered, just not global
    assert!(registry.snapshot().request_filter(&TypeKey::of::<Auth>()).is_some());

    registry.remove_service(&secured);
    assert_eq!(registry.global_request_filter_keys().len(), 2);
    assert_eq!(registry.global_response_filter_keys(), vec![TypeKey::of::<Audit>()]);
}

#[test]
fn test_filter_keys_register_once() {
    let registry = MicroservicesRegistry::new();
    assert!(registry.register_request_filter(TypeKey::of::<Cors>(), pass()));
    assert!(!registry.register_request_filter(TypeKey::of::<Cors>(), pass()));
    assert!(registry.remove_request_filter(&TypeKey::of::<Cors>()));
    assert!(!registry.remove_request_filter(&TypeKey::of::<Cors>()));
    assert!(registry.global_request_filter_keys().is_empty());
}

#[test]
fn test_same_base_path_replaces_service() {
    let registry = MicroservicesRegistry::new();
    registry.add_service("/svc", Arc::new(Open));
    registry.add_service("/svc", Arc::new(Secured));

    assert_eq!(registry.service_count(), 1);
    let current = registry.service_with_base_path("/svc").unwrap();
    assert!(current.is::<Secured>());
}

#[test]
fn test_add_services_requires_base_paths() {
    let registry = MicroservicesRegistry::new();
    let err = registry
        .add_services([Arc::new(Open) as Arc<dyn Microservice>, Arc::new(Pathless)])
        .unwrap_err();
    assert!(matches!(err, RegistryError::MissingBasePath { .. }));
    assert_eq!(registry.service_count(), 0);

    registry
        .add_services([Arc::new(Open) as Arc<dyn Microservice>, Arc::new(Secured)])
        .unwrap();
    let paths: Vec<String> = registry
        .metadata()
        .base_paths()
        .map(str::to_string)
        .collect();
    assert_eq!(paths, vec!["/open", "/secure"]);
}

#[derive(Default)]
struct Fragile {
    fail_init: bool,
    fail_destroy: bool,
    inits: AtomicUsize,
    destroys: AtomicUsize,
}

impl Microservice for Fragile {
    fn base_path(&self) -> Option<&str> {
        Some("/fragile")
    }

    fn post_construct(&self) -> LifecycleResult {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err("database unreachable".into());
        }
        Ok(())
    }

    fn pre_destroy(&self) -> LifecycleResult {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err("flush failed".into());
        }
        Ok(())
    }
}

#[test]
fn test_failed_deploy_leaves_registry_untouched() {
    let registry = MicroservicesRegistry::new();
    let err = registry
        .deploy_service(
            "/fragile",
            Arc::new(Fragile {
                fail_init: true,
                ..Fragile::default()
            }),
        )
        .unwrap_err();

    match err {
        RegistryError::Lifecycle { phase, source, .. } => {
            assert_eq!(phase, LifecyclePhase::PostConstruct);
            assert_eq!(source.to_string(), "database unreachable");
        }
        other => panic!("expected a lifecycle failure, got {other:?}"),
    }
    assert_eq!(registry.service_count(), 0);
    assert_eq!(registry.version(), 0);
}

#[test]
fn test_undeploy_removes_service_even_when_hook_fails() {
    let registry = MicroservicesRegistry::new();
    let fragile = Arc::new(Fragile {
        fail_destroy: true,
        ..Fragile::default()
    });
    let service: Arc<dyn Microservice> = fragile.clone();
    registry.deploy_service("/fragile", Arc::clone(&service)).unwrap();
    assert_eq!(fragile.inits.load(Ordering::SeqCst), 1);

    let err = registry.undeploy_service(&service).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Lifecycle {
            phase: LifecyclePhase::PreDestroy,
            ..
        }
    ));
    assert_eq!(fragile.destroys.load(Ordering::SeqCst), 1);
    assert_eq!(registry.service_count(), 0);
}

#[test]
fn test_redeploy_runs_post_construct_again() {
    let registry = MicroservicesRegistry::new();
    let fragile = Arc::new(Fragile::default());
    let service: Arc<dyn Microservice> = fragile.clone();

    registry.deploy_service("/fragile", Arc::clone(&service)).unwrap();
    registry.init_services().unwrap();
    registry.undeploy_service(&service).unwrap();
    registry.deploy_service("/fragile", Arc::clone(&service)).unwrap();

    assert_eq!(fragile.inits.load(Ordering::SeqCst), 2);
    assert_eq!(fragile.destroys.load(Ordering::SeqCst), 1);
}

struct Counted {
    inits: Arc<AtomicUsize>,
    _payload: Vec<u8>,
}

impl Microservice for Counted {
    fn base_path(&self) -> Option<&str> {
        Some("/counted")
    }

    fn post_construct(&self) -> LifecycleResult {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_each_replacing_deploy_runs_post_construct() {
    let registry = MicroservicesRegistry::new();
    let inits = Arc::new(AtomicUsize::new(0));

    // Replaced instances are dropped straight away, so fresh ones are likely
    // to land at a freed address.
    for _ in 0..50 {
        let service = Arc::new(Counted {
            inits: Arc::clone(&inits),
            _payload: vec![0; 16],
        });
        registry.deploy_service("/counted", service).unwrap();
    }
    assert_eq!(inits.load(Ordering::SeqCst), 50);
    assert_eq!(registry.service_count(), 1);

    for _ in 0..50 {
        registry.add_services([Arc::new(Counted {
            inits: Arc::clone(&inits),
            _payload: vec![0; 16],
        }) as Arc<dyn Microservice>])
        .unwrap();
        registry.init_services().unwrap();
    }
    assert_eq!(inits.load(Ordering::SeqCst), 100);

    // already initialised instances are left alone
    registry.init_services().unwrap();
    assert_eq!(inits.load(Ordering::SeqCst), 100);
}

static STORAGE: FailureKind = FailureKind::new("app::Storage");
static NOT_FOUND: FailureKind = FailureKind::child("app::NotFound", &STORAGE);
static STALE_ROW: FailureKind = FailureKind::child("app::StaleRow", &NOT_FOUND);

#[derive(Debug, thiserror::Error)]
#[error("{0} failure")]
struct AppFailure(&'static FailureKind);

impl Failure for AppFailure {
    fn kind(&self) -> &'static FailureKind {
        self.0
    }
}

struct StatusMapper(&'static FailureKind, StatusCode);

impl ExceptionMapper for StatusMapper {
    fn handles(&self) -> &'static FailureKind {
        self.0
    }

    fn to_response(&self, _failure: &dyn Failure) -> Response {
        Response::new(self.1)
    }
}

fn mapped_status(registry: &MicroservicesRegistry, kind: &'static FailureKind) -> Option<StatusCode> {
    registry
        .exception_mapper(&AppFailure(kind))
        .map(|mapper| mapper.to_response(&AppFailure(kind)).status)
}

#[test]
fn test_most_specific_mapper_wins_regardless_of_order() {
    let general: Arc<dyn ExceptionMapper> = Arc::new(StatusMapper(&STORAGE, StatusCode::SERVICE_UNAVAILABLE));
    let specific: Arc<dyn ExceptionMapper> = Arc::new(StatusMapper(&NOT_FOUND, StatusCode::NOT_FOUND));

    for mappers in [
        vec![Arc::clone(&general), Arc::clone(&specific)],
        vec![Arc::clone(&specific), Arc::clone(&general)],
    ] {
        let registry = MicroservicesRegistry::new();
        registry.add_exception_mappers(mappers);

        assert_eq!(mapped_status(&registry, &NOT_FOUND), Some(StatusCode::NOT_FOUND));
        assert_eq!(mapped_status(&registry, &STALE_ROW), Some(StatusCode::NOT_FOUND));
        assert_eq!(mapped_status(&registry, &STORAGE), Some(StatusCode::SERVICE_UNAVAILABLE));
    }
}

#[test]
fn test_universal_mapper_is_skipped() {
    let registry = MicroservicesRegistry::new();
    let installed = registry.add_exception_mapper(Arc::new(StatusMapper(
        &conduit_core::ANY_FAILURE,
        StatusCode::IM_A_TEAPOT,
    )));
    assert!(!installed);
    assert_eq!(mapped_status(&registry, &STORAGE), None);
}

#[test]
fn test_removing_mapper_falls_back_to_parent() {
    let registry = MicroservicesRegistry::new();
    registry.add_exception_mapper(Arc::new(StatusMapper(&STORAGE, StatusCode::SERVICE_UNAVAILABLE)));
    registry.add_exception_mapper(Arc::new(StatusMapper(&NOT_FOUND, StatusCode::NOT_FOUND)));

    assert!(registry.remove_exception_mapper(&NOT_FOUND).is_some());
    assert_eq!(mapped_status(&registry, &NOT_FOUND), Some(StatusCode::SERVICE_UNAVAILABLE));
}

#[test]
fn test_interceptors_add_and_remove() {
    let registry = MicroservicesRegistry::new();
    let logging: Arc<dyn Interceptor> = Arc::new(LoggingInterceptor);
    registry.add_interceptor(Arc::clone(&logging));
    assert_eq!(registry.interceptors().len(), 1);

    assert!(registry.remove_interceptor(&logging));
    assert!(!registry.remove_interceptor(&logging));
    assert!(registry.interceptors().is_empty());
}

#[test]
fn test_snapshots_are_isolated_from_later_changes() {
    let registry = MicroservicesRegistry::new();
    let snapshot = registry.snapshot();

    registry.add_service("/open", Arc::new(Open));
    registry.register_request_filter(TypeKey::of::<Cors>(), pass());

    assert_eq!(snapshot.service_count(), 0);
    assert!(snapshot.global_request_filters().is_empty());
    assert_eq!(registry.snapshot().service_count(), 1);
    assert_eq!(registry.version(), snapshot.version() + 2);
}

#[test]
fn test_concurrent_registration() {
    let registry = Arc::new(MicroservicesRegistry::new());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry.add_service(&format!("/svc{i}"), Arc::new(Open));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.service_count(), 8);
    assert_eq!(registry.version(), 8);
}
