//! Failure kinds and exception mappers
//!
//! Failures that escape a handler, an interceptor or the binding pipeline are
//! turned into responses by the most specific registered [`ExceptionMapper`].
//!
//! Specificity comes from an explicit "is a specialization of" relation:
//! every [`FailureKind`] names its parent when it is declared, so the lookup
//! order is fixed by the kind hierarchy and not by registration order.
//!
//! ```
//! use conduit_core::exception::{FailureKind, ANY_FAILURE};
//!
//! static STORAGE: FailureKind = FailureKind::new("app::Storage");
//! static NOT_FOUND: FailureKind = FailureKind::child("app::NotFound", &STORAGE);
//!
//! assert!(NOT_FOUND.is_a(&STORAGE));
//! assert!(NOT_FOUND.is_a(&ANY_FAILURE));
//! assert!(!STORAGE.is_a(&NOT_FOUND));
//! ```

use crate::error::{DISPATCH_FAILURE, DispatchError};
use crate::http::Response;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A declared failure kind.
///
/// Kinds are compared by name, so names should be unique, e.g. a type path.
#[derive(Clone, Copy)]
pub struct FailureKind {
    name: &'static str,
    parent: Option<&'static FailureKind>,
    universal: bool,
}

/// The universal base kind every failure is a specialization of
pub static ANY_FAILURE: FailureKind = FailureKind {
    name: "conduit::AnyFailure",
    parent: None,
    universal: true,
};

impl FailureKind {
    /// A kind directly below [`ANY_FAILURE`]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            parent: None,
            universal: false,
        }
    }

    /// A specialization of `parent`
    pub const fn child(name: &'static str, parent: &'static FailureKind) -> Self {
        Self {
            name,
            parent: Some(parent),
            universal: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static FailureKind> {
        match self.parent {
            Some(parent) => Some(parent),
            None if self.universal => None,
            None => Some(&ANY_FAILURE),
        }
    }

    pub fn is_universal(&self) -> bool {
        self.universal
    }

    /// Whether this kind is `other` or one of its specializations
    pub fn is_a(&self, other: &FailureKind) -> bool {
        if other.universal {
            return true;
        }
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind.name == other.name && !kind.universal {
                return true;
            }
            current = kind.parent;
        }
        false
    }

    /// Distance from [`ANY_FAILURE`]
    pub fn depth(&self) -> usize {
        if self.universal {
            return 0;
        }
        let mut depth = 1;
        let mut current = self.parent;
        while let Some(kind) = current {
            depth += 1;
            current = kind.parent;
        }
        depth
    }
}

impl PartialEq for FailureKind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.universal == other.universal
    }
}

impl Eq for FailureKind {}

impl fmt::Debug for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FailureKind({})", self.name)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// An error that can be mapped to a response
pub trait Failure: std::error::Error + Any + Send + Sync {
    fn kind(&self) -> &'static FailureKind;
}

pub type BoxFailure = Box<dyn Failure>;

impl dyn Failure {
    pub fn is<T: Failure>(&self) -> bool {
        (self as &dyn Any).is::<T>()
    }

    pub fn downcast_ref<T: Failure>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}

/// Maps failures of one kind (and its specializations) to a response
pub trait ExceptionMapper: Send + Sync {
    /// Kind this mapper handles
    fn handles(&self) -> &'static FailureKind;

    fn to_response(&self, failure: &dyn Failure) -> Response;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Exception mappers ordered most specific first.
///
/// Ordering is by kind depth (deepest first), then by kind name, so two
/// unrelated kinds at the same depth still have a stable position.
#[derive(Clone, Default)]
pub struct MapperTable {
    entries: Vec<Arc<dyn ExceptionMapper>>,
}

impl MapperTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapper, replacing any mapper for the same kind.
    ///
    /// Returns `false` when the mapper declares the universal kind; such
    /// mappers are never installed.
    pub fn insert(&mut self, mapper: Arc<dyn ExceptionMapper>) -> bool {
        let kind = mapper.handles();
        if kind.is_universal() {
            warn!(
                mapper = mapper.name(),
                "Exception mapper declares the universal failure kind, skipping"
            );
            return false;
        }

        if let Some(existing) = self.entries.iter_mut().find(|m| m.handles() == kind) {
            debug!(kind = kind.name(), mapper = mapper.name(), "Replacing exception mapper");
            *existing = mapper;
            return true;
        }

        let position = self
            .entries
            .iter()
            .position(|m| Self::sorts_before(kind, m.handles()))
            .unwrap_or(self.entries.len());
        debug!(kind = kind.name(), mapper = mapper.name(), "Registered exception mapper");
        self.entries.insert(position, mapper);
        true
    }

    fn sorts_before(kind: &FailureKind, other: &FailureKind) -> bool {
        match kind.depth().cmp(&other.depth()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => kind.name() < other.name(),
        }
    }

    pub fn remove(&mut self, kind: &FailureKind) -> Option<Arc<dyn ExceptionMapper>> {
        let index = self.entries.iter().position(|m| m.handles() == kind)?;
        Some(self.entries.remove(index))
    }

    /// First mapper whose kind the failure is a specialization of
    pub fn find(&self, failure: &dyn Failure) -> Option<Arc<dyn ExceptionMapper>> {
        let kind = failure.kind();
        self.entries.iter().find(|m| kind.is_a(m.handles())).cloned()
    }

    pub fn kinds(&self) -> Vec<&'static FailureKind> {
        self.entries.iter().map(|m| m.handles()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for MapperTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|m| m.handles().name()))
            .finish()
    }
}

/// Default mapper for binding failures: the error's status code with a JSON body
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchErrorMapper;

impl ExceptionMapper for DispatchErrorMapper {
    fn handles(&self) -> &'static FailureKind {
        &DISPATCH_FAILURE
    }

    fn to_response(&self, failure: &dyn Failure) -> Response {
        match failure.downcast_ref::<DispatchError>() {
            Some(err) => Response::json_error(err.status_code(), &err.cause().to_string()),
            None => Response::json_error(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                &failure.to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    static STORAGE: FailureKind = FailureKind::new("test::Storage");
    static NOT_FOUND: FailureKind = FailureKind::child("test::NotFound", &STORAGE);
    static OTHER: FailureKind = FailureKind::new("test::Other");

    #[derive(Debug, thiserror::Error)]
    #[error("row missing")]
    struct RowMissing;

    impl Failure for RowMissing {
        fn kind(&self) -> &'static FailureKind {
            &NOT_FOUND
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

    #[test]
    fn test_kind_hierarchy() {
        assert_eq!(ANY_FAILURE.depth(), 0);
        assert_eq!(STORAGE.depth(), 1);
        assert_eq!(NOT_FOUND.depth(), 2);
        assert!(NOT_FOUND.is_a(&STORAGE));
        assert!(!OTHER.is_a(&STORAGE));
        assert_eq!(STORAGE.parent(), Some(&ANY_FAILURE));
        assert_eq!(ANY_FAILURE.parent(), None);
    }

    #[test]
    fn test_most_specific_mapper_wins_in_any_order() {
        for reversed in [false, true] {
            let mut table = MapperTable::new();
            let mut mappers: Vec<Arc<dyn ExceptionMapper>> = vec![
                Arc::new(StatusMapper(&STORAGE, StatusCode::SERVICE_UNAVAILABLE)),
                Arc::new(StatusMapper(&NOT_FOUND, StatusCode::NOT_FOUND)),
            ];
            if reversed {
                mappers.reverse();
            }
            for mapper in mappers {
                table.insert(mapper);
            }

            let mapper = table.find(&RowMissing).unwrap();
            assert_eq!(mapper.to_response(&RowMissing).status, StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn test_universal_mapper_is_skipped() {
        let mut table = MapperTable::new();
        assert!(!table.insert(Arc::new(StatusMapper(&ANY_FAILURE, StatusCode::IM_A_TEAPOT))));
        assert!(table.is_empty());
        assert!(table.find(&RowMissing).is_none());
    }

    #[test]
    fn test_replace_and_remove() {
        let mut table = MapperTable::new();
        table.insert(Arc::new(StatusMapper(&STORAGE, StatusCode::BAD_GATEWAY)));
        table.insert(Arc::new(StatusMapper(&STORAGE, StatusCode::GONE)));
        assert_eq!(table.len(), 1);
        let found = table.find(&RowMissing).unwrap();
        assert_eq!(found.to_response(&RowMissing).status, StatusCode::GONE);

        assert!(table.remove(&STORAGE).is_some());
        assert!(table.find(&RowMissing).is_none());
    }

    #[test]
    fn test_downcast_failure() {
        let failure: BoxFailure = Box::new(RowMissing);
        assert!(failure.is::<RowMissing>());
        assert!(failure.downcast_ref::<RowMissing>().is_some());
    }
}
