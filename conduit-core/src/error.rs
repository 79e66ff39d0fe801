// Error types for the dispatch layer

use crate::exception::{Failure, FailureKind};
use http::StatusCode;
use std::fmt;
use thiserror::Error;

/// Parent kind of every binding failure
pub static DISPATCH_FAILURE: FailureKind = FailureKind::new("conduit::DispatchError");
pub static MISSING_PARAMETER: FailureKind =
    FailureKind::child("conduit::MissingParameterError", &DISPATCH_FAILURE);
pub static CONVERSION_FAILURE: FailureKind =
    FailureKind::child("conduit::ConversionError", &DISPATCH_FAILURE);
pub static UNRESOLVED_CONTEXT_TYPE: FailureKind =
    FailureKind::child("conduit::UnresolvedContextTypeError", &DISPATCH_FAILURE);
pub static BINDING_FAILURE: FailureKind =
    FailureKind::child("conduit::BindingError", &DISPATCH_FAILURE);
pub static FORM_PARSING_FAILURE: FailureKind =
    FailureKind::child("conduit::FormParsingError", &DISPATCH_FAILURE);

/// Parent kind of registry failures
pub static REGISTRY_FAILURE: FailureKind = FailureKind::new("conduit::RegistryError");
pub static LIFECYCLE_FAILURE: FailureKind =
    FailureKind::child("conduit::LifecycleError", &REGISTRY_FAILURE);

/// Malformed form bodies and temp-file trouble while extracting them
#[derive(Error, Debug)]
pub enum FormError {
    #[error("multipart content type has no boundary")]
    MissingBoundary,

    #[error("malformed multipart body: {0}")]
    Malformed(String),

    #[error("form has more than {limit} parts")]
    TooManyParts { limit: usize },

    #[error("form body of {actual} bytes exceeds the {limit} byte limit")]
    TooLarge { limit: usize, actual: usize },

    #[error("malformed url-encoded body: {0}")]
    UrlEncoded(#[from] serde_urlencoded::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FormError {
    /// Whether the request itself is at fault
    pub fn is_client_error(&self) -> bool {
        !matches!(self, FormError::Io(_))
    }
}

/// Why a single argument could not be bound
#[derive(Error, Debug)]
pub enum BindingFailure {
    #[error("Could not resolve value for parameter {key}")]
    MissingParameter { key: String },

    #[error("Could not convert parameter {key} to {target}: {reason}")]
    Conversion {
        key: String,
        target: &'static str,
        reason: String,
    },

    #[error("Unresolved context type: {type_name}")]
    UnresolvedContextType { type_name: &'static str },

    #[error("Could not bind context {target}: {reason}")]
    Binding { target: String, reason: String },

    #[error("Form parsing error: {0}")]
    FormParsing(#[from] FormError),
}

impl BindingFailure {
    pub fn kind(&self) -> &'static FailureKind {
        match self {
            BindingFailure::MissingParameter { .. } => &MISSING_PARAMETER,
            BindingFailure::Conversion { .. } => &CONVERSION_FAILURE,
            BindingFailure::UnresolvedContextType { .. } => &UNRESOLVED_CONTEXT_TYPE,
            BindingFailure::Binding { .. } => &BINDING_FAILURE,
            BindingFailure::FormParsing(_) => &FORM_PARSING_FAILURE,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            BindingFailure::MissingParameter { .. } | BindingFailure::Conversion { .. } => {
                StatusCode::BAD_REQUEST
            }
            BindingFailure::FormParsing(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The single error surfaced by argument binding.
///
/// Carries the resource method and the request line so a mapper can
/// produce a useful diagnostic.
#[derive(Error, Debug)]
#[error("Failed to bind arguments of {method} for '{request_line}': {cause}")]
pub struct DispatchError {
    method: String,
    request_line: String,
    #[source]
    cause: BindingFailure,
}

impl DispatchError {
    pub fn new(
        method: impl Into<String>,
        request_line: impl Into<String>,
        cause: BindingFailure,
    ) -> Self {
        Self {
            method: method.into(),
            request_line: request_line.into(),
            cause,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    pub fn cause(&self) -> &BindingFailure {
        &self.cause
    }

    pub fn into_cause(self) -> BindingFailure {
        self.cause
    }

    pub fn status_code(&self) -> StatusCode {
        self.cause.status_code()
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl Failure for DispatchError {
    fn kind(&self) -> &'static FailureKind {
        self.cause.kind()
    }
}

/// Which lifecycle hook ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    PostConstruct,
    PreDestroy,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::PostConstruct => f.write_str("post-construct"),
            LifecyclePhase::PreDestroy => f.write_str("pre-destroy"),
        }
    }
}

/// Error type returned by lifecycle hooks
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Service {service} does not declare a base path")]
    MissingBasePath { service: String },

    #[error("The {phase} hook of service {service} failed: {source}")]
    Lifecycle {
        service: String,
        phase: LifecyclePhase,
        source: HookError,
    },
}

impl RegistryError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl Failure for RegistryError {
    fn kind(&self) -> &'static FailureKind {
        match self {
            RegistryError::MissingBasePath { .. } => &REGISTRY_FAILURE,
            RegistryError::Lifecycle { .. } => &LIFECYCLE_FAILURE,
        }
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}
