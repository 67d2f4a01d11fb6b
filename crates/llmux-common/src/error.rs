use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{InstanceId, PipelineId, now_epoch_ms};

/// Closed set of error codes produced by the core.
///
/// Codes are stable strings: they appear in client-visible error bodies and
/// in error-center strategy configuration, so renaming one is a breaking
/// change.
pub mod codes {
    // configuration
    pub const INVALID_CONFIG: &str = "invalid_config";
    pub const MISSING_CONFIG: &str = "missing_config";
    // pipeline lifecycle
    pub const PIPELINE_NOT_FOUND: &str = "pipeline_not_found";
    pub const PIPELINE_ALREADY_EXISTS: &str = "pipeline_already_exists";
    pub const PIPELINE_INVALID_STATE: &str = "pipeline_invalid_state";
    // scheduling
    pub const NO_AVAILABLE_PIPELINES: &str = "no_available_pipelines";
    pub const LOAD_BALANCING_FAILED: &str = "load_balancing_failed";
    // execution
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const EXECUTION_TIMEOUT: &str = "execution_timeout";
    pub const EXECUTION_CANCELLED: &str = "execution_cancelled";
    pub const EXECUTION_ABORTED: &str = "execution_aborted";
    // network
    pub const CONNECTION_FAILED: &str = "connection_failed";
    pub const REQUEST_TIMEOUT: &str = "request_timeout";
    pub const NETWORK_UNREACHABLE: &str = "network_unreachable";
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    // authentication
    pub const AUTHENTICATION_FAILED: &str = "authentication_failed";
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const INVALID_CREDENTIALS: &str = "invalid_credentials";
    pub const ACCESS_DENIED: &str = "access_denied";
    pub const DEVICE_AUTHORIZATION_TIMEOUT: &str = "device_authorization_timeout";
    // rate limiting
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const TOO_MANY_REQUESTS: &str = "too_many_requests";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const THROTTLED: &str = "throttled";
    // resource
    pub const INSUFFICIENT_MEMORY: &str = "insufficient_memory";
    pub const INSUFFICIENT_DISK: &str = "insufficient_disk";
    pub const CPU_OVERLOAD: &str = "cpu_overload";
    pub const RESOURCE_EXHAUSTED: &str = "resource_exhausted";
    // data
    pub const DATA_INVALID_FORMAT: &str = "data_invalid_format";
    pub const DATA_VALIDATION_FAILED: &str = "data_validation_failed";
    pub const DATA_TOO_LARGE: &str = "data_too_large";
    pub const DATA_CORRUPTED: &str = "data_corrupted";
    // system
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const SYSTEM_OVERLOAD: &str = "system_overload";
    pub const SERVICE_UNAVAILABLE: &str = "service_unavailable";
    pub const MAINTENANCE: &str = "maintenance";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    PipelineLifecycle,
    Scheduling,
    Execution,
    Network,
    Authentication,
    RateLimiting,
    Resource,
    Data,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recoverability {
    Recoverable,
    Unrecoverable,
    Auth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorImpact {
    SingleModule,
    Pipeline,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::PipelineLifecycle => "pipeline_lifecycle",
            ErrorCategory::Scheduling => "scheduling",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Network => "network",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimiting => "rate_limiting",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Data => "data",
            ErrorCategory::System => "system",
        }
    }

    /// Category of a code; unknown codes fall back to `System`.
    pub fn of(code: &str) -> Self {
        use codes::*;
        match code {
            INVALID_CONFIG | MISSING_CONFIG => ErrorCategory::Configuration,
            PIPELINE_NOT_FOUND | PIPELINE_ALREADY_EXISTS | PIPELINE_INVALID_STATE => {
                ErrorCategory::PipelineLifecycle
            }
            NO_AVAILABLE_PIPELINES | LOAD_BALANCING_FAILED => ErrorCategory::Scheduling,
            EXECUTION_FAILED | EXECUTION_TIMEOUT | EXECUTION_CANCELLED | EXECUTION_ABORTED => {
                ErrorCategory::Execution
            }
            CONNECTION_FAILED | REQUEST_TIMEOUT | NETWORK_UNREACHABLE | PROTOCOL_ERROR => {
                ErrorCategory::Network
            }
            AUTHENTICATION_FAILED | TOKEN_EXPIRED | INVALID_CREDENTIALS | ACCESS_DENIED
            | DEVICE_AUTHORIZATION_TIMEOUT => ErrorCategory::Authentication,
            RATE_LIMIT_EXCEEDED | TOO_MANY_REQUESTS | QUOTA_EXCEEDED | THROTTLED => {
                ErrorCategory::RateLimiting
            }
            INSUFFICIENT_MEMORY | INSUFFICIENT_DISK | CPU_OVERLOAD | RESOURCE_EXHAUSTED => {
                ErrorCategory::Resource
            }
            DATA_INVALID_FORMAT | DATA_VALIDATION_FAILED | DATA_TOO_LARGE | DATA_CORRUPTED => {
                ErrorCategory::Data
            }
            _ => ErrorCategory::System,
        }
    }

    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::Configuration => ErrorSeverity::Critical,
            ErrorCategory::PipelineLifecycle => ErrorSeverity::Medium,
            ErrorCategory::Scheduling => ErrorSeverity::High,
            ErrorCategory::Execution => ErrorSeverity::Medium,
            ErrorCategory::Network => ErrorSeverity::Medium,
            ErrorCategory::Authentication => ErrorSeverity::High,
            ErrorCategory::RateLimiting => ErrorSeverity::Low,
            ErrorCategory::Resource => ErrorSeverity::High,
            ErrorCategory::Data => ErrorSeverity::Medium,
            ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    pub fn default_recoverability(&self) -> Recoverability {
        match self {
            ErrorCategory::Network | ErrorCategory::RateLimiting => Recoverability::Recoverable,
            ErrorCategory::Authentication => Recoverability::Auth,
            ErrorCategory::Scheduling
            | ErrorCategory::Resource
            | ErrorCategory::System
            | ErrorCategory::Execution => Recoverability::Recoverable,
            ErrorCategory::Configuration
            | ErrorCategory::PipelineLifecycle
            | ErrorCategory::Data => Recoverability::Unrecoverable,
        }
    }
}

/// Client-visible HTTP status for an error code.
pub fn http_status(code: &str) -> u16 {
    use codes::*;
    match code {
        INVALID_CONFIG | MISSING_CONFIG | DATA_INVALID_FORMAT | DATA_VALIDATION_FAILED => 400,
        AUTHENTICATION_FAILED | TOKEN_EXPIRED | INVALID_CREDENTIALS
        | DEVICE_AUTHORIZATION_TIMEOUT => 401,
        ACCESS_DENIED => 403,
        PIPELINE_NOT_FOUND => 404,
        PIPELINE_ALREADY_EXISTS => 409,
        DATA_TOO_LARGE => 413,
        DATA_CORRUPTED => 422,
        RATE_LIMIT_EXCEEDED | TOO_MANY_REQUESTS | QUOTA_EXCEEDED | THROTTLED => 429,
        EXECUTION_CANCELLED => 499,
        PROTOCOL_ERROR => 502,
        NO_AVAILABLE_PIPELINES | SERVICE_UNAVAILABLE | MAINTENANCE | SYSTEM_OVERLOAD => 503,
        EXECUTION_TIMEOUT | REQUEST_TIMEOUT => 504,
        INSUFFICIENT_MEMORY | INSUFFICIENT_DISK | CPU_OVERLOAD | RESOURCE_EXHAUSTED => 507,
        _ => 500,
    }
}

/// The error value every stage hands to the error center.
///
/// Immutable once constructed; the builder methods consume `self`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineError {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverability: Recoverability,
    pub impact: ErrorImpact,
    pub source: String,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<PipelineId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PipelineError {
    pub fn new(code: &str, message: impl Into<String>, source: impl Into<String>) -> Self {
        let category = ErrorCategory::of(code);
        Self {
            code: code.to_string(),
            message: message.into(),
            category,
            severity: category.default_severity(),
            recoverability: category.default_recoverability(),
            impact: ErrorImpact::SingleModule,
            source: source.into(),
            timestamp_ms: now_epoch_ms(),
            pipeline_id: None,
            instance_id: None,
            details: None,
        }
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_impact(mut self, impact: ErrorImpact) -> Self {
        self.impact = impact;
        self
    }

    pub fn with_pipeline(mut self, pipeline_id: impl Into<PipelineId>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn http_status(&self) -> u16 {
        http_status(&self.code)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PipelineError {}

/// User-visible error body (spec'd response shape for terminal failures).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorBody,
    pub context: ErrorContext,
    pub http_status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<PipelineId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    pub retry_count: u32,
}

impl ErrorResponse {
    pub fn from_error(err: &PipelineError, execution_id: Option<String>, retry_count: u32) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code: err.code.clone(),
                message: err.message.clone(),
                category: err.category,
                severity: err.severity,
                stack_trace: None,
            },
            context: ErrorContext {
                execution_id,
                pipeline_id: err.pipeline_id.clone(),
                instance_id: err.instance_id.clone(),
                retry_count,
            },
            http_status: err.http_status(),
        }
    }
}
