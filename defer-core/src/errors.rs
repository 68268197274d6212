//! # Errors (Feathers-style)
//!
//! Every failure the deferral pipeline can produce is a [`TaskError`]
//! carried through `anyhow::Error`:
//! - consistent status codes + class names
//! - submit-side failures are returned to the caller as-is
//! - execute-side failures become the HTTP status the queue reacts to
//!
//! The server crate decides how to serialize (see `to_json()`).

use std::fmt;

use anyhow::Error as AnyError;

/// A convenience result type for defer APIs.
pub type TaskResult<T> = std::result::Result<T, AnyError>;

/// Error classes + the status codes they map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,          // 400
    ScheduleValidation,  // 400
    Unauthorized,        // 401
    NotFound,            // 404
    DuplicateTask,       // 409
    Handler,             // 500
    QueueUnavailable,    // 503
    QueueCreation,       // 503
    RetryBudgetExceeded, // 200
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::ScheduleValidation => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::DuplicateTask => 409,
            ErrorKind::Handler => 500,
            ErrorKind::QueueUnavailable => 503,
            ErrorKind::QueueCreation => 503,
            // A 2xx acknowledges the delivery so the queue stops redelivering.
            ErrorKind::RetryBudgetExceeded => 200,
        }
    }

    /// Error `name` (e.g. "DuplicateTask")
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::ScheduleValidation => "ScheduleValidationError",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::DuplicateTask => "DuplicateTask",
            ErrorKind::Handler => "HandlerError",
            ErrorKind::QueueUnavailable => "QueueUnavailable",
            ErrorKind::QueueCreation => "QueueCreationError",
            ErrorKind::RetryBudgetExceeded => "RetryBudgetExceeded",
        }
    }

    /// Error `className` (kebab-cased)
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation-error",
            ErrorKind::ScheduleValidation => "schedule-validation-error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not-found",
            ErrorKind::DuplicateTask => "duplicate-task",
            ErrorKind::Handler => "handler-error",
            ErrorKind::QueueUnavailable => "queue-unavailable",
            ErrorKind::QueueCreation => "queue-creation-error",
            ErrorKind::RetryBudgetExceeded => "retry-budget-exceeded",
        }
    }

    /// Whether the queue infrastructure should redeliver after this error.
    pub fn is_retry_eligible(&self) -> bool {
        !(200..300).contains(&self.status_code())
    }
}

/// A structured error that can live inside `anyhow::Error`.
///
/// Mirrors Feathers-style fields:
/// - name
/// - message
/// - code (HTTP status)
/// - class_name
/// - data (optional)
#[derive(Debug)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub source: Option<AnyError>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            source: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_source(mut self, source: AnyError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn class_name(&self) -> &'static str {
        self.kind.class_name()
    }

    /// Convert into `anyhow::Error`.
    pub fn into_anyhow(self) -> AnyError {
        AnyError::new(self)
    }

    /// Find a `TaskError` anywhere in an `anyhow::Error` chain.
    pub fn from_anyhow(err: &AnyError) -> Option<&TaskError> {
        err.chain().find_map(|e| e.downcast_ref::<TaskError>())
    }

    /// Kind of the first `TaskError` in the chain, if any.
    pub fn kind_of(err: &AnyError) -> Option<ErrorKind> {
        Self::from_anyhow(err).map(|e| e.kind)
    }

    /// Turn any error into a TaskError:
    /// - if it's already a TaskError, keep it (lossless)
    /// - otherwise wrap as HandlerError
    pub fn normalize(err: AnyError) -> TaskError {
        match err.downcast::<TaskError>() {
            Ok(task) => task,
            Err(other) => TaskError::new(ErrorKind::Handler, other.to_string()).with_source(other),
        }
    }

    /// A "safe" version suitable for returning to clients:
    /// keeps kind/message/data and drops the inner `source`.
    pub fn sanitize_for_client(&self) -> TaskError {
        TaskError {
            kind: self.kind,
            message: self.message.clone(),
            data: self.data.clone(),
            source: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;

        let mut base = json!({
            "name": self.name(),
            "message": self.message,
            "code": self.code(),
            "className": self.class_name(),
        });

        if let Some(d) = &self.data {
            base["data"] = d.clone();
        }
        base
    }

    // ---- Constructors ----

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }
    pub fn schedule_validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ScheduleValidation, msg)
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }
    pub fn duplicate_task(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::DuplicateTask, msg)
    }
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler, msg)
    }
    pub fn queue_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueUnavailable, msg)
    }
    pub fn queue_creation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueCreation, msg)
    }
    pub fn retry_budget_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::RetryBudgetExceeded, msg)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.code(), self.message)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience helper for "bail with TaskError".
#[macro_export]
macro_rules! bail_task {
    ($ctor:ident, $msg:expr) => {
        return Err($crate::errors::TaskError::$ctor($msg).into_anyhow())
    };
    ($ctor:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::errors::TaskError::$ctor(format!($fmt, $($arg)*)).into_anyhow())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_survives_context_wrapping() {
        let err = TaskError::duplicate_task("task abc is pending")
            .into_anyhow()
            .context("submitting /hello");

        let found = TaskError::from_anyhow(&err).expect("task error in chain");
        assert_eq!(found.kind, ErrorKind::DuplicateTask);
        assert_eq!(found.code(), 409);
    }

    #[test]
    fn foreign_errors_normalize_to_handler_errors() {
        let err = TaskError::normalize(anyhow::anyhow!("boom"));
        assert_eq!(err.kind, ErrorKind::Handler);
        assert!(err.kind.is_retry_eligible());
        assert_eq!(err.to_json()["className"], "handler-error");
    }

    #[test]
    fn retry_budget_is_terminal() {
        assert!(!ErrorKind::RetryBudgetExceeded.is_retry_eligible());
        assert!(ErrorKind::QueueUnavailable.is_retry_eligible());
    }

    #[test]
    fn sanitized_json_drops_source() {
        let err = TaskError::queue_unavailable("tasks api unreachable")
            .with_source(anyhow::anyhow!("secret connection string"))
            .with_data(serde_json::json!({ "queue": "q1" }));
        let json = err.sanitize_for_client().to_json();
        assert_eq!(json["name"], "QueueUnavailable");
        assert_eq!(json["data"]["queue"], "q1");
        assert!(!json.to_string().contains("secret"));
    }
}
