use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use defer_core::errors::TaskError;

#[derive(Debug)]
pub struct DeferAxumError(pub anyhow::Error);

impl From<anyhow::Error> for DeferAxumError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<TaskError> for DeferAxumError {
    fn from(e: TaskError) -> Self {
        Self(e.into_anyhow())
    }
}

pub(crate) fn task_error_response(err: &TaskError) -> Response {
    let safe = err.sanitize_for_client();
    let status = StatusCode::from_u16(safe.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(safe.to_json())).into_response()
}

impl IntoResponse for DeferAxumError {
    fn into_response(self) -> Response {
        // A TaskError anywhere in the chain keeps its kind and status
        if let Some(task) = TaskError::from_anyhow(&self.0) {
            return task_error_response(task);
        }

        // Anything else surfaces as a handler failure
        task_error_response(&TaskError::handler(self.0.to_string()))
    }
}
