use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    containers::{ContainerError, ContainerManager},
    tasks::{AdbController, DeviceController, TaskError, TaskRuntime},
};

/// Builds the device controller for an ADB serial.
pub type DeviceFactory = Arc<dyn Fn(&str) -> Arc<dyn DeviceController> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ContainerManager>,
    pub runtime: Arc<TaskRuntime>,
    pub devices: DeviceFactory,
}

impl AppState {
    pub fn new(manager: Arc<ContainerManager>, runtime: Arc<TaskRuntime>) -> Self {
        Self {
            manager,
            runtime,
            devices: Arc::new(|serial: &str| -> Arc<dyn DeviceController> {
                Arc::new(AdbController::new(serial))
            }),
        }
    }

    pub fn with_devices(mut self, devices: DeviceFactory) -> Self {
        self.devices = devices;
        self
    }
}

/// HTTP facade bound to `host:port`.
pub struct ApiServer {
    pub state: AppState,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LaunchRequest {
    pub count: usize,
    pub start_index: Option<u32>,
    pub image: Option<String>,
    #[serde(default)]
    pub wait_ready: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub task_name: String,
    pub container: String,
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SmsRequest {
    pub sender: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub name: String,
    pub existed: bool,
    pub discarded_runs: usize,
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub name: String,
    pub restarted: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Container(err) => match err {
                ContainerError::NotFound(_) => StatusCode::NOT_FOUND,
                ContainerError::NameTaken(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Task(err) => match err {
                TaskError::TaskNotFound(_) | TaskError::RunNotFound(_) => StatusCode::NOT_FOUND,
                TaskError::NotInitialized { .. }
                | TaskError::InvalidTransition { .. }
                | TaskError::InvalidState { .. }
                | TaskError::DuplicateTask(_) => StatusCode::CONFLICT,
                TaskError::Device(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::tasks::RunStatus;

    #[test]
    fn errors_map_to_status_codes() {
        let not_found: ApiError = ContainerError::NotFound("env_9".to_string()).into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let early: ApiError = TaskError::NotInitialized {
            run_id: Uuid::nil(),
            status: RunStatus::Initializing,
        }
        .into();
        assert_eq!(early.status_code(), StatusCode::CONFLICT);

        let runtime: ApiError = ContainerError::runtime("exec", "env_0", "daemon gone").into();
        assert_eq!(runtime.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(runtime.to_string().contains("daemon gone"));
    }
}
