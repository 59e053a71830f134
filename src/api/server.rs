use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

use super::types::{
    AnswerRequest, ApiError, ApiResult, ApiServer, AppState, CreateRunRequest, LaunchRequest,
    RemovedResponse, RestartResponse, SmsRequest,
};

impl ApiServer {
    pub fn new(state: AppState, host: &str, port: u16) -> Self {
        Self {
            state,
            host: host.to_string(),
            port,
        }
    }

    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(ApiServer::health))
            .route(
                "/containers",
                get(ApiServer::list_containers).post(ApiServer::launch_containers),
            )
            .route(
                "/containers/{name}",
                get(ApiServer::get_container).delete(ApiServer::remove_container),
            )
            .route("/containers/{name}/restart", post(ApiServer::restart_container))
            .route("/prerequisites", get(ApiServer::prerequisites))
            .route("/tasks", get(ApiServer::list_tasks))
            .route("/runs", get(ApiServer::list_runs).post(ApiServer::create_run))
            .route("/runs/{id}", get(ApiServer::get_run).delete(ApiServer::discard_run))
            .route("/runs/{id}/answer", post(ApiServer::set_answer))
            .route("/runs/{id}/sms", post(ApiServer::simulate_sms))
            .route("/runs/{id}/evaluate", post(ApiServer::evaluate))
            .route("/runs/{id}/teardown", post(ApiServer::tear_down))
            .with_state(state)
    }

    async fn health() -> impl IntoResponse {
        Json(json!({ "ok": true }))
    }

    async fn list_containers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
        Ok(Json(state.manager.list_containers().await?))
    }

    async fn launch_containers(
        State(state): State<AppState>,
        Json(request): Json<LaunchRequest>,
    ) -> ApiResult<impl IntoResponse> {
        if request.count == 0 {
            return Err(ApiError::InvalidInput("count must be at least 1".to_string()));
        }
        let image = request.image.as_deref();
        let outcomes = if request.wait_ready {
            state
                .manager
                .launch_and_wait(request.count, request.start_index, image)
                .await?
        } else {
            state
                .manager
                .launch_containers(request.count, request.start_index, image)
                .await?
        };
        Ok((StatusCode::CREATED, Json(outcomes)))
    }

    async fn get_container(
        State(state): State<AppState>,
        Path(name): Path<String>,
    ) -> ApiResult<impl IntoResponse> {
        let name = state.manager.resolve_container_name(&name).await?;
        match state.manager.get_container_info(&name).await? {
            Some(info) => Ok(Json(info)),
            None => Err(crate::containers::ContainerError::NotFound(name).into()),
        }
    }

    async fn remove_container(
        State(state): State<AppState>,
        Path(name): Path<String>,
    ) -> ApiResult<impl IntoResponse> {
        let name = match state.manager.resolve_container_name(&name).await {
            Ok(name) => name,
            // removal of an unknown container is a no-op
            Err(crate::containers::ContainerError::NotFound(_)) => name,
            Err(e) => return Err(e.into()),
        };
        let existed = state.manager.remove_container(&name).await?;
        let discarded_runs = state.runtime.discard_runs_for_device(&name).await;
        Ok(Json(RemovedResponse {
            name,
            existed,
            discarded_runs,
        }))
    }

    async fn restart_container(
        State(state): State<AppState>,
        Path(name): Path<String>,
    ) -> ApiResult<impl IntoResponse> {
        let name = state.manager.resolve_container_name(&name).await?;
        let restarted = state.manager.restart_server_in_container(&name).await;
        Ok(Json(RestartResponse { name, restarted }))
    }

    async fn prerequisites(State(state): State<AppState>) -> impl IntoResponse {
        Json(state.manager.check_prerequisites().await)
    }

    async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
        Json(state.runtime.registry().describe())
    }

    async fn list_runs(State(state): State<AppState>) -> impl IntoResponse {
        Json(state.runtime.list_runs().await)
    }

    /// Starts a run on a container and initializes it. A failed
    /// initialization still answers 201 with the torn down run.
    async fn create_run(
        State(state): State<AppState>,
        Json(request): Json<CreateRunRequest>,
    ) -> ApiResult<impl IntoResponse> {
        let name = state
            .manager
            .resolve_container_name(&request.container)
            .await?;
        let serial = state.manager.adb_serial(&name).await?;
        let device = (state.devices)(&serial);

        let run_id = state
            .runtime
            .start_run(&request.task_name, &name, device)
            .await?;
        let snapshot = state.runtime.initialize(run_id).await?;
        Ok((StatusCode::CREATED, Json(snapshot)))
    }

    async fn get_run(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
    ) -> ApiResult<impl IntoResponse> {
        Ok(Json(state.runtime.snapshot(id).await?))
    }

    async fn discard_run(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
    ) -> ApiResult<impl IntoResponse> {
        Ok(Json(state.runtime.discard_run(id).await?))
    }

    async fn set_answer(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
        Json(request): Json<AnswerRequest>,
    ) -> ApiResult<impl IntoResponse> {
        state.runtime.set_answer(id, request.text).await?;
        Ok(Json(state.runtime.snapshot(id).await?))
    }

    async fn simulate_sms(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
        Json(request): Json<SmsRequest>,
    ) -> ApiResult<impl IntoResponse> {
        Ok(Json(
            state
                .runtime
                .simulate_sms(id, &request.sender, &request.message)
                .await?,
        ))
    }

    async fn evaluate(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
    ) -> ApiResult<impl IntoResponse> {
        Ok(Json(state.runtime.evaluate(id).await?))
    }

    async fn tear_down(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
    ) -> ApiResult<impl IntoResponse> {
        Ok(Json(state.runtime.tear_down(id).await?))
    }

    pub async fn start_server(self) -> std::io::Result<()> {
        let address = format!("{}:{}", self.host, self.port);
        let app = Self::router(self.state);

        let listener = TcpListener::bind(&address).await?;
        tracing::info!(%address, "api listening");
        axum::serve(listener, app).await
    }
}
