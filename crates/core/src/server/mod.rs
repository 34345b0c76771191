use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::algorithms::{
    AlgorithmId, AlgorithmParams, AlgorithmRegistry, DownloadFormat, RESULT_DATASET,
};
use crate::config::AppConfig;
use crate::job::{JobRecord, JobStatus, JobUpdate, ABORTED_BY_USER};
use crate::queue::{TaskMessage, TaskQueue};
use crate::results::{
    batch_dims, ensure_result_shape, extract_slice, extract_volume, resolve_batch_indices,
    window_stats, Orientation, ResultArray,
};
use crate::store::JobStore;

const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;
const DEFAULT_INPUT_FILENAME: &str = "upload.bin";
const DEFAULT_PULSEQ_FILENAME: &str = "trajectory.seq";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: JobStore,
    queue: TaskQueue,
    algorithms: AlgorithmRegistry,
    config: AppConfig,
}

impl AppState {
    pub fn new(
        store: JobStore,
        queue: TaskQueue,
        algorithms: AlgorithmRegistry,
        config: AppConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                store,
                queue,
                algorithms,
                config,
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn algorithms(&self) -> &AlgorithmRegistry {
        &self.inner.algorithms
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct AlgorithmInfo {
    pub id: AlgorithmId,
    pub name: String,
    pub description: String,
    pub default_params: AlgorithmParams,
}

#[derive(Serialize)]
pub struct AlgorithmsResponse {
    pub algorithms: Vec<AlgorithmInfo>,
}

#[derive(Serialize)]
pub struct CreateJobResponse {
    pub job: JobRecord,
}

#[derive(Serialize)]
pub struct JobsListResponse {
    pub jobs: Vec<JobRecord>,
}

#[derive(Serialize)]
pub struct WindowStatsResponse {
    pub p01: f64,
    pub p99: f64,
}

#[derive(Deserialize)]
pub struct BatchQuery {
    pub batch: Option<String>,
}

#[derive(Deserialize)]
pub struct SliceQuery {
    pub orientation: String,
    pub index: i64,
    pub batch: Option<String>,
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub format: Option<String>,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/algorithms", get(list_algorithms))
        .route("/api/jobs", post(create_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job_detail).delete(delete_job))
        .route("/api/jobs/{id}/volume", get(get_job_volume))
        .route("/api/jobs/{id}/slice", get(get_job_slice))
        .route("/api/jobs/{id}/window-stats", get(get_window_stats))
        .route("/api/jobs/{id}/abort", post(abort_job))
        .route("/api/jobs/{id}/download", get(download_job_result))
        .route("/api/jobs/{id}/input", get(download_job_input))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn list_algorithms(State(state): State<AppState>) -> Json<AlgorithmsResponse> {
    let algorithms = state
        .algorithms()
        .list()
        .map(|algorithm| AlgorithmInfo {
            id: algorithm.id(),
            name: algorithm.name().to_string(),
            description: algorithm.description().to_string(),
            default_params: algorithm.default_params(),
        })
        .collect();
    Json(AlgorithmsResponse { algorithms })
}

async fn create_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut pulseq_upload: Option<(String, Vec<u8>)> = None;
    let mut name: Option<String> = None;
    let mut algorithm: Option<AlgorithmId> = None;
    let mut raw_params: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(format!("invalid multipart body: {err}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(ToString::to_string);
        match field_name.as_str() {
            "file" => {
                let filename = sanitize_filename(file_name.as_deref(), DEFAULT_INPUT_FILENAME);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::BadRequest(format!("failed to read upload: {err}")))?;
                upload = Some((filename, bytes.to_vec()));
            }
            "pulseq_file" => {
                let filename = sanitize_filename(file_name.as_deref(), DEFAULT_PULSEQ_FILENAME);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::BadRequest(format!("failed to read upload: {err}")))?;
                pulseq_upload = Some((filename, bytes.to_vec()));
            }
            "name" => {
                name = Some(field.text().await.map_err(|err| {
                    AppError::BadRequest(format!("failed to read name field: {err}"))
                })?);
            }
            "algorithm" => {
                let raw = field.text().await.map_err(|err| {
                    AppError::BadRequest(format!("failed to read algorithm field: {err}"))
                })?;
                algorithm =
                    Some(raw.parse().map_err(
                        |err: crate::algorithms::UnknownAlgorithmError| {
                            AppError::BadRequest(err.to_string())
                        },
                    )?);
            }
            "params" => {
                raw_params = Some(field.text().await.map_err(|err| {
                    AppError::BadRequest(format!("failed to read params field: {err}"))
                })?);
            }
            _ => {}
        }
    }

    let (input_filename, input_bytes) =
        upload.ok_or_else(|| AppError::BadRequest("file field is required".to_string()))?;
    let algorithm = algorithm.unwrap_or(AlgorithmId::DirectReconstruction);

    let mut params_object = match raw_params.as_deref().map(str::trim) {
        None | Some("") => serde_json::Map::new(),
        Some(raw) => {
            let parsed: serde_json::Value = serde_json::from_str(raw)
                .map_err(|_| AppError::BadRequest("invalid params".to_string()))?;
            match parsed {
                serde_json::Value::Object(map) => map,
                _ => return Err(AppError::BadRequest("params must be an object".to_string())),
            }
        }
    };
    params_object
        .entry("algorithm".to_string())
        .or_insert_with(|| serde_json::Value::String(algorithm.as_str().to_string()));
    if let Some((pulseq_filename, _)) = &pulseq_upload {
        params_object.insert(
            "pulseq_filename".to_string(),
            serde_json::Value::String(pulseq_filename.clone()),
        );
    }

    let params: AlgorithmParams =
        serde_json::from_value(serde_json::Value::Object(params_object))
            .map_err(|err| AppError::BadRequest(format!("invalid params: {err}")))?;
    if params.algorithm() != algorithm {
        return Err(AppError::BadRequest("algorithm mismatch".to_string()));
    }
    params
        .validate()
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    let store = state.store();
    store.ensure_io_directories()?;

    let job_id = Uuid::new_v4().to_string();
    let input_path = store.input_path(&job_id, &input_filename);
    std::fs::write(&input_path, &input_bytes).map_err(|err| {
        AppError::Internal(format!("failed to store upload {}: {err}", input_path.display()))
    })?;
    if let Some((pulseq_filename, pulseq_bytes)) = &pulseq_upload {
        let pulseq_path = store.input_path(&job_id, pulseq_filename);
        std::fs::write(&pulseq_path, pulseq_bytes).map_err(|err| {
            AppError::Internal(format!(
                "failed to store trajectory upload {}: {err}",
                pulseq_path.display()
            ))
        })?;
    }

    let job_name = name
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| {
            std::path::Path::new(&input_filename)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| input_filename.clone())
        });

    let job = JobRecord {
        id: job_id.clone(),
        name: job_name,
        status: JobStatus::Queued,
        algorithm,
        params: params.clone(),
        result_shape: None,
        result_dataset: RESULT_DATASET.to_string(),
        available_formats: vec![DownloadFormat::Npy, DownloadFormat::Raw],
        created_at: Utc::now(),
        input_filename,
        input_available: true,
        result_available: false,
        log_messages: Vec::new(),
        error: None,
        queue_task_id: None,
        cancel_requested: false,
    };
    store.save(&job)?;

    let task_id = state.queue().enqueue(&TaskMessage {
        job_id: job_id.clone(),
        algorithm,
        input_path,
        output_path: store.result_path(&job_id),
        params,
    })?;
    store.update(
        &job_id,
        JobUpdate {
            queue_task_id: Some(task_id),
            ..Default::default()
        },
    )?;

    info!(job_id = %job_id, algorithm = %algorithm, "Job created");

    let job = store.annotate_availability(store.load(&job_id)?);
    Ok((StatusCode::CREATED, Json(CreateJobResponse { job })))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<JobsListResponse>, AppError> {
    let store = state.store();
    let mut jobs = Vec::new();
    for job in store.list_all()? {
        let job = store.reconcile_revoked(job, state.queue())?;
        jobs.push(store.annotate_availability(job));
    }
    Ok(Json(JobsListResponse { jobs }))
}

async fn get_job_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    let store = state.store();
    let mut job = load_job_or_404(&state, &id)?;
    job = store.reconcile_revoked(job, state.queue())?;

    if job.status == JobStatus::Finished {
        let result_path = store.result_path(&id);
        if result_path.exists() {
            match ResultArray::open(&result_path) {
                Ok(array) => job = ensure_result_shape(store, job, &array)?,
                Err(err) => {
                    warn!(job_id = %id, error = %err, "Failed to read result for shape repair")
                }
            }
        }
    }

    Ok(Json(store.annotate_availability(job)))
}

async fn get_job_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BatchQuery>,
) -> Result<(HeaderMap, Vec<u8>), AppError> {
    let (_, array) = load_finished_result(&state, &id)?;
    let view = array.view()?;

    let dims = batch_dims(&view);
    let batch = resolve_batch_indices(query.batch.as_deref(), &dims)
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    let (shape, bytes) = extract_volume(view, &batch);

    let mut headers = octet_stream_headers();
    insert_header(&mut headers, "x-volume-shape", &join_usizes(&shape))?;
    insert_header(&mut headers, "x-dtype", "float32")?;
    insert_header(&mut headers, "x-order", "C")?;
    insert_header(&mut headers, "x-batch-index", &join_usizes(&batch))?;
    Ok((headers, bytes))
}

async fn get_job_slice(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SliceQuery>,
) -> Result<(HeaderMap, Vec<u8>), AppError> {
    let orientation: Orientation = query
        .orientation
        .parse()
        .map_err(|err: crate::results::InvalidOrientationError| {
            AppError::BadRequest(err.to_string())
        })?;

    let (_, array) = load_finished_result(&state, &id)?;
    let view = array.view()?;

    let dims = batch_dims(&view);
    let batch = resolve_batch_indices(query.batch.as_deref(), &dims)
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    let (shape, bytes) = extract_slice(view, orientation, query.index, &batch)
        .map_err(|err| AppError::BadRequest(err.to_string()))?;

    let mut headers = octet_stream_headers();
    insert_header(&mut headers, "x-slice-shape", &join_usizes(&shape))?;
    insert_header(&mut headers, "x-dtype", "float32")?;
    insert_header(&mut headers, "x-order", "C")?;
    insert_header(&mut headers, "x-batch-index", &join_usizes(&batch))?;
    insert_header(&mut headers, "x-orientation", orientation.as_str())?;
    insert_header(&mut headers, "x-slice-index", &query.index.to_string())?;
    Ok((headers, bytes))
}

async fn get_window_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<WindowStatsResponse>, AppError> {
    let (_, array) = load_finished_result(&state, &id)?;
    let view = array.view()?;

    let dims = batch_dims(&view);
    let batch = resolve_batch_indices(query.batch.as_deref(), &dims)
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    let (p01, p99) = window_stats(view, &batch);
    Ok(Json(WindowStatsResponse { p01, p99 }))
}

async fn abort_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    let store = state.store();
    let mut job = load_job_or_404(&state, &id)?;
    job = store.reconcile_revoked(job, state.queue())?;

    if job.status.is_terminal() {
        // A repeated abort of an already-aborted job is idempotent; every
        // other terminal state is a conflict.
        if job.status == JobStatus::Canceled && job.cancel_requested {
            return Ok(Json(store.annotate_availability(job)));
        }
        return Err(AppError::Conflict("job is not abortable".to_string()));
    }

    if let Some(task_id) = &job.queue_task_id {
        state.queue().revoke_by_id(task_id)?;
    }

    // A queued job cancels immediately; a started job keeps running and the
    // runner resolves the flag to stopped at its completion checkpoint.
    let next_status = if job.status == JobStatus::Queued {
        JobStatus::Canceled
    } else {
        job.status
    };
    store.update(
        &id,
        JobUpdate {
            status: Some(next_status),
            error: Some(Some(ABORTED_BY_USER.to_string())),
            cancel_requested: Some(true),
            ..Default::default()
        },
    )?;

    info!(job_id = %id, "Abort requested");
    Ok(Json(store.annotate_availability(store.load(&id)?)))
}

async fn download_job_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<(HeaderMap, Vec<u8>), AppError> {
    let format: DownloadFormat = query
        .format
        .as_deref()
        .unwrap_or("npy")
        .parse()
        .map_err(|_| AppError::BadRequest("unsupported download format".to_string()))?;

    let (job, array) = load_finished_result(&state, &id)?;

    let (filename, bytes) = match format {
        DownloadFormat::Npy => {
            let result_path = state.store().result_path(&id);
            let bytes = std::fs::read(&result_path).map_err(|err| {
                AppError::Internal(format!(
                    "failed to read result file {}: {err}",
                    result_path.display()
                ))
            })?;
            (format!("{}.npy", job.name), bytes)
        }
        DownloadFormat::Raw => {
            let view = array.view()?;
            let (_, bytes) = extract_volume(view, &[]);
            (format!("{}.f32", job.name), bytes)
        }
    };

    let mut headers = octet_stream_headers();
    insert_header(
        &mut headers,
        "content-disposition",
        &format!("attachment; filename=\"{filename}\""),
    )?;
    Ok((headers, bytes))
}

async fn download_job_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(HeaderMap, Vec<u8>), AppError> {
    let job = load_job_or_404(&state, &id)?;
    let input_path = state.store().input_path(&id, &job.input_filename);
    if !input_path.exists() {
        return Err(AppError::NotFound("input missing".to_string()));
    }

    let bytes = std::fs::read(&input_path).map_err(|err| {
        AppError::Internal(format!(
            "failed to read input file {}: {err}",
            input_path.display()
        ))
    })?;

    let mut headers = octet_stream_headers();
    insert_header(
        &mut headers,
        "content-disposition",
        &format!("attachment; filename=\"{}\"", job.input_filename),
    )?;
    Ok((headers, bytes))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let store = state.store();
    let mut job = load_job_or_404(&state, &id)?;
    job = store.reconcile_revoked(job, state.queue())?;

    if !job.status.is_terminal() {
        return Err(AppError::Conflict("job is not deletable".to_string()));
    }

    store.delete(&id)?;
    info!(job_id = %id, "Job deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn load_job_or_404(state: &AppState, job_id: &str) -> Result<JobRecord, AppError> {
    let store = state.store();
    if !store.exists(job_id) {
        return Err(AppError::NotFound("job not found".to_string()));
    }
    Ok(store.load(job_id)?)
}

/// Load a job for result access: 404 when the job or its result file is
/// missing, 409 when the job exists but has not finished. Repairs missing
/// shape metadata on the way through.
fn load_finished_result(
    state: &AppState,
    job_id: &str,
) -> Result<(JobRecord, ResultArray), AppError> {
    let store = state.store();
    let job = load_job_or_404(state, job_id)?;
    if job.status != JobStatus::Finished {
        return Err(AppError::Conflict("job not finished".to_string()));
    }

    let result_path = store.result_path(job_id);
    if !result_path.exists() {
        return Err(AppError::NotFound("result missing".to_string()));
    }

    let array = ResultArray::open(&result_path)
        .map_err(|err| AppError::Internal(format!("failed to load result: {err:#}")))?;
    let job = ensure_result_shape(store, job, &array)?;
    Ok((job, array))
}

fn sanitize_filename(raw: Option<&str>, fallback: &str) -> String {
    raw.and_then(|name| {
        std::path::Path::new(name)
            .file_name()
            .map(|bare| bare.to_string_lossy().to_string())
    })
    .filter(|name| !name.is_empty())
    .unwrap_or_else(|| fallback.to_string())
}

fn octet_stream_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), AppError> {
    let value = HeaderValue::from_str(value)
        .map_err(|err| AppError::Internal(format!("invalid header value for {name}: {err}")))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

fn join_usizes(values: &[usize]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Construct the fully wired application state from configuration, resolving
/// relative storage paths against the data directory.
pub fn app_state_with_config(config: AppConfig, data_dir: PathBuf) -> anyhow::Result<AppState> {
    let results_dir = crate::config::resolve_relative_to(&data_dir, &config.storage.results_dir);
    let inputs_dir = crate::config::resolve_relative_to(&data_dir, &config.storage.inputs_dir);
    let queue_db = crate::config::resolve_relative_to(&data_dir, &config.queue.db_path);

    let store = JobStore::new(results_dir, inputs_dir);
    store.ensure_io_directories()?;
    let queue = TaskQueue::with_name(&config.queue.name, queue_db)?;
    let algorithms = AlgorithmRegistry::with_builtin();

    Ok(AppState::new(store, queue, algorithms, config))
}
