use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Host, Multipart, Path, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::config::Settings;
use crate::history::{HistoryRecord, HistoryStore};
use crate::model::Detector;
use crate::users::CredentialStore;
use crate::utils::{file_name_of, secure_filename};

pub const STATUS_MESSAGE: &str = "Visual Anomaly Detection Backend Running";
pub const UNKNOWN_USER: &str = "unknown";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const MSG_NO_IMAGE: &str = "No image provided";
const MSG_EMPTY_FILENAME: &str = "Empty filename";
const MSG_INVALID_FILENAME: &str = "Invalid filename";
const MSG_SAMPLE_NOT_FOUND: &str = "Sample dataset not found";

pub struct AppState {
    pub settings: Settings,
    pub detector: Arc<dyn Detector>,
    pub history: Arc<dyn HistoryStore>,
    pub users: Arc<dyn CredentialStore>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors(&state.settings.cors_origins);
    let body_limit_bytes = state.settings.body_limit_bytes;
    let uploads = ServeDir::new(&state.settings.upload_dir);
    let results = ServeDir::new(&state.settings.result_dir);

    Router::new()
        .route("/", get(home))
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/predict", post(predict_handler))
        .route("/history/:username", get(history_handler))
        .route("/download-sample", get(download_sample_handler))
        .nest_service("/uploads", uploads)
        .nest_service("/results", results)
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn(predict_preflight))
        .layer(TraceLayer::new_for_http())
}

/// `*` (or no entry) mirrors the caller's origin so credentials stay allowed.
fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request());

    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(AllowOrigin::mirror_request());
    }
    let values: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    cors.allow_origin(AllowOrigin::list(values))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    /// Malformed or oversized multipart body; carries axum's status (400 or 413).
    Upload(StatusCode, String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Upload(status, message) => (status, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(err) => {
                error!("request failed: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ApiError::Internal(err.into())
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsPayload {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    result: String,
    anomaly_score: f64,
    outline_image: String,
    filled_image: String,
}

async fn home() -> Json<serde_json::Value> {
    Json(json!({ "message": STATUS_MESSAGE }))
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CredentialsPayload>,
) -> Json<serde_json::Value> {
    let (success, message) = state
        .users
        .register(payload.username.as_deref(), payload.password.as_deref())
        .await;
    Json(json!({ "success": success, "message": message }))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CredentialsPayload>,
) -> Json<serde_json::Value> {
    let (success, role) = state
        .users
        .authenticate(payload.username.as_deref(), payload.password.as_deref())
        .await;
    Json(json!({ "success": success, "role": role }))
}

fn upload_error(err: MultipartError) -> ApiError {
    ApiError::Upload(err.status(), err.body_text())
}

/// `OPTIONS /predict` answers `{"ok": true}`.
///
/// `CorsLayer` short-circuits every OPTIONS request with an empty body, so
/// this sits outside it and swaps in the JSON body while keeping the CORS
/// headers it produced.
async fn predict_preflight(request: Request<Body>, next: Next<Body>) -> Response {
    let is_preflight = request.method() == Method::OPTIONS && request.uri().path() == "/predict";
    let response = next.run(request).await;
    if !is_preflight || !response.status().is_success() {
        return response;
    }

    let (parts, _) = response.into_parts();
    let mut answer = Json(json!({ "ok": true })).into_response();
    for (name, value) in parts.headers.iter() {
        if *name == header::CONTENT_LENGTH || *name == header::CONTENT_TYPE {
            continue;
        }
        answer.headers_mut().append(name.clone(), value.clone());
    }
    answer
}

/// `<scheme>://<host>` as seen by the client.
fn base_url(headers: &HeaderMap, host: &str) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("http");
    format!("{scheme}://{}", host.trim_end_matches('/'))
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Host(host): Host,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    // A body that is not multipart carries no files at all.
    let Ok(mut multipart) = multipart else {
        return Err(ApiError::BadRequest(MSG_NO_IMAGE.into()));
    };
    let mut upload: Option<(String, Bytes)> = None;
    let mut username: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            // Parts without a filename are plain form values, not files.
            "image" if upload.is_none() => {
                let Some(file_name) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let data = field.bytes().await.map_err(upload_error)?;
                upload = Some((file_name, data));
            }
            "username" if username.is_none() && field.file_name().is_none() => {
                let value = field.text().await.map_err(upload_error)?;
                username = Some(value);
            }
            _ => {}
        }
    }

    let Some((raw_name, data)) = upload else {
        return Err(ApiError::BadRequest(MSG_NO_IMAGE.into()));
    };
    let username = username.unwrap_or_else(|| UNKNOWN_USER.to_string());

    if raw_name.is_empty() {
        return Err(ApiError::BadRequest(MSG_EMPTY_FILENAME.into()));
    }
    let filename = secure_filename(&raw_name);
    if filename.is_empty() {
        return Err(ApiError::BadRequest(MSG_INVALID_FILENAME.into()));
    }

    let image_path = state.settings.upload_dir.join(&filename);
    tokio::fs::write(&image_path, &data).await?;

    let detector = state.detector.clone();
    let detect_path = image_path.clone();
    let detection = tokio::task::spawn_blocking(move || detector.detect(&detect_path)).await??;

    let timestamp = Local::now().format(TIME_FORMAT).to_string();
    let base_url = base_url(&headers, &host);
    let outline_url = format!(
        "{base_url}/results/{}",
        file_name_of(&detection.outline_image)
    );
    let filled_url = format!(
        "{base_url}/results/{}",
        file_name_of(&detection.filled_image)
    );

    state
        .history
        .append(HistoryRecord {
            username: username.clone(),
            image: format!("{base_url}/uploads/{filename}"),
            result: detection.label.clone(),
            score: detection.score,
            time: timestamp,
            outline_image: outline_url.clone(),
            filled_image: filled_url.clone(),
        })
        .await?;

    info!(
        username = %username,
        file = %filename,
        label = %detection.label,
        score = detection.score,
        "prediction stored"
    );

    Ok(Json(PredictResponse {
        result: detection.label,
        anomaly_score: detection.score,
        outline_image: outline_url,
        filled_image: filled_url,
    }))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    Ok(Json(state.history.for_user(&username).await?))
}

async fn download_sample_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let path = &state.settings.sample_path;
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(MSG_SAMPLE_NOT_FOUND.into()));
        }
        Err(err) => return Err(err.into()),
    };

    let file_name = file_name_of(path);
    let content_type = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("zip") => "application/zip",
        _ => "application/octet-stream",
    };
    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        ),
    ];
    Ok((headers, data).into_response())
}
