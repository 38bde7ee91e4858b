use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Host, Multipart, Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use serde::Serialize;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::{
    config::Config,
    error::AppError,
    model::{self, serialize_ordered, LazyModel, PredictionResult},
    report::{self, ReportData, PLACEHOLDER_LAYER_THICKNESS, SHARED_OVERLAY},
    storage,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub model: Arc<LazyModel>,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/upload", post(upload))
        .route("/predict/:image_id", get(predict))
        .route("/mask/:image_id", get(mask))
        .route("/report/:image_id", get(report))
        .nest_service("/results", ServeDir::new(&state.config.results_dir))
        .layer(DefaultBodyLimit::max(state.config.body_limit_bytes))
        .layer(TraceLayer::new_for_http());

    if state.config.cors_allow_all {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

#[derive(Serialize)]
struct IndexResponse {
    status: &'static str,
    message: &'static str,
    version: &'static str,
    timestamp: String,
}

async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        status: "success",
        message: "OCT-AI API is running!",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    })
}

#[derive(Serialize)]
struct UploadResponse {
    status: &'static str,
    image_id: String,
    message: &'static str,
}

/// Bodies over the configured limit surface here as a length-limit error mid-stream.
fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge("File exceeds the upload size limit.".to_string())
    } else {
        AppError::BadRequest(err.body_text())
    }
}

async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let no_file = || AppError::BadRequest("No file provided.".to_string());

    let mut multipart = multipart.map_err(|_| no_file())?;
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        if field.name() != Some("image") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(multipart_error)?;
        upload = Some((filename, data));
        break;
    }

    let (filename, data) = upload.ok_or_else(no_file)?;
    if filename.is_empty() {
        return Err(no_file());
    }
    if !storage::is_allowed_file(&filename, state.config.allowed_extensions.as_slice()) {
        return Err(AppError::BadRequest("Unsupported file type.".to_string()));
    }

    let image_id = storage::generate_image_id();
    let path = storage::save_upload(&state.config.upload_dir, &image_id, &filename, &data).await?;
    tracing::info!(%image_id, path = %path.display(), bytes = data.len(), "image uploaded");

    Ok(Json(UploadResponse {
        status: "success",
        image_id,
        message: "Image uploaded successfully.",
    }))
}

async fn locate_image(state: &AppState, image_id: &str) -> Result<PathBuf, AppError> {
    let not_found = || AppError::NotFound("Image not found.".to_string());
    if !storage::is_valid_image_id(image_id) {
        return Err(not_found());
    }
    storage::find_image_path_by_id(image_id, &state.config.upload_dir)
        .await?
        .ok_or_else(not_found)
}

async fn run_inference(state: &AppState, image_path: PathBuf) -> Result<PredictionResult, AppError> {
    let classifier = state.model.get().await?;
    let class_names = state.config.class_names.clone();
    let result = tokio::task::spawn_blocking(move || {
        model::predict(classifier.as_ref(), &image_path, &class_names)
    })
    .await??;
    Ok(result)
}

#[derive(Serialize)]
struct PredictResponse {
    image_id: String,
    #[serde(serialize_with = "serialize_ordered")]
    predictions: Vec<(String, f32)>,
    top_disease: String,
    confidence: f32,
    summary: String,
    recommendation: String,
}

async fn predict(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Json<PredictResponse>, AppError> {
    let image_path = locate_image(&state, &image_id).await?;
    let result = run_inference(&state, image_path).await?;
    let assessment = report::assess(&result);

    tracing::info!(
        %image_id,
        top_disease = %result.top_disease,
        confidence = result.confidence,
        "prediction served"
    );

    Ok(Json(PredictResponse {
        image_id,
        predictions: result.predictions,
        top_disease: result.top_disease,
        confidence: result.confidence,
        summary: assessment.summary,
        recommendation: assessment.recommendation,
    }))
}

#[derive(Serialize)]
struct MaskResponse {
    image_id: String,
    overlay_mask_url: String,
    #[serde(serialize_with = "serialize_ordered")]
    retinal_layer_thickness: Vec<(String, f32)>,
    notes: &'static str,
}

/// Base URL for absolute links: the configured override, else the request's own host.
fn public_base_url(config: &Config, host: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(base) = &config.server_base_url {
        return base.trim_end_matches('/').to_string();
    }
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = host.unwrap_or("localhost");
    format!("{scheme}://{}", host.trim_end_matches('/'))
}

/// Demonstration payload only: no segmentation runs, every scan gets the same overlay and figures.
async fn mask(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    host: Option<Host>,
    headers: HeaderMap,
) -> Json<MaskResponse> {
    let host = host.map(|Host(host)| host);
    let base = public_base_url(&state.config, host.as_deref(), &headers);
    Json(MaskResponse {
        image_id,
        overlay_mask_url: format!("{base}/results/{SHARED_OVERLAY}"),
        retinal_layer_thickness: PLACEHOLDER_LAYER_THICKNESS
            .iter()
            .map(|(layer, value)| (layer.to_lowercase(), *value))
            .collect(),
        notes: "RNFL thinning detected, consistent with glaucoma risk.",
    })
}

async fn report(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Response, AppError> {
    let image_path = locate_image(&state, &image_id).await?;
    let result = run_inference(&state, image_path.clone()).await?;

    let config = state.config.clone();
    let id = image_id.clone();
    let bytes = tokio::task::spawn_blocking(move || {
        let overlay = report::locate_overlay(&config.results_dir, &id);
        let data = ReportData {
            image_id: &id,
            image_path: &image_path,
            overlay_path: overlay.as_deref(),
            prediction: &result,
            layer_thickness: &PLACEHOLDER_LAYER_THICKNESS,
            generated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        report::generate_report(&config.reports_dir, &data)
    })
    .await??;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=report_{image_id}.pdf"),
            ),
        ],
        bytes,
    )
        .into_response())
}
