use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::model_id::ModelId;
use crate::model_store::ModelStore;
use crate::translate::Translator;

/// Uploaded images larger than this are rejected before decoding.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    translator: Translator,
}

impl AppState {
    pub fn new(store: Arc<ModelStore>, resolution: u32) -> Self {
        Self {
            translator: Translator::new(store, resolution),
        }
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: ModelId,
    pub weights_file: String,
    pub available: bool,
    pub loaded: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/models/{id}/load", post(load_model))
        .route("/api/translate/{id}", post(translate_image))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

pub fn model_entries(store: &ModelStore) -> Vec<ModelEntry> {
    ModelId::ALL
        .into_iter()
        .map(|id| ModelEntry {
            id,
            weights_file: id.weights_file_name(),
            available: store.is_available(id),
            loaded: store.is_loaded(id),
        })
        .collect()
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    Json(model_entries(state.translator.store()))
}

async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let model: ModelId = id.parse()?;
    let translator = state.translator.clone();

    tokio::task::spawn_blocking(move || translator.store().get_model(model).map(|_| ()))
        .await
        .map_err(|e| AppError::Internal(format!("task join error: {e}")))??;

    info!(model = %model, "Model warmed via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn translate_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let model: ModelId = id.parse()?;
    if body.is_empty() {
        return Err(AppError::BadRequest("request body is empty".to_string()));
    }

    let translator = state.translator.clone();
    let png = tokio::task::spawn_blocking(move || translator.translate_bytes(model, &body))
        .await
        .map_err(|e| AppError::Internal(format!("task join error: {e}")))??;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::UnknownModel(_) => AppError::NotFound(message),
            Error::Decode(_) => AppError::BadRequest(message),
            Error::Load { .. } => {
                warn!(error = %message, "Model load failed");
                AppError::Unprocessable(message)
            }
            Error::Shape(_)
            | Error::Forward(_)
            | Error::Encode(_)
            | Error::Video(_)
            | Error::OutOfRange { .. } => AppError::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_image, encode_png};
    use crate::error::Result;
    use crate::generator::Generator;
    use crate::model_store::GeneratorLoader;
    use axum::body::Body;
    use axum::http::Request;
    use image::{Rgb, RgbImage};
    use ndarray::Array4;
    use std::sync::{mpsc, Mutex};
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    struct Negate;

    impl Generator for Negate {
        fn forward(&self, input: Array4<f32>) -> Result<Array4<f32>> {
            Ok(input.mapv(|v| -v))
        }
    }

    struct Exploding;

    impl Generator for Exploding {
        fn forward(&self, _input: Array4<f32>) -> Result<Array4<f32>> {
            Err(Error::Forward("out of device memory".into()))
        }
    }

    /// CycleGAN works, DualGAN fails at forward time, everything else has no weights.
    struct StubLoader;

    impl GeneratorLoader for StubLoader {
        fn load(&self, model: ModelId) -> Result<Arc<dyn Generator>> {
            match model {
                ModelId::CycleGan => Ok(Arc::new(Negate)),
                ModelId::DualGan => Ok(Arc::new(Exploding)),
                other => Err(Error::Load {
                    model: other.to_string(),
                    reason: format!("{} not found", other.weights_file_name()),
                }),
            }
        }

        fn is_available(&self, model: ModelId) -> bool {
            matches!(model, ModelId::CycleGan | ModelId::DualGan)
        }
    }

    /// Holds every load open until `release` fires, announcing entry first.
    struct GatedLoader {
        entered: Mutex<mpsc::Sender<ModelId>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl GeneratorLoader for GatedLoader {
        fn load(&self, model: ModelId) -> Result<Arc<dyn Generator>> {
            self.entered.lock().unwrap().send(model).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(Arc::new(Negate))
        }

        fn is_available(&self, _model: ModelId) -> bool {
            true
        }
    }

    fn test_state() -> AppState {
        AppState::new(Arc::new(ModelStore::new(StubLoader)), 128)
    }

    fn png_fixture() -> Vec<u8> {
        encode_png(&RgbImage::from_pixel(96, 64, Rgb([20, 30, 40]))).unwrap()
    }

    async fn send(state: &AppState, req: Request<Body>) -> Response {
        app_router(state.clone()).oneshot(req).await.unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();

        let resp = send(&test_state(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_list_models_reports_availability_and_cache() {
        let state = test_state();
        state.translator().store().get_model(ModelId::CycleGan).unwrap();

        let req = Request::builder()
            .uri("/api/models")
            .body(Body::empty())
            .unwrap();
        let resp = send(&state, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = json_body(resp).await;
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), ModelId::ALL.len());
        assert_eq!(entries[0]["id"], "CycleGAN");
        assert_eq!(entries[0]["weights_file"], "CycleGAN.safetensors");
        assert_eq!(entries[0]["available"], true);
        assert_eq!(entries[0]["loaded"], true);
        assert_eq!(entries[1]["id"], "DiscoGAN");
        assert_eq!(entries[1]["available"], false);
        assert_eq!(entries[1]["loaded"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_list_models_answers_while_a_model_is_loading() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let state = AppState::new(
            Arc::new(ModelStore::new(GatedLoader {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            })),
            128,
        );

        let warming = {
            let state = state.clone();
            tokio::spawn(async move {
                send(&state, post("/api/models/CycleGAN/load", Body::empty()))
                    .await
                    .status()
            })
        };
        assert_eq!(entered_rx.recv().unwrap(), ModelId::CycleGan);

        // unblocks the load even if the listing below hangs
        let backstop = release_tx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(3));
            let _ = backstop.send(());
        });

        let started = Instant::now();
        let req = Request::builder()
            .uri("/api/models")
            .body(Body::empty())
            .unwrap();
        let resp = send(&state, req).await;
        let elapsed = started.elapsed();

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(elapsed < Duration::from_millis(500), "listing took {elapsed:?}");
        let json = json_body(resp).await;
        assert_eq!(json[0]["id"], "CycleGAN");
        assert_eq!(json[0]["loaded"], false);

        release_tx.send(()).unwrap();
        assert_eq!(warming.await.unwrap(), StatusCode::NO_CONTENT);
        assert!(state.translator().store().is_loaded(ModelId::CycleGan));
    }

    #[tokio::test]
    async fn test_load_model_warms_cache() {
        let state = test_state();
        let resp = send(&state, post("/api/models/cyclegan/load", Body::empty())).await;

        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.translator().store().is_loaded(ModelId::CycleGan));
    }

    #[tokio::test]
    async fn test_load_model_without_weights_is_unprocessable() {
        let state = test_state();
        let resp = send(&state, post("/api/models/ToDayGAN/load", Body::empty())).await;

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = json_body(resp).await;
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("ToDayGAN.safetensors not found"));
        assert!(!state.translator().store().is_loaded(ModelId::ToDayGan));
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_found() {
        let state = test_state();

        let resp = send(&state, post("/api/models/StyleGAN/load", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&state, post("/api/translate/StyleGAN", png_fixture())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = json_body(resp).await;
        assert!(json["error"].as_str().unwrap().contains("StyleGAN"));
    }

    #[tokio::test]
    async fn test_translate_returns_png_at_generator_resolution() {
        let resp = send(&test_state(), post("/api/translate/CycleGAN", png_fixture())).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let image = decode_image(&body).unwrap();
        assert_eq!(image.dimensions(), (128, 128));
    }

    #[tokio::test]
    async fn test_translate_rejects_undecodable_body() {
        let resp = send(&test_state(), post("/api/translate/CycleGAN", "not an image")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(&test_state(), post("/api/translate/CycleGAN", Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "request body is empty");
    }

    #[tokio::test]
    async fn test_forward_failure_is_internal_error() {
        let resp = send(&test_state(), post("/api/translate/DualGAN", png_fixture())).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(resp).await;
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("out of device memory"));
    }

    #[tokio::test]
    async fn test_unknown_api_route() {
        let req = Request::builder()
            .uri("/api/jobs")
            .body(Body::empty())
            .unwrap();
        let resp = send(&test_state(), req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"], "api endpoint not found: /api/jobs");
    }
}
