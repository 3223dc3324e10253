//! HTTP surface of the image derivative server.
//!
//! The router dispatches upload, fetch, delete and health; the fetch path
//! drives the core: serve-cached, coalesce onto an existing build,
//! enqueue a new build, or reject.

use axum::body::Body;
use axum::error_handling::HandleErrorLayer;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use rand::Rng;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::catch_panic::CatchPanicLayer;

pub mod cache;
pub mod config;
pub mod tasks;
pub mod transform;

use config::Config;
use tasks::TaskManager;
use transform::params::ImageParams;
use transform::{ConvertError, TransformFn};

const CT_JSON: &str = "application/json";

// Literal wire bodies; the test suite depends on the exact text.
const STATUS_OK: &str = r#"{"status": "ok"}"#;
const ERROR_METHOD_NOT_ALLOWED: &str = r#"{"error": "Method not allowed"}"#;
const ERROR_IMAGE_NOT_PROVIDED: &str = r#"{"error": "image_file field not provided"}"#;
const ERROR_FILE_IS_NOT_IMAGE: &str = r#"{"error": "Provided file is not an accepted image"}"#;
const ERROR_INVALID_TOKEN: &str = r#"{"error": "Invalid Token"}"#;
const ERROR_IMAGE_NOT_FOUND: &str = r#"{"error": "Image not found"}"#;
const ERROR_ADDRESS_NOT_FOUND: &str = r#"{"error": "Address not found"}"#;
const ERROR_SERVER: &str = r#"{"error": "Internal Server Error"}"#;

/// Coarse upper bound on request handling; derivative builds themselves
/// are not cancelled by it.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

const IMAGE_ID_ALPHABET: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_-";
const IMAGE_ID_LEN: usize = 9;

/// Everything a request handler needs, passed explicitly as router state.
pub struct AppState {
    pub config: Config,
    cache_control: String,
    tasks: TaskManager,
    transform: TransformFn,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_transform(
            config,
            Arc::new(|input: &Path, output: &Path, params: &ImageParams| {
                transform::convert(input, output, params)
            }),
        )
    }

    /// Same as [`AppState::new`] but with a substitute transform, used by
    /// the tests to count or fake builds.
    pub fn with_transform(config: Config, transform: TransformFn) -> Self {
        let cache_control = config.cache_control();
        let tasks = TaskManager::new(config.convert_concurrency);
        Self {
            config,
            cache_control,
            tasks,
            transform,
        }
    }
}

/// Builds the application router. Trailing slashes are significant and
/// matched exactly.
pub fn router(state: AppState) -> Router {
    let max_body = state.config.max_uploaded_image_size * 1024 * 1024;
    let state = Arc::new(state);
    Router::new()
        .route("/health/", get(health).fallback(method_not_allowed))
        .route("/upload/", post(upload).fallback(method_not_allowed))
        .route(
            "/image/{image_id}",
            get(fetch_original).fallback(method_not_allowed),
        )
        .route(
            "/image/{options}/{image_id}",
            get(fetch_derivative).fallback(method_not_allowed),
        )
        .route(
            "/delete/{image_id}",
            delete(delete_original).fallback(method_not_allowed),
        )
        .fallback(address_not_found)
        .layer(DefaultBodyLimit::max(max_body))
        // the timeout's BoxError must be handled before the router sees it
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_: BoxError| async {
                    StatusCode::REQUEST_TIMEOUT
                }))
                .layer(TimeoutLayer::new(READ_TIMEOUT)),
        )
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

fn json_response(status: StatusCode, body: impl Into<Body>) -> Response {
    let body: Body = body.into();
    (status, [(header::CONTENT_TYPE, CT_JSON)], body).into_response()
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %detail, "request handler panicked");
    json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER)
}

async fn health() -> Response {
    json_response(StatusCode::OK, STATUS_OK)
}

async fn address_not_found() -> Response {
    json_response(StatusCode::NOT_FOUND, ERROR_ADDRESS_NOT_FOUND)
}

async fn method_not_allowed() -> Response {
    json_response(StatusCode::METHOD_NOT_ALLOWED, ERROR_METHOD_NOT_ALLOWED)
}

fn is_valid_image_id(image_id: &str) -> bool {
    (9..=12).contains(&image_id.len())
        && image_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn is_valid_options(options: &str) -> bool {
    !options.is_empty()
        && options.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b',' | b'=' | b'-')
        })
}

fn accepts_webp(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("webp"))
        .unwrap_or(false)
}

fn token_is_valid(config: &Config, headers: &HeaderMap) -> bool {
    if config.token.is_empty() {
        return true;
    }
    headers.get("Token").and_then(|value| value.to_str().ok()) == Some(config.token.as_str())
}

fn mint_image_id() -> String {
    let mut rng = rand::thread_rng();
    (0..IMAGE_ID_LEN)
        .map(|_| IMAGE_ID_ALPHABET[rng.gen_range(0..IMAGE_ID_ALPHABET.len())] as char)
        .collect()
}

async fn fetch_original(
    State(state): State<Arc<AppState>>,
    UrlPath(image_id): UrlPath<String>,
) -> Response {
    if !is_valid_image_id(&image_id) {
        return json_response(StatusCode::NOT_FOUND, ERROR_ADDRESS_NOT_FOUND);
    }
    let path = cache::original_path(&state.config.data_directory, &image_id);
    match cache::read_file(&path).await {
        Ok(Some(bytes)) => {
            let content_type = cache::content_type_of(&bytes);
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Ok(None) => json_response(StatusCode::NOT_FOUND, ERROR_IMAGE_NOT_FOUND),
        Err(err) => {
            tracing::error!(%image_id, error = %err, "failed to read original");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER)
        }
    }
}

async fn fetch_derivative(
    State(state): State<Arc<AppState>>,
    UrlPath((options, image_id)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !is_valid_image_id(&image_id) || !is_valid_options(&options) {
        return json_response(StatusCode::NOT_FOUND, ERROR_ADDRESS_NOT_FOUND);
    }

    let webp_accepted = accepts_webp(&headers);
    let params = match ImageParams::parse(&image_id, &options, webp_accepted, &state.config) {
        Ok(params) => params,
        Err(err) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                format!(r#"{{"error": "Invalid options: {err}"}}"#),
            )
        }
    };

    let cache_file = cache::derivative_path(&state.config.data_directory, &params);
    match cache::read_file(&cache_file).await {
        Ok(Some(bytes)) => return derivative_response(&state, &params, bytes),
        Ok(None) => {}
        Err(err) => {
            tracing::error!(%image_id, error = %err, "failed to read cached derivative");
            return json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER);
        }
    }

    if let Err(err) = params.validate(&state.config) {
        return json_response(StatusCode::BAD_REQUEST, format!(r#"{{"error": "{err}"}}"#));
    }

    let input = cache::original_path(&state.config.data_directory, &image_id);
    let output = cache_file.clone();
    let transform = Arc::clone(&state.transform);
    let build_params = params.clone();
    let built = state
        .tasks
        .run(&params.fingerprint(), move || {
            transform(&input, &output, &build_params)
        })
        .await;

    match built {
        Ok(()) => {}
        Err(ConvertError::NotFound) => {
            return json_response(StatusCode::NOT_FOUND, ERROR_IMAGE_NOT_FOUND)
        }
        Err(err) => {
            tracing::error!(%image_id, error = %err, "derivative build failed");
            return json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER);
        }
    }

    match cache::read_file(&cache_file).await {
        Ok(Some(bytes)) => derivative_response(&state, &params, bytes),
        Ok(None) => {
            tracing::error!(%image_id, "derivative missing after successful build");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER)
        }
        Err(err) => {
            tracing::error!(%image_id, error = %err, "failed to read built derivative");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER)
        }
    }
}

fn derivative_response(state: &AppState, params: &ImageParams, bytes: Vec<u8>) -> Response {
    // GIF passthrough keeps its original content type.
    let content_type = if cache::content_type_of(&bytes) == "image/gif" {
        "image/gif"
    } else if params.webp_accepted {
        "image/webp"
    } else {
        "image/jpeg"
    };
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, state.cache_control.as_str()),
        ],
        bytes,
    )
        .into_response()
}

async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    if !token_is_valid(&state.config, &headers) {
        return json_response(StatusCode::UNAUTHORIZED, ERROR_INVALID_TOKEN);
    }

    let Ok(mut multipart) = multipart else {
        return json_response(StatusCode::BAD_REQUEST, ERROR_IMAGE_NOT_PROVIDED);
    };

    let mut file_bytes = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() == Some("image_file") {
                    match field.bytes().await {
                        Ok(bytes) => file_bytes = Some(bytes),
                        Err(_) => {
                            return json_response(StatusCode::BAD_REQUEST, ERROR_IMAGE_NOT_PROVIDED)
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(_) => return json_response(StatusCode::BAD_REQUEST, ERROR_IMAGE_NOT_PROVIDED),
        }
    }
    let Some(bytes) = file_bytes else {
        return json_response(StatusCode::BAD_REQUEST, ERROR_IMAGE_NOT_PROVIDED);
    };

    if !cache::is_accepted_upload(&bytes) {
        return json_response(StatusCode::BAD_REQUEST, ERROR_FILE_IS_NOT_IMAGE);
    }

    let image_id = mint_image_id();
    let path = cache::original_path(&state.config.data_directory, &image_id);
    let stored = tokio::task::spawn_blocking(move || cache::store(&path, &bytes)).await;
    match stored {
        Ok(Ok(())) => {
            tracing::info!(%image_id, "original stored");
            json_response(StatusCode::OK, format!(r#"{{"image_id": "{image_id}"}}"#))
        }
        Ok(Err(err)) => {
            tracing::error!(%image_id, error = %err, "failed to store original");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER)
        }
        Err(err) => {
            tracing::error!(%image_id, error = %err, "store task failed");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER)
        }
    }
}

async fn delete_original(
    State(state): State<Arc<AppState>>,
    UrlPath(image_id): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    if !token_is_valid(&state.config, &headers) {
        return json_response(StatusCode::UNAUTHORIZED, ERROR_INVALID_TOKEN);
    }
    if !is_valid_image_id(&image_id) {
        return json_response(StatusCode::NOT_FOUND, ERROR_ADDRESS_NOT_FOUND);
    }

    let path = cache::original_path(&state.config.data_directory, &image_id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            tracing::info!(%image_id, "original deleted");
            json_response(StatusCode::NO_CONTENT, Body::empty())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            json_response(StatusCode::NOT_FOUND, ERROR_IMAGE_NOT_FOUND)
        }
        Err(err) => {
            tracing::error!(%image_id, error = %err, "failed to delete original");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, ERROR_SERVER)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_shape_is_enforced() {
        assert!(is_valid_image_id("NG4uQBa2f"));
        assert!(is_valid_image_id("abc_def-1234"));
        assert!(!is_valid_image_id("short"));
        assert!(!is_valid_image_id("way-too-long-for-an-id"));
        assert!(!is_valid_image_id("bad/chars1"));
    }

    #[test]
    fn options_charset_is_enforced() {
        assert!(is_valid_options("w=500,h=500,fit=scale-down"));
        assert!(!is_valid_options(""));
        assert!(!is_valid_options("W=500"));
        assert!(!is_valid_options("w=500;h=500"));
    }

    #[test]
    fn minted_ids_match_the_accepted_shape() {
        for _ in 0..100 {
            assert!(is_valid_image_id(&mint_image_id()));
        }
    }

    #[test]
    fn webp_acceptance_is_substring_based() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_webp(&headers));
        headers.insert(header::ACCEPT, "image/webp,image/*".parse().unwrap());
        assert!(accepts_webp(&headers));
        headers.insert(header::ACCEPT, "image/png".parse().unwrap());
        assert!(!accepts_webp(&headers));
    }

    #[test]
    fn empty_configured_token_accepts_everything() {
        let config = Config::default();
        assert!(token_is_valid(&config, &HeaderMap::new()));

        let config = Config {
            token: "123".to_string(),
            ..Config::default()
        };
        assert!(!token_is_valid(&config, &HeaderMap::new()));
        let mut headers = HeaderMap::new();
        headers.insert("Token", "123".parse().unwrap());
        assert!(token_is_valid(&config, &headers));
    }
}
