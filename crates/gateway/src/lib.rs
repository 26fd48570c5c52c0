//! HTTP API gateway for Kōhai.
//!
//! Exposes the two service endpoints — `POST /chat` and `GET /health` —
//! over Axum, maps engine errors onto HTTP statuses with user-safe bodies,
//! and wires the ambient layers (CORS, trace logging, body limit).
//!
//! Requests that arrive while the model is loading get 503 with a retry
//! hint; they are never queued. Generation failures surface as 500 with a
//! generic message — the underlying cause goes to the operator log only.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

use kohai_config::AppConfig;
use kohai_core::{ChatReply, ChatRequest, EngineError, Health};
use kohai_engine::{Directives, InferenceEngine, ModelSources};

/// Shared application state for the gateway.
pub struct ApiState {
    pub engine: Arc<InferenceEngine>,
}

type SharedState = Arc<ApiState>;

/// Build the Axum router with all gateway routes and layers.
pub fn build_router(state: SharedState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB body limit
        .layer(cors_layer(allowed_origins))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS: `"*"` anywhere in the list allows any origin (the default — the
/// chat page is served from elsewhere); otherwise only the listed origins.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let methods = [Method::GET, Method::POST];
    let headers = [header::CONTENT_TYPE];

    if allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(headers)
    }
}

/// Start the gateway HTTP server.
///
/// Builds the engine once, kicks off the one-time model load in the
/// background, and serves immediately — callers see 503 until the load
/// finishes.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let sources = ModelSources {
        base_model: config.model.base_model.clone(),
        adapter_repo: config
            .model
            .adapter_repo
            .clone()
            .filter(|r| !r.is_empty()),
    };
    let directives = Directives {
        indonesian: config.prompts.indonesian.clone(),
        english: config.prompts.english.clone(),
    };
    let engine = Arc::new(InferenceEngine::new(
        sources,
        directives,
        config.decode.clone(),
        &config.model.device,
    )?);

    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = engine.load().await {
                error!(error = %e, "model load failed — restart required");
            }
        });
    }

    let state = Arc::new(ApiState { engine });
    let app = build_router(state, &config.gateway.allowed_origins);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    info!(addr = %addr, "gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

async fn chat_handler(
    State(state): State<SharedState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    match state.engine.chat(request).await {
        Ok(reply) => Ok(Json(reply)),
        Err(EngineError::Unavailable) => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "model is still loading — try again shortly",
        )),
        Err(EngineError::Prompt(e)) => {
            // invalid input; PromptError messages are safe for callers
            Err(api_error(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => {
            error!(error = %e, cause = ?std::error::Error::source(&e), "chat request failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "generation failed",
            ))
        }
    }
}

async fn health_handler(State(state): State<SharedState>) -> Json<Health> {
    Json(state.engine.health().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use kohai_core::DecodeConfig;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let engine = InferenceEngine::new(
            ModelSources {
                base_model: "Qwen/Qwen2.5-1.5B-Instruct".into(),
                adapter_repo: None,
            },
            Directives {
                indonesian: "Jawab dalam Bahasa Indonesia.".into(),
                english: "Answer in English.".into(),
            },
            DecodeConfig::default(),
            "cpu",
        )
        .expect("engine must construct");
        Arc::new(ApiState {
            engine: Arc::new(engine),
        })
    }

    fn test_router() -> Router {
        build_router(test_state(), &["*".to_string()])
    }

    #[tokio::test]
    async fn health_endpoint_reports_not_loaded() {
        let app = test_router();

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let health: Health = serde_json::from_slice(&body).unwrap();
        assert!(!health.loaded);
        assert_eq!(health.device, "cpu");
    }

    #[tokio::test]
    async fn chat_returns_503_while_loading() {
        let app = test_router();

        let req = Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"message": "Halo"}"#))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(err["error"].as_str().unwrap().contains("try again"));
    }

    #[tokio::test]
    async fn malformed_json_is_a_client_error() {
        let app = test_router();

        let req = Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
