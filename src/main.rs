use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use key_verifier::{
    config::Config,
    database::Database,
    engine::VerificationEngine,
    errors::ApiError,
    events::{ChannelEventSink, EventHandler, FanOut, TracingEventHandler},
    models::{DeleteKeyRequest, UpdateRemainingRequest, VerifyKeyRequest, VerifyKeyResponse},
    rate_limit::{ConsistentRateLimiter, FastRateLimiter, RateLimitManager},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type AppState = Arc<VerificationEngine>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // Initialize database
    if let Some(dir) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(dir)?;
    }
    let db = Arc::new(Database::new(&config.database_path)?);

    // Usage events are logged and persisted off the request path
    let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(TracingEventHandler), db.clone()];
    let (events, _consumer) =
        ChannelEventSink::spawn(config.event_queue_capacity, Arc::new(FanOut(handlers)));

    // CONSISTENT buckets live in the database so every instance shares them
    let rate_limits = RateLimitManager::new(
        Arc::new(FastRateLimiter::new(config.rate_limit_idle)),
        Arc::new(ConsistentRateLimiter::new(db.clone())),
        config.rate_limit_failure_policy,
    );

    let engine = VerificationEngine::from_config(db, Arc::new(events), &config)
        .rate_limits(rate_limits)
        .build();

    let app = Router::new()
        .route("/v1/keys.verifyKey", post(verify_key))
        .route("/v1/keys.deleteKey", post(delete_key))
        .route("/v1/keys.updateRemaining", post(update_remaining))
        .with_state(Arc::new(engine));

    tracing::info!("Starting server on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(err: ApiError) -> (StatusCode, String) {
    let status = match err {
        ApiError::KeyNotFound => StatusCode::NOT_FOUND,
        ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ApiError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn verify_key(
    State(engine): State<AppState>,
    Json(payload): Json<VerifyKeyRequest>,
) -> Result<Json<VerifyKeyResponse>, (StatusCode, String)> {
    if payload.key.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "API key is required".to_string()));
    }

    let result = engine.verify(&payload).await.map_err(error_response)?;
    Ok(Json(VerifyKeyResponse::from(result)))
}

async fn delete_key(
    State(engine): State<AppState>,
    Json(payload): Json<DeleteKeyRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    engine
        .revoke(&payload.workspace_id, &payload.key_id)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({})))
}

async fn update_remaining(
    State(engine): State<AppState>,
    Json(payload): Json<UpdateRemainingRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    engine
        .update_remaining(&payload.workspace_id, &payload.key_id, payload.remaining)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({ "remaining": payload.remaining })))
}
