use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crawlpilot::core::types::{AckResponse, CrawlEvent, CrawlRequest, ErrorResponse};
use crawlpilot::crawl::StartError;
use crawlpilot::AppState;

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

fn port_from_env() -> Option<u16> {
    for k in ["CRAWLPILOT_PORT", "PORT"] {
        if let Ok(v) = std::env::var(k) {
            if let Ok(p) = v.trim().parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting crawlpilot");

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;

    let state = Arc::new(AppState::new(http_client)?);

    let app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/crawl/{session_id}", post(start_crawl_handler))
        .route("/stop/{session_id}", post(stop_crawl_handler))
        .route("/products/{session_id}", get(poll_events_handler))
        .route("/reset-session", post(reset_session_handler))
        .route("/profiles/status", get(profile_status_handler))
        .route("/profiles/stop-all", post(stop_all_profiles_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let port: u16 = parse_port_from_args()
        .or_else(port_from_env)
        .unwrap_or(5000);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PORT/CRAWLPILOT_PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("crawlpilot listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
            _ = async {
                if let Some(ref mut s) = sigint {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "crawlpilot",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Accept a crawl job. Conflicts (session already running) are 409; an
/// unknown traversal option is 400. On accept the work continues in a
/// background task and clients poll `/products/{session_id}`.
async fn start_crawl_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<CrawlRequest>,
) -> Result<Json<AckResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.orchestrator.start(&session_id, request) {
        Ok(()) => Ok(Json(AckResponse {
            message: "Crawling started".to_string(),
        })),
        Err(e @ StartError::Conflict(_)) => Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
        Err(e @ StartError::UnknownOption(_)) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}

async fn stop_crawl_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<AckResponse> {
    state.orchestrator.stop(&session_id);
    Json(AckResponse {
        message: "Stop requested".to_string(),
    })
}

/// Ordered event log for a session. Unknown sessions get an empty list, not
/// a 404 — polling may race session creation.
async fn poll_events_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<Vec<CrawlEvent>> {
    let events = state
        .registry
        .get(&session_id)
        .map(|s| s.events())
        .unwrap_or_default();
    Json(events)
}

#[derive(serde::Deserialize)]
struct ResetRequest {
    session_id: String,
}

/// Replace a session wholesale. Also the target of the orchestrator's own
/// post-completion notification, so a stale `Running` never outlives its run.
async fn reset_session_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResetRequest>,
) -> Json<AckResponse> {
    state.registry.reset(&request.session_id);
    Json(AckResponse {
        message: format!("Session '{}' reset", request.session_id),
    })
}

async fn profile_status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.launcher.statuses().await {
        Ok(states) => Ok(Json(states)),
        Err(e) => {
            error!("Profile status error: {}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

async fn stop_all_profiles_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    match state.launcher.stop_all().await {
        Ok(data) => Ok(Json(data)),
        Err(e) => {
            error!("Stop-all error: {}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}
