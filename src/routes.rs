use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    admin,
    analytics::{self, Window},
    auth::{self, AuthContext},
    dashboard::{DashboardParams, Range, Slice, MAX_DAYS},
    error::{AppError, FieldIssue},
    explain,
    models::{
        BenchmarkData, Child, ComprehensiveSummary, DashboardData, Heatmap, LearningHealth,
        ReadinessScoreData, Subscription,
    },
    state::AppState,
    validation,
};

pub fn build_router(state: AppState) -> Router {
    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));
    if let Some(origin) = state.config.cors_origin.as_deref() {
        match HeaderValue::from_str(origin) {
            Ok(origin) => cors = cors.allow_origin(origin).allow_credentials(true),
            Err(_) => warn!(origin, "ignoring unparseable CORS_ORIGIN"),
        }
    }

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/auth/login", post(admin::login_handler))
        .route("/api/analytics/dashboard", get(dashboard_handler))
        .route("/api/analytics/{slice}", get(slice_handler))
        .route(
            "/api/explanations/generate",
            post(explain::generate_handler).get(explain::cached_handler),
        )
        .route("/api/validate", post(validation::validate_handler))
        .route("/api/admin/users/create", post(admin::create_user_handler))
        .route(
            "/api/admin/impersonation",
            post(admin::start_impersonation_handler).delete(admin::stop_impersonation_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let address = format!("0.0.0.0:{}", state.config.port);
    let app = build_router(state);

    info!("Binding to {address}");
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = ?e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!(error = ?e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({"success": true, "status": "ok"}))
}

/// Reads `childId`, `range` and `days`, reporting every bad parameter at once.
pub fn parse_analytics_query(query: &HashMap<String, String>) -> Result<DashboardParams, AppError> {
    let mut issues = Vec::new();

    let child_id = match query.get("childId") {
        None => {
            issues.push(FieldIssue::new("childId", "childId is required"));
            None
        }
        Some(raw) => raw
            .parse::<Uuid>()
            .map_err(|_| issues.push(FieldIssue::new("childId", "childId must be a UUID")))
            .ok(),
    };
    let range = match query.get("range") {
        None => Some(Range::default()),
        Some(raw) => raw
            .parse::<Range>()
            .map_err(|e| issues.push(FieldIssue::new("range", e.to_string())))
            .ok(),
    };
    let days = match query.get("days") {
        None => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(days) if (1..=MAX_DAYS).contains(&days) => Some(days),
            _ => {
                issues.push(FieldIssue::new(
                    "days",
                    format!("days must be a whole number from 1 to {MAX_DAYS}"),
                ));
                None
            }
        },
    };

    match (child_id, range) {
        (Some(child_id), Some(range)) if issues.is_empty() => Ok(DashboardParams {
            child_id,
            range,
            days,
        }),
        _ => Err(AppError::Validation(issues)),
    }
}

async fn authorized_child(
    state: &AppState,
    headers: &HeaderMap,
    params: &DashboardParams,
) -> Result<(AuthContext, Child), AppError> {
    let ctx = auth::authenticate(state.store.as_ref(), headers, Utc::now()).await?;
    let child = state
        .store
        .find_child(params.child_id)
        .await?
        .ok_or(AppError::NotFound("Child"))?;
    if !ctx.can_view_child(&child) {
        warn!(user = %ctx.effective.id, child = %child.id, "child access denied");
        return Err(AppError::Forbidden);
    }
    Ok((ctx, child))
}

async fn comprehensive_slice(state: &AppState, child: &Child, window: &Window) -> anyhow::Result<ComprehensiveSummary> {
    let (attempts, history) = tokio::try_join!(
        state.store.fetch_attempts(child.id, window.fetch_since()),
        state.store.practice_days(child.id, window.now),
    )?;
    Ok(analytics::comprehensive(&attempts, window, &history))
}

async fn readiness_slice(state: &AppState, child: &Child, window: &Window) -> anyhow::Result<ReadinessScoreData> {
    let attempts = state.store.fetch_attempts(child.id, window.fetch_since()).await?;
    if attempts.is_empty() {
        return Ok(analytics::empty_readiness());
    }
    let topics = state.store.count_curriculum_topics().await?;
    Ok(analytics::readiness(&attempts, window, topics))
}

async fn heatmap_slice(state: &AppState, child: &Child, window: &Window) -> anyhow::Result<Heatmap> {
    let attempts = state.store.fetch_attempts(child.id, window.fetch_since()).await?;
    Ok(analytics::heatmap(&attempts, window))
}

async fn benchmark_slice(state: &AppState, child: &Child, window: &Window) -> anyhow::Result<BenchmarkData> {
    // Gated on the account that owns the child, not on whoever is looking.
    let subscription = state
        .store
        .find_profile(child.parent_id)
        .await?
        .map(|p| p.subscription)
        .unwrap_or_else(Subscription::free);
    if !analytics::benchmark_unlocked(&subscription) {
        return Ok(analytics::benchmark(child.id, &[], &subscription));
    }
    let rows = state.store.cohort_rows(child, window.start()).await?;
    Ok(analytics::benchmark(child.id, &rows, &subscription))
}

async fn learning_health_slice(state: &AppState, child: &Child, window: &Window) -> anyhow::Result<LearningHealth> {
    let attempts = state.store.fetch_attempts(child.id, window.fetch_since()).await?;
    Ok(analytics::learning_health(&attempts, window))
}

/// A failed slice becomes `null` in the merged payload.
fn settle<T>(slice: Slice, child: &Child, result: anyhow::Result<T>) -> Option<T> {
    result
        .map_err(|e| warn!(slice = slice.path(), child = %child.id, error = ?e, "analytics slice failed"))
        .ok()
}

async fn dashboard_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, AppError> {
    let params = parse_analytics_query(&query)?;
    let (_, child) = authorized_child(&state, &headers, &params).await?;
    let window = Window::new(Utc::now(), params.effective_days());

    let (comprehensive, readiness, heatmap, benchmark, learning_health) = tokio::join!(
        comprehensive_slice(&state, &child, &window),
        readiness_slice(&state, &child, &window),
        heatmap_slice(&state, &child, &window),
        benchmark_slice(&state, &child, &window),
        learning_health_slice(&state, &child, &window),
    );

    let data = DashboardData {
        comprehensive: settle(Slice::Comprehensive, &child, comprehensive),
        readiness: settle(Slice::Readiness, &child, readiness),
        heatmap: settle(Slice::Heatmap, &child, heatmap),
        benchmark: settle(Slice::Benchmark, &child, benchmark),
        learning_health: settle(Slice::LearningHealth, &child, learning_health),
    };
    Ok(Json(json!({"success": true, "data": data})))
}

fn to_data<T: Serialize>(value: T) -> anyhow::Result<Value> {
    serde_json::to_value(value).context("failed to encode analytics payload")
}

async fn slice_handler(
    State(state): State<AppState>,
    Path(slice): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, AppError> {
    let slice = Slice::ALL
        .into_iter()
        .find(|s| s.path() == slice)
        .ok_or(AppError::NotFound("Analytics endpoint"))?;
    let params = parse_analytics_query(&query)?;
    let (_, child) = authorized_child(&state, &headers, &params).await?;
    let window = Window::new(Utc::now(), params.effective_days());

    let data = match slice {
        Slice::Comprehensive => to_data(comprehensive_slice(&state, &child, &window).await?)?,
        Slice::Readiness => to_data(readiness_slice(&state, &child, &window).await?)?,
        Slice::Heatmap => to_data(heatmap_slice(&state, &child, &window).await?)?,
        Slice::Benchmark => to_data(benchmark_slice(&state, &child, &window).await?)?,
        Slice::LearningHealth => to_data(learning_health_slice(&state, &child, &window).await?)?,
    };
    Ok(Json(json!({"success": true, "data": data})))
}
