//! Axum surface for manual search, live listing streams and preference management.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use jobwatch_adapters::{City, CityDirectory};
use jobwatch_core::{
    split_csv, ListingRecord, PreferencesUpdate, SearchRequest, UserId, UserSchedule,
};
use jobwatch_storage::StoreError;
use jobwatch_sync::{
    Dispatcher, IdentityService, LiveStreamRegistry, LiveSubscription, SearchError, StreamEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "jobwatch-web";

const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub identity: Arc<dyn IdentityService>,
    pub streams: Arc<LiveStreamRegistry>,
    pub areas: Arc<dyn CityDirectory>,
    /// Flips to `true` on shutdown so open event streams end.
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    PaymentRequired,
    Busy,
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "missing or invalid bearer token".to_string()),
            Self::PaymentRequired => (StatusCode::PAYMENT_REQUIRED, "subscription is not active".to_string()),
            Self::Busy => (StatusCode::CONFLICT, "a search for this user is already running".to_string()),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "storage failure");
        Self::Internal("storage failure".to_string())
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Busy(_) => Self::Busy,
            SearchError::SubscriptionInactive => Self::PaymentRequired,
            SearchError::Collaborator(err) => {
                warn!(error = %err, "collaborator failure during search");
                Self::BadGateway(err.to_string())
            }
            SearchError::Store(err) => err.into(),
        }
    }
}

struct Caller {
    user_id: UserId,
    token: String,
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    match state.identity.user_id_for_token(token).await {
        Ok(Some(user_id)) => Ok(Caller {
            user_id,
            token: token.to_string(),
        }),
        Ok(None) => Err(ApiError::Unauthorized),
        Err(err) => {
            warn!(error = %err, "identity lookup failed");
            Err(ApiError::BadGateway(err.to_string()))
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/areas/cities", get(cities_handler))
        .route("/api/search", post(search_handler))
        .route("/api/stream", get(stream_handler))
        .route(
            "/api/preferences",
            get(get_preferences_handler).put(put_preferences_handler),
        )
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding web port {port}"))?;
    info!(port, "web server listening");
    let mut shutdown = state.shutdown.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            wait_for_shutdown(&mut shutdown).await;
        })
        .await
        .context("serving http")?;
    Ok(())
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone without a shutdown request; keep running.
        std::future::pending::<()>().await;
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct CitiesParams {
    countries: Option<String>,
}

/// Public city list for the preference form, e.g. `?countries=russia,belarus`.
async fn cities_handler(
    State(state): State<AppState>,
    Query(params): Query<CitiesParams>,
) -> Json<Vec<City>> {
    let countries = params
        .countries
        .as_deref()
        .map(split_csv)
        .unwrap_or_default();
    Json(state.areas.cities(&countries).await)
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    found: usize,
    new_records: Vec<ListingRecord>,
    delivered: usize,
}

async fn search_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let run = state
        .dispatcher
        .search_now(&request, &caller.token, caller.user_id)
        .await?;
    Ok(Json(SearchResponse {
        found: run.found,
        new_records: run.new_records,
        delivered: run.delivered,
    }))
}

async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let LiveSubscription {
        connected,
        receiver,
    } = state.streams.subscribe(caller.user_id);
    let user_id = caller.user_id;

    let updates = stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((Ok::<_, Infallible>(sse_event(&event)), receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id, skipped, "live stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    let mut shutdown = state.shutdown.clone();
    let events = stream::once(async move { Ok::<_, Infallible>(sse_event(&connected)) })
        .chain(updates)
        .take_until(async move { wait_for_shutdown(&mut shutdown).await });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default().event(event.name()).data(event.data().to_string())
}

async fn get_preferences_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserSchedule>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    Ok(Json(state.dispatcher.preferences(caller.user_id).await?))
}

async fn put_preferences_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<PreferencesUpdate>,
) -> Result<Json<UserSchedule>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    Ok(Json(
        state
            .dispatcher
            .update_preferences(caller.user_id, &update)
            .await?,
    ))
}
