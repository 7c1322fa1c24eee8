//! API route definitions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::AppState;
use super::ApiError;
use crate::detect::engine::Evaluation;
use crate::detect::recorder::{Anomaly, AnomalyStats, AnomalyStatus};
use crate::detect::resolver::{ThresholdConfig, ThresholdRequest};
use crate::detect::Severity;
use crate::incident::{
    Actor, Incident, IncidentStats, IncidentStatus, IncidentUpdate, NewIncident, TimelineEntry,
};
use crate::metrics::{MetricSample, MetricType};
use crate::storage::{self, StorageError};

const DEFAULT_LIMIT: usize = 100;

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/samples", post(submit_sample))
        .route("/evaluate", post(evaluate_sample))
        .route("/anomalies", get(list_anomalies))
        .route("/anomalies/stats", get(anomaly_stats))
        .route("/anomalies/severity/{severity}", get(anomalies_by_severity))
        .route("/anomalies/{id}", get(get_anomaly))
        .route("/anomalies/{id}/acknowledge", post(acknowledge_anomaly))
        .route("/anomalies/{id}/investigate", post(investigate_anomaly))
        .route("/anomalies/{id}/resolve", post(resolve_anomaly))
        .route("/anomalies/{id}/false-positive", post(false_positive_anomaly))
        .route("/anomalies/{id}/link", post(link_anomaly))
        .route("/incidents", get(list_incidents).post(create_incident))
        .route("/incidents/stats", get(incident_stats))
        .route("/incidents/number/{number}", get(get_incident_by_number))
        .route("/incidents/{id}", get(get_incident).patch(update_incident))
        .route("/incidents/{id}/status", post(update_incident_status))
        .route("/incidents/{id}/comments", post(comment_incident))
        .route("/incidents/{id}/timeline", get(incident_timeline))
        .route("/thresholds", get(list_thresholds).post(create_threshold))
        .route("/thresholds/enabled", get(list_enabled_thresholds))
        .route("/thresholds/resolve", get(resolve_threshold))
        .route("/thresholds/seed", post(seed_thresholds))
        .route(
            "/thresholds/{id}",
            get(get_threshold).put(update_threshold).delete(delete_threshold),
        )
        .route("/thresholds/{id}/enable", post(enable_threshold))
        .route("/thresholds/{id}/disable", post(disable_threshold))
}

#[derive(Debug, Serialize)]
struct Meta {
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    data: T,
    meta: Meta,
}

fn one<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        data,
        meta: Meta {
            timestamp: Utc::now(),
            total: None,
        },
    })
}

fn many<T: Serialize>(data: Vec<T>) -> Json<Envelope<Vec<T>>> {
    let total = data.len();
    Json(Envelope {
        data,
        meta: Meta {
            timestamp: Utc::now(),
            total: Some(total),
        },
    })
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> storage::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let out = tokio::task::spawn_blocking(f)
        .await
        .map_err(StorageError::from)?;
    Ok(out?)
}

#[derive(Debug, Default, Deserialize)]
struct ActorFields {
    user_id: Option<Uuid>,
    user_name: Option<String>,
}

impl ActorFields {
    fn into_actor(self) -> Actor {
        Actor::from_parts(self.user_id, self.user_name)
    }
}

// --- health & metrics -------------------------------------------------------

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    one(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub(super) async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let body = state
        .engine
        .metrics()
        .render()
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}

// --- samples ----------------------------------------------------------------

#[derive(Serialize)]
struct Queued {
    application_id: Uuid,
    metric_type: MetricType,
}

async fn submit_sample(
    State(state): State<AppState>,
    payload: Result<Json<MetricSample>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(sample) = payload?;
    let dispatcher = state
        .dispatcher
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("ingest workers are not running"))?;
    let queued = Queued {
        application_id: sample.application_id,
        metric_type: sample.metric_type,
    };
    dispatcher.try_submit(sample)?;
    Ok((StatusCode::ACCEPTED, one(queued)))
}

/// Evaluate inline and return every detector result.
async fn evaluate_sample(
    State(state): State<AppState>,
    payload: Result<Json<MetricSample>, JsonRejection>,
) -> ApiResult<Json<Envelope<Evaluation>>> {
    let Json(sample) = payload?;
    let evaluation = state.engine.evaluate(sample.clone()).await?;
    let history = state.history.clone();
    blocking(move || history.record(&sample)).await?;
    Ok(one(evaluation))
}

// --- anomalies --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AnomalyQuery {
    application_id: Option<Uuid>,
    status: Option<AnomalyStatus>,
    limit: Option<usize>,
}

async fn list_anomalies(
    State(state): State<AppState>,
    Query(q): Query<AnomalyQuery>,
) -> ApiResult<Json<Envelope<Vec<Anomaly>>>> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let recorder = state.anomalies.clone();
    let rows = blocking(move || match q.application_id {
        Some(app) => recorder.list_by_application(app, q.status, limit),
        None => recorder.list_active(limit),
    })
    .await?;
    Ok(many(rows))
}

async fn anomaly_stats(State(state): State<AppState>) -> ApiResult<Json<Envelope<AnomalyStats>>> {
    let recorder = state.anomalies.clone();
    Ok(one(blocking(move || recorder.stats()).await?))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn anomalies_by_severity(
    State(state): State<AppState>,
    Path(severity): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Json<Envelope<Vec<Anomaly>>>> {
    let severity: Severity = severity
        .parse()
        .map_err(|e: crate::metrics::UnknownVariant| ApiError::bad_request(e.to_string()))?;
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let recorder = state.anomalies.clone();
    Ok(many(
        blocking(move || recorder.list_open_by_severity(severity, limit)).await?,
    ))
}

async fn get_anomaly(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Anomaly>>> {
    let recorder = state.anomalies.clone();
    Ok(one(blocking(move || recorder.get(id)).await?))
}

async fn set_anomaly_status(
    state: AppState,
    id: Uuid,
    status: AnomalyStatus,
) -> ApiResult<Json<Envelope<Anomaly>>> {
    let recorder = state.anomalies.clone();
    Ok(one(blocking(move || recorder.update_status(id, status)).await?))
}

async fn acknowledge_anomaly(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Anomaly>>> {
    set_anomaly_status(state, id, AnomalyStatus::Acknowledged).await
}

async fn investigate_anomaly(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Anomaly>>> {
    set_anomaly_status(state, id, AnomalyStatus::Investigating).await
}

async fn resolve_anomaly(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Anomaly>>> {
    set_anomaly_status(state, id, AnomalyStatus::Resolved).await
}

async fn false_positive_anomaly(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Anomaly>>> {
    set_anomaly_status(state, id, AnomalyStatus::FalsePositive).await
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    incident_id: Uuid,
    #[serde(flatten)]
    actor: ActorFields,
}

async fn link_anomaly(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<LinkRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<Anomaly>>> {
    let Json(req) = payload?;
    let incidents = state.incidents.clone();
    let actor = req.actor.into_actor();
    Ok(one(
        blocking(move || incidents.link_anomaly(req.incident_id, id, &actor)).await?,
    ))
}

// --- incidents --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IncidentQuery {
    application_id: Option<Uuid>,
    limit: Option<usize>,
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(q): Query<IncidentQuery>,
) -> ApiResult<Json<Envelope<Vec<Incident>>>> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let incidents = state.incidents.clone();
    let rows = blocking(move || match q.application_id {
        Some(app) => incidents.list_by_application(app, limit),
        None => incidents.list_active(limit),
    })
    .await?;
    Ok(many(rows))
}

#[derive(Debug, Deserialize)]
struct CreateIncidentRequest {
    #[serde(flatten)]
    incident: NewIncident,
    #[serde(flatten)]
    actor: ActorFields,
}

async fn create_incident(
    State(state): State<AppState>,
    payload: Result<Json<CreateIncidentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let incidents = state.incidents.clone();
    let actor = req.actor.into_actor();
    let created = blocking(move || incidents.create(req.incident, &actor)).await?;
    Ok((StatusCode::CREATED, one(created)))
}

async fn incident_stats(State(state): State<AppState>) -> ApiResult<Json<Envelope<IncidentStats>>> {
    let incidents = state.incidents.clone();
    Ok(one(blocking(move || incidents.stats()).await?))
}

async fn get_incident_by_number(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> ApiResult<Json<Envelope<Incident>>> {
    let incidents = state.incidents.clone();
    Ok(one(blocking(move || incidents.get_by_number(&number)).await?))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Incident>>> {
    let incidents = state.incidents.clone();
    Ok(one(blocking(move || incidents.get(id)).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateIncidentRequest {
    #[serde(flatten)]
    changes: IncidentUpdate,
    #[serde(flatten)]
    actor: ActorFields,
}

async fn update_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<UpdateIncidentRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<Incident>>> {
    let Json(req) = payload?;
    let incidents = state.incidents.clone();
    let actor = req.actor.into_actor();
    Ok(one(
        blocking(move || incidents.update(id, req.changes, &actor)).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: IncidentStatus,
    comment: Option<String>,
    #[serde(flatten)]
    actor: ActorFields,
}

async fn update_incident_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<Incident>>> {
    let Json(req) = payload?;
    let incidents = state.incidents.clone();
    let actor = req.actor.into_actor();
    Ok(one(
        blocking(move || incidents.update_status(id, req.status, &actor, req.comment)).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct CommentRequest {
    message: String,
    #[serde(flatten)]
    actor: ActorFields,
}

async fn comment_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<CommentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let incidents = state.incidents.clone();
    let actor = req.actor.into_actor();
    let entry = blocking(move || incidents.add_comment(id, &req.message, &actor)).await?;
    Ok((StatusCode::CREATED, one(entry)))
}

async fn incident_timeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Vec<TimelineEntry>>>> {
    let incidents = state.incidents.clone();
    Ok(many(blocking(move || incidents.timeline(id)).await?))
}

// --- thresholds -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ThresholdQuery {
    application_id: Option<Uuid>,
}

async fn list_thresholds(
    State(state): State<AppState>,
    Query(q): Query<ThresholdQuery>,
) -> ApiResult<Json<Envelope<Vec<ThresholdConfig>>>> {
    let store = state.thresholds.clone();
    let rows = blocking(move || match q.application_id {
        Some(app) => store.list_for_application(app),
        None => store.list_global(),
    })
    .await?;
    Ok(many(rows))
}

async fn list_enabled_thresholds(
    State(state): State<AppState>,
) -> ApiResult<Json<Envelope<Vec<ThresholdConfig>>>> {
    let store = state.thresholds.clone();
    Ok(many(blocking(move || store.list_enabled()).await?))
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    application_id: Uuid,
    metric_type: MetricType,
}

/// The configuration an evaluation for this key would use.
async fn resolve_threshold(
    State(state): State<AppState>,
    Query(q): Query<ResolveQuery>,
) -> ApiResult<Json<Envelope<ThresholdConfig>>> {
    let store = state.thresholds.clone();
    Ok(one(
        blocking(move || store.resolve(q.application_id, q.metric_type)).await?,
    ))
}

async fn seed_thresholds(
    State(state): State<AppState>,
) -> ApiResult<Json<Envelope<Vec<ThresholdConfig>>>> {
    let store = state.thresholds.clone();
    Ok(many(blocking(move || store.seed_defaults()).await?))
}

async fn create_threshold(
    State(state): State<AppState>,
    payload: Result<Json<ThresholdRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let store = state.thresholds.clone();
    let created = blocking(move || store.create(&req)).await?;
    Ok((StatusCode::CREATED, one(created)))
}

async fn get_threshold(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<ThresholdConfig>>> {
    let store = state.thresholds.clone();
    Ok(one(blocking(move || store.get(id)).await?))
}

async fn update_threshold(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<ThresholdRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<ThresholdConfig>>> {
    let Json(req) = payload?;
    let store = state.thresholds.clone();
    Ok(one(blocking(move || store.update(id, &req)).await?))
}

async fn delete_threshold(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let store = state.thresholds.clone();
    blocking(move || store.delete(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_threshold(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<ThresholdConfig>>> {
    let store = state.thresholds.clone();
    Ok(one(blocking(move || store.set_enabled(id, true)).await?))
}

async fn disable_threshold(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Envelope<ThresholdConfig>>> {
    let store = state.thresholds.clone();
    Ok(one(blocking(move || store.set_enabled(id, false)).await?))
}
