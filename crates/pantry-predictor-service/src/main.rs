use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use pantry_predictor_core::{parse_timestamp, EventInput, Forecast, PredictorError};
use pantry_predictor_store_sqlite::{
    ProjectorCheck, ReplayReport, SqlitePredictorStore, SubmitReceipt, WeeklyTickReport,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

const SERVICE_CONTRACT_VERSION: &str = "predictor-service.v1";
/// Feedback events parked after a storage failure, drained in the background.
const DEFERRED_QUEUE_CAP: usize = 1024;
const DEFERRED_DRAIN_INTERVAL: Duration = Duration::from_secs(30);

/// Opens a store connection per operation so different (household, product)
/// pairs proceed in parallel under WAL; per-key ordering comes from the lock
/// map in [`ServiceState`].
#[derive(Debug, Clone)]
struct PredictorApi {
    db: PathBuf,
}

impl PredictorApi {
    fn with_store<T>(
        &self,
        op: impl FnOnce(&mut SqlitePredictorStore) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut store = SqlitePredictorStore::open(&self.db)?;
        op(&mut store)
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: PredictorApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
    key_locks: Arc<StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    deferred: Arc<StdMutex<VecDeque<EventInput>>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct KeyRequest {
    household_id: String,
    product_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ForecastRequest {
    household_id: String,
    product_id: String,
    #[serde(default)]
    at_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WeeklyTickRequest {
    #[serde(default)]
    now: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SubmitResponse {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    receipt: Option<SubmitReceipt>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    deferred_events: usize,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    invalid_event_total: AtomicU64,
    stale_event_total: AtomicU64,
    unknown_entity_total: AtomicU64,
    conflict_total: AtomicU64,
    storage_failure_total: AtomicU64,
    deferred_total: AtomicU64,
    internal_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    invalid_event_total: u64,
    stale_event_total: u64,
    unknown_entity_total: u64,
    conflict_total: u64,
    storage_failure_total: u64,
    deferred_total: u64,
    internal_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "pantry-predictor-service")]
#[command(about = "Local HTTP service for the consumption cycle predictor")]
struct Args {
    #[arg(long, default_value = "./pantry_predictor.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Per-operation deadline; expiry is reported as storage_failure.
    #[arg(long, default_value_t = 2000)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn classify_api_error(err: &anyhow::Error) -> ServiceFailure {
        if let Some(predictor) = err.downcast_ref::<PredictorError>() {
            return failure_for_code(predictor.code(), predictor.to_string());
        }

        let normalized = format!("{err:#}").to_ascii_lowercase();
        for code in
            ["invalid_event", "stale_event", "unknown_entity", "conflict", "storage_failure"]
        {
            if normalized.contains(code) {
                return failure_for_code(code, err.to_string());
            }
        }
        if normalized.contains("sqlite") || normalized.contains("database") {
            return failure_for_code("storage_failure", err.to_string());
        }
        failure_for_code("internal", err.to_string())
    }

    async fn key_lock(&self, household_id: &str, product_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{household_id}:{product_id}");
        let mut locks = self.key_locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(key).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(PredictorApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("storage_failure", true);
                Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage_failure",
                    format!(
                        "{operation_label} deadline expired after {} ms; retry with the same idempotency key",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    fn defer_feedback(&self, input: EventInput) -> bool {
        let mut queue = self.deferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if queue.len() >= DEFERRED_QUEUE_CAP {
            let dropped = queue.pop_front();
            tracing::warn!(
                dropped_key = dropped.as_ref().map(|input| input.idempotency_key.as_str()),
                "deferred feedback queue full, dropping oldest entry"
            );
        }
        queue.push_back(input);
        self.telemetry.deferred_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn deferred_len(&self) -> usize {
        self.deferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Re-submits parked feedback events; stops at the first storage failure
    /// so order within the queue is preserved.
    async fn drain_deferred(&self) {
        loop {
            let next = {
                let mut queue =
                    self.deferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                queue.pop_front()
            };
            let Some(input) = next else {
                return;
            };

            let lock = self.key_lock(&input.household_id, &input.product_id).await;
            let _guard = lock.lock().await;
            let retry = input.clone();
            let result = self
                .run_blocking("drain_deferred", move |api| {
                    api.with_store(|store| {
                        store.submit_event(&retry).map_err(anyhow::Error::new)
                    })
                })
                .await;

            match result {
                Ok(_) => {
                    tracing::info!(
                        idempotency_key = %input.idempotency_key,
                        "deferred feedback applied"
                    );
                }
                Err(failure) if failure.code == "storage_failure" => {
                    let mut queue =
                        self.deferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    queue.push_front(input);
                    return;
                }
                Err(failure) => {
                    tracing::warn!(
                        idempotency_key = %input.idempotency_key,
                        code = failure.code,
                        "deferred feedback permanently rejected"
                    );
                }
            }
        }
    }
}

fn failure_for_code(code: &str, message: String) -> ServiceFailure {
    let (status, code) = match code {
        "invalid_event" => (StatusCode::BAD_REQUEST, "invalid_event"),
        "stale_event" => (StatusCode::CONFLICT, "stale_event"),
        "unknown_entity" => (StatusCode::NOT_FOUND, "unknown_entity"),
        "conflict" => (StatusCode::CONFLICT, "conflict"),
        "storage_failure" => (StatusCode::SERVICE_UNAVAILABLE, "storage_failure"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    ServiceFailure { status, code, message, details: None }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "invalid_event" => {
                self.invalid_event_total.fetch_add(1, Ordering::Relaxed);
            }
            "stale_event" => {
                self.stale_event_total.fetch_add(1, Ordering::Relaxed);
            }
            "unknown_entity" => {
                self.unknown_entity_total.fetch_add(1, Ordering::Relaxed);
            }
            "conflict" => {
                self.conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "storage_failure" => {
                self.storage_failure_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.internal_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            invalid_event_total: self.invalid_event_total.load(Ordering::Relaxed),
            stale_event_total: self.stale_event_total.load(Ordering::Relaxed),
            unknown_entity_total: self.unknown_entity_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            storage_failure_total: self.storage_failure_total.load(Ordering::Relaxed),
            deferred_total: self.deferred_total.load(Ordering::Relaxed),
            internal_total: self.internal_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/events/submit", post(events_submit))
        .route("/v1/forecast", post(forecast))
        .route("/v1/reset", post(reset))
        .route("/v1/weekly-tick", post(weekly_tick))
        .route("/v1/replay", post(replay))
        .route("/v1/projector/check", get(projector_check))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let api = PredictorApi { db: args.db };
    api.with_store(|store| store.migrate())?;

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
        key_locks: Arc::new(StdMutex::new(HashMap::new())),
        deferred: Arc::new(StdMutex::new(VecDeque::new())),
    };

    let drain_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DEFERRED_DRAIN_INTERVAL);
        loop {
            interval.tick().await;
            drain_state.drain_deferred().await;
        }
    });

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "predictor service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        deferred_events: state.deferred_len(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn events_submit(
    State(state): State<ServiceState>,
    payload: Result<Json<EventInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SubmitResponse>>, ServiceFailure> {
    let Json(input) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let lock = state.key_lock(&input.household_id, &input.product_id).await;
    let _guard = lock.lock().await;

    let submitted = input.clone();
    let result = state
        .run_blocking("submit_event", move |api| {
            api.with_store(|store| store.submit_event(&submitted).map_err(anyhow::Error::new))
        })
        .await;

    match result {
        Ok(receipt) => {
            Ok(Json(envelope(SubmitResponse { outcome: "applied", receipt: Some(receipt) })))
        }
        Err(failure)
            if failure.code == "storage_failure" && input.kind == "adjust_feedback" =>
        {
            // Feedback never blocks the user on model learning; park it and
            // keep serving the last good state.
            state.defer_feedback(input);
            Ok(Json(envelope(SubmitResponse { outcome: "deferred", receipt: None })))
        }
        Err(failure) => Err(failure),
    }
}

async fn forecast(
    State(state): State<ServiceState>,
    payload: Result<Json<ForecastRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Forecast>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let at_time = parse_optional_timestamp(request.at_time.as_deref())
        .map_err(|failure| record_and_return(&state, failure))?;

    let forecast = state
        .run_blocking("forecast", move |api| {
            api.with_store(|store| {
                store
                    .forecast(&request.household_id, &request.product_id, at_time)
                    .map_err(anyhow::Error::new)
            })
        })
        .await?;
    Ok(Json(envelope(forecast)))
}

async fn reset(
    State(state): State<ServiceState>,
    payload: Result<Json<KeyRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SubmitReceipt>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let lock = state.key_lock(&request.household_id, &request.product_id).await;
    let _guard = lock.lock().await;

    let receipt = state
        .run_blocking("reset", move |api| {
            api.with_store(|store| {
                store
                    .reset(&request.household_id, &request.product_id)
                    .map_err(anyhow::Error::new)
            })
        })
        .await?;
    Ok(Json(envelope(receipt)))
}

async fn weekly_tick(
    State(state): State<ServiceState>,
    payload: Result<Json<WeeklyTickRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<WeeklyTickReport>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let now = parse_optional_timestamp(request.now.as_deref())
        .map_err(|failure| record_and_return(&state, failure))?
        .unwrap_or_else(pantry_predictor_core::now_utc);

    let report = state
        .run_blocking("weekly_tick", move |api| {
            api.with_store(|store| store.run_weekly_tick(now))
        })
        .await?;
    Ok(Json(envelope(report)))
}

async fn replay(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReplayReport>>, ServiceFailure> {
    let report =
        state.run_blocking("replay", move |api| api.with_store(|store| store.replay())).await?;
    Ok(Json(envelope(report)))
}

async fn projector_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ProjectorCheck>>, ServiceFailure> {
    let check = state
        .run_blocking("projector_check", move |api| {
            api.with_store(|store| store.projector_check())
        })
        .await?;
    Ok(Json(envelope(check)))
}

fn parse_optional_timestamp(raw: Option<&str>) -> Result<Option<OffsetDateTime>, ServiceFailure> {
    raw.map(|value| {
        parse_timestamp(value).map_err(|err| {
            ServiceState::failure(StatusCode::BAD_REQUEST, "invalid_event", err.to_string(), None)
        })
    })
    .transpose()
}

fn record_and_return(state: &ServiceState, failure: ServiceFailure) -> ServiceFailure {
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    state.telemetry.record_failure(failure.code, false);
    failure
}
