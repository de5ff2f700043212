use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::actions::{self, ActionError, RuleAction, SearchResults};
use crate::domain::coordinator::PollError;
use crate::domain::entities::{self, EntityView};
use crate::domain::entry::{EntryRuntime, RemoveError};
use crate::domain::registry::RegistryEntry;
use crate::domain::snapshot::Snapshot;
use crate::msp::records::{Alarm, Flow};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub started: Instant,
    pub entries: Arc<BTreeMap<String, Arc<EntryRuntime>>>,
}

impl AppState {
    pub fn new(entries: Vec<Arc<EntryRuntime>>) -> Self {
        let entries = entries
            .into_iter()
            .map(|e| (e.entry_id().to_string(), e))
            .collect();
        Self {
            started: Instant::now(),
            entries: Arc::new(entries),
        }
    }

    /// Look up an entry that has finished setup. Entries still starting
    /// answer 503 so callers can retry.
    fn entry(&self, entry_id: &str) -> Result<Arc<EntryRuntime>, (StatusCode, String)> {
        let runtime = self
            .entries
            .get(entry_id)
            .cloned()
            .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown entry '{}'", entry_id)))?;
        if !runtime.is_ready() {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                format!("entry '{}' is still starting", entry_id),
            ));
        }
        Ok(runtime)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub entries: Vec<EntryHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHealth {
    pub entry_id: String,
    pub ready: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    pub boxes: usize,
    pub devices: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub entry_id: String,
    pub target: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,
    pub limit: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/entries/{entry}/snapshot", get(snapshot))
        .route("/api/v1/entries/{entry}/refresh", post(refresh))
        .route("/api/v1/entries/{entry}/entities", get(entity_views))
        .route("/api/v1/entries/{entry}/registry", get(registry))
        .route("/api/v1/entries/{entry}/registry/{device}", delete(remove_device))
        .route("/api/v1/entries/{entry}/rules/{rule}/pause", post(pause_rule))
        .route("/api/v1/entries/{entry}/rules/{rule}/resume", post(resume_rule))
        .route("/api/v1/entries/{entry}/rules/{rule}/toggle", post(toggle_rule))
        .route("/api/v1/entries/{entry}/alarms/{alarm}", delete(delete_alarm))
        .route("/api/v1/entries/{entry}/devices/{device}", patch(rename_device))
        .route("/api/v1/entries/{entry}/search/alarms", get(search_alarms))
        .route("/api/v1/entries/{entry}/search/flows", get(search_flows))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<DaemonHealth> {
    let mut entries = Vec::with_capacity(state.entries.len());
    for (entry_id, runtime) in state.entries.iter() {
        let cached = runtime.coordinator.cached().await;
        entries.push(EntryHealth {
            entry_id: entry_id.clone(),
            ready: runtime.is_ready(),
            last_refresh: cached.as_ref().map(|s| s.fetched_at),
            boxes: cached.as_ref().map_or(0, |s| s.boxes.len()),
            devices: cached.as_ref().map_or(0, |s| s.devices.len()),
        });
    }
    Json(DaemonHealth {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        entries,
    })
}

/// Serve the last committed snapshot. Never triggers a poll.
async fn snapshot(State(state): State<AppState>, Path(entry): Path<String>) -> ApiResult<Snapshot> {
    let runtime = state.entry(&entry)?;
    cached(&runtime).await.map(|s| Json(s.as_ref().clone()))
}

async fn refresh(State(state): State<AppState>, Path(entry): Path<String>) -> ApiResult<Snapshot> {
    let runtime = state.entry(&entry)?;
    runtime
        .coordinator
        .refresh()
        .await
        .map(|s| Json(s.as_ref().clone()))
        .map_err(poll_error)
}

async fn entity_views(
    State(state): State<AppState>,
    Path(entry): Path<String>,
) -> ApiResult<Vec<EntityView>> {
    let runtime = state.entry(&entry)?;
    let snapshot = cached(&runtime).await?;
    Ok(Json(entities::render(&snapshot, runtime.coordinator.options())))
}

async fn registry(
    State(state): State<AppState>,
    Path(entry): Path<String>,
) -> ApiResult<Vec<RegistryEntry>> {
    let runtime = state.entry(&entry)?;
    Ok(Json(runtime.registry.entries()))
}

async fn remove_device(
    State(state): State<AppState>,
    Path((entry, device)): Path<(String, String)>,
) -> ApiResult<RegistryEntry> {
    let runtime = state.entry(&entry)?;
    runtime.remove_device(&device).await.map(Json).map_err(|e| {
        let status = match e {
            RemoveError::NotRegistered(_) => StatusCode::NOT_FOUND,
            RemoveError::Online(_) => StatusCode::CONFLICT,
        };
        (status, e.to_string())
    })
}

async fn pause_rule(
    State(state): State<AppState>,
    Path((entry, rule)): Path<(String, String)>,
) -> ApiResult<ActionOutcome> {
    let runtime = state.entry(&entry)?;
    actions::pause_rule(&runtime.coordinator, &rule)
        .await
        .map_err(action_error)?;
    Ok(outcome(&entry, rule, RuleAction::Pause))
}

async fn resume_rule(
    State(state): State<AppState>,
    Path((entry, rule)): Path<(String, String)>,
) -> ApiResult<ActionOutcome> {
    let runtime = state.entry(&entry)?;
    actions::resume_rule(&runtime.coordinator, &rule)
        .await
        .map_err(action_error)?;
    Ok(outcome(&entry, rule, RuleAction::Resume))
}

async fn toggle_rule(
    State(state): State<AppState>,
    Path((entry, rule)): Path<(String, String)>,
) -> ApiResult<ActionOutcome> {
    let runtime = state.entry(&entry)?;
    let action = actions::toggle_rule(&runtime.coordinator, &rule)
        .await
        .map_err(action_error)?;
    Ok(outcome(&entry, rule, action))
}

async fn delete_alarm(
    State(state): State<AppState>,
    Path((entry, alarm)): Path<(String, String)>,
) -> ApiResult<ActionOutcome> {
    let runtime = state.entry(&entry)?;
    actions::delete_alarm(&runtime.coordinator, &alarm)
        .await
        .map_err(action_error)?;
    Ok(outcome(&entry, alarm, "delete"))
}

async fn rename_device(
    State(state): State<AppState>,
    Path((entry, device)): Path<(String, String)>,
    Json(body): Json<RenameRequest>,
) -> ApiResult<ActionOutcome> {
    let runtime = state.entry(&entry)?;
    actions::rename_device(&runtime.coordinator, &device, &body.name)
        .await
        .map_err(action_error)?;
    Ok(outcome(&entry, device, "rename"))
}

async fn search_alarms(
    State(state): State<AppState>,
    Path(entry): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<SearchResults<Alarm>> {
    let runtime = state.entry(&entry)?;
    actions::search_alarms(runtime.coordinator.gateway(), &params.query, params.limit)
        .await
        .map(Json)
        .map_err(action_error)
}

async fn search_flows(
    State(state): State<AppState>,
    Path(entry): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<SearchResults<Flow>> {
    let runtime = state.entry(&entry)?;
    actions::search_flows(runtime.coordinator.gateway(), &params.query, params.limit)
        .await
        .map(Json)
        .map_err(action_error)
}

// ── Helpers ──────────────────────────────────────────────

async fn cached(runtime: &EntryRuntime) -> Result<Arc<Snapshot>, (StatusCode, String)> {
    runtime.coordinator.cached().await.ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "no snapshot yet (first poll has not completed)".to_string(),
        )
    })
}

fn outcome(entry: &str, target: String, action: impl ToString) -> Json<ActionOutcome> {
    Json(ActionOutcome {
        entry_id: entry.to_string(),
        target,
        action: action.to_string(),
    })
}

fn poll_error(e: PollError) -> (StatusCode, String) {
    let status = match e {
        PollError::Auth(_) => StatusCode::UNAUTHORIZED,
        PollError::TotalFailure => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string())
}

fn action_error(e: ActionError) -> (StatusCode, String) {
    let status = match &e {
        ActionError::NotFound { .. } => StatusCode::NOT_FOUND,
        ActionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ActionError::Unresolvable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ActionError::Rejected { source, .. } if source.is_auth() => StatusCode::UNAUTHORIZED,
        ActionError::Rejected { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::CountingStore;
    use crate::msp::testing::FakeGateway;
    use figment::providers::{Format, Yaml};
    use figment::Figment;
    use serde_json::{json, Value};

    fn gateway() -> Arc<FakeGateway> {
        let gw = Arc::new(FakeGateway::new());
        gw.respond("GET boxes", json!([{"gid": "g1", "name": "Home", "online": true}]));
        gw.respond(
            "GET devices",
            json!([
                {"mac": "AA:BB", "name": "Phone", "online": true, "gid": "g1"},
                {"mac": "CC:DD", "name": "Laptop", "online": false, "gid": "g1"}
            ]),
        );
        gw.respond(
            "GET rules",
            json!([{"id": "r1", "action": "block", "status": "active", "gid": "g1"}]),
        );
        gw.respond("POST rules/r1/pause", Value::Null);
        gw
    }

    fn runtime(gw: Arc<FakeGateway>) -> Arc<EntryRuntime> {
        let config = Figment::from(Yaml::string(
            "entry_id: home\napi_token: tok\nenable_rules: true\n",
        ))
        .extract()
        .unwrap();
        Arc::new(EntryRuntime::new(&config, gw, Arc::new(CountingStore::default())))
    }

    async fn listen(runtime: Arc<EntryRuntime>) -> String {
        let app = router(AppState::new(vec![runtime]));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn serve() -> (String, Arc<FakeGateway>) {
        let gw = gateway();
        let runtime = runtime(gw.clone());
        runtime.start().await.unwrap();
        (listen(runtime).await, gw)
    }

    #[tokio::test]
    async fn entry_still_starting_is_listed_but_unavailable() {
        let gw = gateway();
        gw.fail_once("GET boxes", FakeGateway::timeout("boxes"));
        gw.fail_once("GET devices", FakeGateway::timeout("devices"));
        let runtime = runtime(gw);
        assert!(runtime.start().await.is_err());
        let base = listen(runtime.clone()).await;
        let http = reqwest::Client::new();

        let health: DaemonHealth = http
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.entries.len(), 1);
        assert!(!health.entries[0].ready);

        let pending = http
            .get(format!("{}/api/v1/entries/home/snapshot", base))
            .send()
            .await
            .unwrap();
        assert_eq!(pending.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        runtime.start().await.unwrap();
        let ready = http
            .get(format!("{}/api/v1/entries/home/snapshot", base))
            .send()
            .await
            .unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn health_and_snapshot() {
        let (base, _) = serve().await;
        let http = reqwest::Client::new();

        let health: DaemonHealth = http
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.entries.len(), 1);
        assert_eq!(health.entries[0].devices, 2);

        let snapshot: Snapshot = http
            .get(format!("{}/api/v1/entries/home/snapshot", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(snapshot.rules.len(), 1);

        let missing = http
            .get(format!("{}/api/v1/entries/nope/snapshot", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rule_toggle_and_error_mapping() {
        let (base, gw) = serve().await;
        let http = reqwest::Client::new();

        let outcome: ActionOutcome = http
            .post(format!("{}/api/v1/entries/home/rules/r1/toggle", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(outcome.action, "pause");
        assert_eq!(gw.calls_to(reqwest::Method::POST, "rules/r1/pause"), 1);

        let unknown = http
            .post(format!("{}/api/v1/entries/home/rules/zzz/pause", base))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

        let bad_limit = http
            .get(format!("{}/api/v1/entries/home/search/alarms?limit=0", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_limit.status(), reqwest::StatusCode::BAD_REQUEST);

        let online = http
            .delete(format!("{}/api/v1/entries/home/registry/AA:BB", base))
            .send()
            .await
            .unwrap();
        assert_eq!(online.status(), reqwest::StatusCode::CONFLICT);

        let removed = http
            .delete(format!("{}/api/v1/entries/home/registry/CC:DD", base))
            .send()
            .await
            .unwrap();
        assert_eq!(removed.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn entities_render_with_state() {
        let (base, _) = serve().await;
        let views: Vec<EntityView> = reqwest::get(format!("{}/api/v1/entries/home/entities", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let rule = views
            .iter()
            .find(|v| v.descriptor.unique_id == "firewalla_rule_switch_r1")
            .unwrap();
        assert_eq!(rule.state, entities::EntityState::On);
    }
}
