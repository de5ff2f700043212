//! Mutating and search actions exposed to the host.
//!
//! Mutations resolve their target from the cached snapshot, issue one MSP
//! call, then trigger an out-of-cycle refresh. Searches go straight to the
//! API and never touch cached state.

use std::fmt;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::msp::error::ApiError;
use crate::msp::fetch;
use crate::msp::gateway::Gateway;
use crate::msp::records::{Alarm, Flow};

use super::coordinator::Coordinator;

pub const MAX_SEARCH_LIMIT: usize = 200;
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{kind} '{id}' not found in cached data")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' cannot be targeted: {reason}")]
    Unresolvable {
        kind: &'static str,
        id: String,
        reason: &'static str,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("Firewalla API rejected {action}: {source}")]
    Rejected {
        action: &'static str,
        #[source]
        source: ApiError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Pause,
    Resume,
}

impl RuleAction {
    fn path_segment(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults<T> {
    pub results: Vec<T>,
    pub count: usize,
}

impl<T> From<Vec<T>> for SearchResults<T> {
    fn from(results: Vec<T>) -> Self {
        Self {
            count: results.len(),
            results,
        }
    }
}

pub async fn pause_rule(coord: &Coordinator, rule_id: &str) -> Result<(), ActionError> {
    set_rule(coord, rule_id, RuleAction::Pause).await
}

pub async fn resume_rule(coord: &Coordinator, rule_id: &str) -> Result<(), ActionError> {
    set_rule(coord, rule_id, RuleAction::Resume).await
}

/// Pause an active rule, resume anything else.
pub async fn toggle_rule(coord: &Coordinator, rule_id: &str) -> Result<RuleAction, ActionError> {
    let active = coord
        .cached()
        .await
        .and_then(|s| s.rule(rule_id).map(|r| r.is_active()))
        .ok_or_else(|| not_found("rule", rule_id))?;
    let action = if active {
        RuleAction::Pause
    } else {
        RuleAction::Resume
    };
    set_rule(coord, rule_id, action).await?;
    Ok(action)
}

async fn set_rule(
    coord: &Coordinator,
    rule_id: &str,
    action: RuleAction,
) -> Result<(), ActionError> {
    let snapshot = coord.cached().await;
    let rule = snapshot
        .as_deref()
        .and_then(|s| s.rule(rule_id))
        .ok_or_else(|| not_found("rule", rule_id))?;

    let path = format!("rules/{}/{}", rule.id, action.path_segment());
    let label = match action {
        RuleAction::Pause => "pause_rule",
        RuleAction::Resume => "resume_rule",
    };
    call(coord, label, Method::POST, &path, None).await?;
    info!(entry_id = %coord.entry_id(), rule_id = %rule.id, action = %action, "rule updated");

    coord.request_refresh().await;
    Ok(())
}

pub async fn delete_alarm(coord: &Coordinator, alarm_id: &str) -> Result<(), ActionError> {
    let snapshot = coord.cached().await;
    let alarm = snapshot
        .as_deref()
        .and_then(|s| s.alarm(alarm_id))
        .ok_or_else(|| not_found("alarm", alarm_id))?;
    let (gid, aid) = match (&alarm.gid, &alarm.aid) {
        (Some(gid), Some(aid)) => (gid, aid),
        _ => {
            return Err(ActionError::Unresolvable {
                kind: "alarm",
                id: alarm_id.to_string(),
                reason: "missing box gid or alarm aid",
            })
        }
    };

    let path = format!("alarms/{}/{}", gid, aid);
    call(coord, "delete_alarm", Method::DELETE, &path, None).await?;
    info!(entry_id = %coord.entry_id(), alarm_id = %alarm.id, "alarm deleted");

    coord.request_refresh().await;
    Ok(())
}

pub async fn rename_device(
    coord: &Coordinator,
    device_id: &str,
    name: &str,
) -> Result<(), ActionError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ActionError::InvalidInput("device name must not be empty".into()));
    }

    let snapshot = coord.cached().await;
    let device = snapshot
        .as_deref()
        .and_then(|s| s.device(device_id))
        .ok_or_else(|| not_found("device", device_id))?;
    let gid = device.box_gid.as_deref().ok_or_else(|| ActionError::Unresolvable {
        kind: "device",
        id: device_id.to_string(),
        reason: "owning box is unknown",
    })?;

    let path = format!("boxes/{}/devices/{}", gid, device.id);
    let body = json!({ "name": name });
    call(coord, "rename_device", Method::PATCH, &path, Some(&body)).await?;
    info!(entry_id = %coord.entry_id(), device_id = %device.id, new_name = %name, "device renamed");

    coord.request_refresh().await;
    Ok(())
}

pub async fn search_alarms(
    gw: &dyn Gateway,
    query: &str,
    limit: Option<usize>,
) -> Result<SearchResults<Alarm>, ActionError> {
    let limit = search_limit(limit)?;
    fetch::search_alarms(gw, query, limit)
        .await
        .map(SearchResults::from)
        .map_err(|source| ActionError::Rejected {
            action: "search_alarms",
            source,
        })
}

pub async fn search_flows(
    gw: &dyn Gateway,
    query: &str,
    limit: Option<usize>,
) -> Result<SearchResults<Flow>, ActionError> {
    let limit = search_limit(limit)?;
    fetch::search_flows(gw, query, limit)
        .await
        .map(SearchResults::from)
        .map_err(|source| ActionError::Rejected {
            action: "search_flows",
            source,
        })
}

fn search_limit(limit: Option<usize>) -> Result<usize, ActionError> {
    match limit.unwrap_or(DEFAULT_SEARCH_LIMIT) {
        0 => Err(ActionError::InvalidInput("limit must be at least 1".into())),
        n if n > MAX_SEARCH_LIMIT => Err(ActionError::InvalidInput(format!(
            "limit must not exceed {}",
            MAX_SEARCH_LIMIT
        ))),
        n => Ok(n),
    }
}

async fn call(
    coord: &Coordinator,
    action: &'static str,
    method: Method,
    path: &str,
    body: Option<&serde_json::Value>,
) -> Result<(), ActionError> {
    coord
        .gateway()
        .call(method, path, &[], body)
        .await
        .map(|_| ())
        .map_err(|source| {
            error!(entry_id = %coord.entry_id(), action, error = %source, "action rejected");
            ActionError::Rejected { action, source }
        })
}

fn not_found(kind: &'static str, id: &str) -> ActionError {
    ActionError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::coordinator::CoordinatorOptions;
    use crate::domain::testing::{harness, Harness};
    use crate::msp::testing::FakeGateway;
    use serde_json::json;

    async fn primed() -> Harness {
        let gw = FakeGateway::new();
        gw.respond("GET boxes", json!([{"gid": "g1", "online": true}]));
        gw.respond(
            "GET devices",
            json!([{"mac": "AA:BB", "gid": "g1", "name": "Phone"}, {"mac": "CC:DD"}]),
        );
        gw.respond(
            "GET rules",
            json!([{"id": "r1", "status": "active"}, {"id": "r2", "status": "paused"}]),
        );
        gw.respond(
            "GET alarms",
            json!({"results": [{"aid": 9, "gid": "g1"}, {"id": "orphan"}]}),
        );
        let options = CoordinatorOptions {
            enable_rules: true,
            enable_alarms: true,
            ..Default::default()
        };
        let h = harness(gw, options);
        h.coordinator.refresh().await.unwrap();
        h
    }

    fn boxes_fetches(h: &Harness) -> usize {
        h.gateway.calls_to(Method::GET, "boxes")
    }

    #[tokio::test]
    async fn rename_unknown_device_issues_no_call() {
        let h = primed().await;
        let before = h.gateway.calls().len();

        let err = rename_device(&h.coordinator, "EE:FF", "NewName").await.unwrap_err();
        assert!(matches!(err, ActionError::NotFound { kind: "device", .. }));
        assert_eq!(h.gateway.calls().len(), before);
    }

    #[tokio::test]
    async fn rename_without_cache_is_not_found() {
        let h = harness(FakeGateway::new(), CoordinatorOptions::default());
        let err = rename_device(&h.coordinator, "AA:BB", "NewName").await.unwrap_err();
        assert!(matches!(err, ActionError::NotFound { .. }));
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn rename_patches_and_refreshes() {
        let h = primed().await;
        h.gateway.respond("PATCH boxes/g1/devices/AA:BB", json!({"name": "NewName"}));

        rename_device(&h.coordinator, "mac:AA:BB", "  NewName ").await.unwrap();

        let patch = h
            .gateway
            .calls()
            .into_iter()
            .find(|c| c.method == Method::PATCH)
            .unwrap();
        assert_eq!(patch.path, "boxes/g1/devices/AA:BB");
        assert_eq!(patch.body, Some(json!({"name": "NewName"})));
        assert_eq!(boxes_fetches(&h), 2);
    }

    #[tokio::test]
    async fn rename_validates_input_and_ownership() {
        let h = primed().await;
        assert!(matches!(
            rename_device(&h.coordinator, "AA:BB", "   ").await,
            Err(ActionError::InvalidInput(_))
        ));
        assert!(matches!(
            rename_device(&h.coordinator, "CC:DD", "Tablet").await,
            Err(ActionError::Unresolvable { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_call_surfaces_api_error_without_refresh() {
        let h = primed().await;
        h.gateway.fail(
            "POST rules/r1/pause",
            ApiError::Status {
                url: "fake://rules/r1/pause".into(),
                status: 403,
                body: "forbidden".into(),
            },
        );

        let err = pause_rule(&h.coordinator, "r1").await.unwrap_err();
        assert!(matches!(err, ActionError::Rejected { action: "pause_rule", .. }));
        assert_eq!(boxes_fetches(&h), 1);
    }

    #[tokio::test]
    async fn toggle_picks_direction_from_status() {
        let h = primed().await;
        h.gateway.respond("POST rules/r1/pause", json!({}));
        h.gateway.respond("POST rules/r2/resume", json!({}));

        assert_eq!(toggle_rule(&h.coordinator, "r1").await.unwrap(), RuleAction::Pause);
        assert_eq!(toggle_rule(&h.coordinator, "r2").await.unwrap(), RuleAction::Resume);
        assert!(matches!(
            toggle_rule(&h.coordinator, "r404").await,
            Err(ActionError::NotFound { kind: "rule", .. })
        ));
    }

    #[tokio::test]
    async fn delete_alarm_resolves_gid_and_aid() {
        let h = primed().await;
        h.gateway.respond("DELETE alarms/g1/9", serde_json::Value::Null);

        delete_alarm(&h.coordinator, "9").await.unwrap();
        assert_eq!(h.gateway.calls_to(Method::DELETE, "alarms/g1/9"), 1);

        assert!(matches!(
            delete_alarm(&h.coordinator, "orphan").await,
            Err(ActionError::Unresolvable { .. })
        ));
    }

    #[tokio::test]
    async fn search_bypasses_cache() {
        let h = primed().await;
        h.gateway.respond(
            "GET alarms",
            json!({"results": [{"aid": 1}, {"aid": 2}], "next_cursor": "n"}),
        );
        h.gateway.respond("GET alarms#n", json!({"results": [{"aid": 3}]}));
        let cached_before = h.coordinator.cached().await.unwrap();

        let found = search_alarms(h.coordinator.gateway(), "type:video", Some(10))
            .await
            .unwrap();
        assert_eq!(found.count, 3);
        assert_eq!(found.results.len(), 3);

        let cached_after = h.coordinator.cached().await.unwrap();
        assert!(std::sync::Arc::ptr_eq(&cached_before, &cached_after));
    }

    #[tokio::test]
    async fn search_limit_bounds() {
        let gw = FakeGateway::new();
        assert!(matches!(
            search_flows(&gw, "", Some(201)).await,
            Err(ActionError::InvalidInput(_))
        ));
        assert!(matches!(
            search_flows(&gw, "", Some(0)).await,
            Err(ActionError::InvalidInput(_))
        ));
        assert!(gw.calls().is_empty());
    }
}
