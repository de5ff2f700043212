//! Endpoint fetchers: typed accessors that turn gateway responses into
//! canonical records.
//!
//! A response with an unexpected shape is logged and read as an empty
//! collection. Transport and status failures are returned to the caller,
//! which decides whether a cached value stands in.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::ApiError;
use super::gateway::Gateway;
use super::records::{
    ensure_unique_ids, Alarm, BoxRecord, Device, Flow, Identified, Rule, SimpleStats, TargetList,
};

pub const ACTIVE_ALARMS_QUERY: &str = "status:active";

/// Safety valve for alarm pagination (about 4000 records). Alarms beyond
/// this many pages are silently not fetched.
pub const ALARM_PAGE_CAP: usize = 20;

/// Page cap for ad-hoc searches.
pub const SEARCH_PAGE_CAP: usize = 10;

pub const DEFAULT_FLOW_LIMIT: u32 = 200;

pub async fn boxes(gw: &dyn Gateway) -> Result<Vec<BoxRecord>, ApiError> {
    let raw = gw.get("boxes", &[]).await?;
    let boxes = normalize(list_items(raw, "boxes"), BoxRecord::from_raw);
    debug!(count = boxes.len(), "fetched boxes");
    Ok(boxes)
}

pub async fn devices(gw: &dyn Gateway, now: DateTime<Utc>) -> Result<Vec<Device>, ApiError> {
    let raw = gw.get("devices", &[]).await?;
    let devices = normalize(list_items(raw, "devices"), |item, index| {
        Device::from_raw(item, index, now)
    });
    debug!(count = devices.len(), "fetched devices");
    Ok(devices)
}

pub async fn rules(gw: &dyn Gateway) -> Result<Vec<Rule>, ApiError> {
    let raw = gw.get("rules", &[]).await?;
    Ok(normalize(list_items(raw, "rules"), Rule::from_raw))
}

/// Active alarms, following `next_cursor` up to `ALARM_PAGE_CAP` pages.
pub async fn active_alarms(gw: &dyn Gateway) -> Result<Vec<Alarm>, ApiError> {
    let items = collect_pages(
        gw,
        "alarms",
        &[("query", ACTIVE_ALARMS_QUERY.to_string())],
        ALARM_PAGE_CAP,
        None,
    )
    .await?;
    Ok(normalize(items, Alarm::from_raw))
}

/// First page of flows only; steady-state polling never walks the cursor.
pub async fn flows(
    gw: &dyn Gateway,
    limit: u32,
    cursor: Option<&str>,
) -> Result<Vec<Flow>, ApiError> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(cursor) = cursor {
        query.push(("cursor", cursor.to_string()));
    }
    let items = match gw.get_page("flows", &query).await? {
        Some(page) => page.items,
        None => {
            warn!(category = "flows", "unexpected response shape, treating as empty");
            Vec::new()
        }
    };
    Ok(normalize(items, Flow::from_raw))
}

pub async fn target_lists(gw: &dyn Gateway) -> Result<Vec<TargetList>, ApiError> {
    let raw = gw.get("target-lists", &[]).await?;
    Ok(normalize(list_items(raw, "target_lists"), TargetList::from_raw))
}

pub async fn simple_stats(gw: &dyn Gateway) -> Result<SimpleStats, ApiError> {
    let raw = gw.get("stats/simple", &[]).await?;
    match serde_json::from_value(raw) {
        Ok(stats) => Ok(stats),
        Err(e) => {
            warn!(category = "stats", error = %e, "unexpected response shape, treating as empty");
            Ok(SimpleStats::default())
        }
    }
}

/// Ad-hoc alarm search, bounded by `limit` records and `SEARCH_PAGE_CAP` pages.
pub async fn search_alarms(
    gw: &dyn Gateway,
    query: &str,
    limit: usize,
) -> Result<Vec<Alarm>, ApiError> {
    let params = search_params(query, limit);
    let items = collect_pages(gw, "alarms", &params, SEARCH_PAGE_CAP, Some(limit)).await?;
    Ok(normalize(items, Alarm::from_raw))
}

pub async fn search_flows(
    gw: &dyn Gateway,
    query: &str,
    limit: usize,
) -> Result<Vec<Flow>, ApiError> {
    let params = search_params(query, limit);
    let items = collect_pages(gw, "flows", &params, SEARCH_PAGE_CAP, Some(limit)).await?;
    Ok(normalize(items, Flow::from_raw))
}

/// Verify the token: `boxes` first, `devices` as a fallback.
pub async fn check_credentials(gw: &dyn Gateway) -> Result<(), ApiError> {
    match gw.get("boxes", &[]).await {
        Ok(_) => {
            info!("credential check succeeded against boxes endpoint");
            Ok(())
        }
        Err(boxes_err) => match gw.get("devices", &[]).await {
            Ok(_) => {
                info!("credential check succeeded against devices endpoint");
                Ok(())
            }
            Err(devices_err) if boxes_err.is_auth() || !devices_err.is_auth() => Err(boxes_err),
            Err(devices_err) => Err(devices_err),
        },
    }
}

/// Follow `next_cursor` until it is absent, `page_cap` pages were read, or
/// `item_limit` records were collected. Records keep server order.
pub async fn collect_pages(
    gw: &dyn Gateway,
    path: &str,
    base_query: &[(&str, String)],
    page_cap: usize,
    item_limit: Option<usize>,
) -> Result<Vec<Value>, ApiError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for page_no in 1..=page_cap {
        let mut query = base_query.to_vec();
        if let Some(cursor) = &cursor {
            query.push(("cursor", cursor.clone()));
        }

        let Some(page) = gw.get_page(path, &query).await? else {
            warn!(path, page = page_no, "unexpected page shape, stopping pagination");
            break;
        };
        items.extend(page.items);

        if let Some(limit) = item_limit {
            if items.len() >= limit {
                items.truncate(limit);
                break;
            }
        }

        match page.next_cursor {
            Some(next) if page_no < page_cap => cursor = Some(next),
            Some(_) => {
                warn!(path, page_cap, "page cap reached, remaining pages not fetched");
            }
            None => break,
        }
    }

    Ok(items)
}

fn search_params(query: &str, limit: usize) -> Vec<(&'static str, String)> {
    let mut params = vec![("limit", limit.to_string())];
    if !query.trim().is_empty() {
        params.push(("query", query.trim().to_string()));
    }
    params
}

fn list_items(raw: Value, category: &str) -> Vec<Value> {
    match raw {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => {
            warn!(
                category,
                response = %truncate_json(&other),
                "unexpected response shape, treating as empty"
            );
            Vec::new()
        }
    }
}

fn normalize<T, F>(items: Vec<Value>, build: F) -> Vec<T>
where
    T: Identified,
    F: Fn(&Value, usize) -> Option<T>,
{
    let mut records: Vec<T> = items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| build(item, index))
        .collect();
    ensure_unique_ids(&mut records);
    records
}

fn truncate_json(value: &Value) -> String {
    value.to_string().chars().take(200).collect()
}
