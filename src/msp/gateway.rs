//! Authenticated transport for the Firewalla MSP v2 API.
//!
//! `Gateway::call` returns the decoded body untouched. The provided `get`
//! unwraps `{results: [...]}` / `{data: [...]}` envelopes for simple list
//! calls, and `get_page` keeps the `next_cursor` for callers that paginate.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::error::ApiError;

pub const DEFAULT_BASE_URL: &str = "https://api.firewalla.net/v2";

const MAX_ERROR_BODY: usize = 512;

/// One page of a cursor-paginated list response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

impl Page {
    /// Interpret a raw response as a page. `None` when the shape is not a
    /// list or an envelope around one.
    pub fn from_raw(raw: Value) -> Option<Self> {
        match raw {
            Value::Array(items) => Some(Self {
                items,
                next_cursor: None,
            }),
            Value::Object(mut map) => {
                let next_cursor = map
                    .get("next_cursor")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string);
                let items = match map.remove("results").or_else(|| map.remove("data")) {
                    Some(Value::Array(items)) => items,
                    _ => return None,
                };
                Some(Self { items, next_cursor })
            }
            _ => None,
        }
    }
}

/// Strip a `{results: …}` or `{data: …}` wrapper if present.
pub fn unwrap_envelope(raw: Value) -> Value {
    match raw {
        Value::Object(mut map) if map.contains_key("results") || map.contains_key("data") => map
            .remove("results")
            .or_else(|| map.remove("data"))
            .unwrap_or(Value::Null),
        other => other,
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Perform one authenticated call and decode its JSON body as-is.
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError>;

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        let raw = self.call(Method::GET, path, query, None).await?;
        Ok(unwrap_envelope(raw))
    }

    /// Raw variant of `get` that keeps the pagination cursor.
    async fn get_page(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Page>, ApiError> {
        let raw = self.call(Method::GET, path, query, None).await?;
        Ok(Page::from_raw(raw))
    }
}

/// reqwest-backed gateway with bearer-token authentication.
pub struct HttpGateway {
    base_url: String,
    token: String,
    http: Client,
}

impl HttpGateway {
    pub fn new(token: &str, subdomain: Option<&str>, timeout: Duration) -> Result<Self> {
        Self::with_base_url(&base_url_for(subdomain), token, timeout)
    }

    pub fn with_base_url(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("building MSP HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// `https://{subdomain}.firewalla.net/v2`, or the fixed default host.
pub fn base_url_for(subdomain: Option<&str>) -> String {
    match subdomain.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sub) => format!("https://{}.firewalla.net/v2", sub),
        None => DEFAULT_BASE_URL.to_string(),
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(method = %method, url = %url, "MSP request");

        let mut req = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| transport_error(&url, e))?;
        let status = resp.status();
        let html_content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/html"));
        let text = resp.text().await.map_err(|e| transport_error(&url, e))?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized { url });
        }
        if html_content_type || looks_like_html(&text) {
            return Err(ApiError::HtmlResponse { url });
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
                body: truncate(&text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text).map_err(|e| ApiError::InvalidJson {
            url,
            message: e.to_string(),
        })
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout {
            url: url.to_string(),
        }
    } else {
        ApiError::Connection {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

fn looks_like_html(text: &str) -> bool {
    let head: String = text.trim_start().chars().take(64).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_ERROR_BODY).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{Html, IntoResponse};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v2", addr)
    }

    fn fake_msp() -> Router {
        Router::new()
            .route(
                "/v2/boxes",
                get(|| async { Json(json!({"results": [{"gid": "g1"}]})) }),
            )
            .route(
                "/v2/devices",
                get(|| async { Json(json!({"data": [{"mac": "AA:BB"}]})) }),
            )
            .route(
                "/v2/alarms",
                get(|| async { Json(json!({"results": [{"aid": 1}], "next_cursor": "c2"})) }),
            )
            .route(
                "/v2/echo",
                get(|headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({ "authorization": auth }))
                }),
            )
            .route(
                "/v2/login",
                get(|| async { Html("<html><body>Sign in</body></html>") }),
            )
            .route(
                "/v2/unauthorized",
                get(|| async { (AxumStatus::UNAUTHORIZED, "bad token").into_response() }),
            )
            .route(
                "/v2/broken",
                get(|| async { "this is not json" }),
            )
            .route(
                "/v2/fail",
                get(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom").into_response() }),
            )
    }

    async fn gateway() -> HttpGateway {
        let base = serve(fake_msp()).await;
        HttpGateway::with_base_url(&base, "secret", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn base_url_from_subdomain() {
        assert_eq!(base_url_for(Some("acme")), "https://acme.firewalla.net/v2");
        assert_eq!(base_url_for(Some("  ")), DEFAULT_BASE_URL);
        assert_eq!(base_url_for(None), DEFAULT_BASE_URL);
    }

    #[test]
    fn page_shapes() {
        let page = Page::from_raw(json!({"results": [1, 2], "next_cursor": "x"})).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("x"));

        let page = Page::from_raw(json!({"results": [], "next_cursor": ""})).unwrap();
        assert!(page.next_cursor.is_none());

        assert!(Page::from_raw(json!([1])).unwrap().next_cursor.is_none());
        assert!(Page::from_raw(json!({"message": "nope"})).is_none());
        assert!(Page::from_raw(json!("text")).is_none());
    }

    #[tokio::test]
    async fn attaches_token_header() {
        let gw = gateway().await;
        let body = gw.get("echo", &[]).await.unwrap();
        assert_eq!(body["authorization"], "Token secret");
    }

    #[tokio::test]
    async fn unwraps_envelopes() {
        let gw = gateway().await;
        assert_eq!(gw.get("boxes", &[]).await.unwrap(), json!([{"gid": "g1"}]));
        assert_eq!(gw.get("devices", &[]).await.unwrap(), json!([{"mac": "AA:BB"}]));

        let page = gw.get_page("alarms", &[]).await.unwrap().unwrap();
        assert_eq!(page.items, vec![json!({"aid": 1})]);
        assert_eq!(page.next_cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn classifies_failures() {
        let gw = gateway().await;

        let err = gw.get("login", &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::HtmlResponse { .. }));
        assert!(err.is_auth());

        let err = gw.get("unauthorized", &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized { .. }));

        let err = gw.get("broken", &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidJson { .. }));

        let err = gw.get("fail", &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, .. }));
        assert!(!err.is_auth());
    }

    #[tokio::test]
    async fn connection_failure_is_transient() {
        let gw = HttpGateway::with_base_url("http://127.0.0.1:1/v2", "t", Duration::from_secs(2))
            .unwrap();
        let err = gw.get("boxes", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Connection { .. } | ApiError::Timeout { .. }
        ));
    }
}
