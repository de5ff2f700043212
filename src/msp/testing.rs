//! In-process gateway fake for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use super::error::ApiError;
use super::gateway::Gateway;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RecordedCall {
    pub fn query_value(&self, key: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

/// Canned responses keyed by `"METHOD path"`, or `"METHOD path#cursor"`
/// for follow-up pages. One-shot failures queued with `fail_once` are
/// served first. Unknown keys answer 404.
#[derive(Default)]
pub struct FakeGateway {
    responses: Mutex<HashMap<String, Result<Value, ApiError>>>,
    once: Mutex<HashMap<String, VecDeque<ApiError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, key: &str, body: Value) {
        self.responses.lock().unwrap().insert(key.to_string(), Ok(body));
    }

    pub fn fail(&self, key: &str, err: ApiError) {
        self.responses.lock().unwrap().insert(key.to_string(), Err(err));
    }

    pub fn fail_once(&self, key: &str, err: ApiError) {
        self.once
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    pub fn timeout(path: &str) -> ApiError {
        ApiError::Timeout {
            url: format!("fake://{}", path),
        }
    }

    pub fn unauthorized(path: &str) -> ApiError {
        ApiError::Unauthorized {
            url: format!("fake://{}", path),
        }
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let recorded = RecordedCall {
            method: method.clone(),
            path: path.to_string(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            body: body.cloned(),
        };
        let mut key = format!("{} {}", method, path);
        if let Some(cursor) = recorded.query_value("cursor") {
            key = format!("{}#{}", key, cursor);
        }
        self.calls.lock().unwrap().push(recorded);

        if let Some(err) = self
            .once
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        self.responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| {
                Err(ApiError::Status {
                    url: format!("fake://{}", path),
                    status: 404,
                    body: "no canned response".to_string(),
                })
            })
    }
}
