//! In-process HTTP server that records every request it receives.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use tokio::task::JoinHandle;

use tsuru_core::config::CoreSettings;
use tsuru_core::Services;
use tsuru_types::Service;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decoded form or query pairs.
    pub fn form(&self) -> Vec<(String, String)> {
        let raw = if self.method == Method::GET {
            self.query.clone().unwrap_or_default()
        } else {
            self.body.clone()
        };
        url::form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .collect()
    }

    pub fn form_value(&self, key: &str) -> Option<String> {
        self.form().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

pub type Responder = Arc<dyn Fn(&Recorded) -> (StatusCode, String) + Send + Sync>;

#[derive(Clone)]
struct MockState {
    requests: Arc<Mutex<Vec<Recorded>>>,
    responder: Responder,
}

pub struct MockServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(responder: Responder) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            requests: requests.clone(),
            responder,
        };
        let app = Router::new().fallback(record).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            requests,
            handle,
        }
    }

    /// Answers 200 with an empty body to everything.
    pub async fn ok() -> Self {
        Self::start(Arc::new(|_| (StatusCode::OK, String::new()))).await
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn matching(&self, method: Method, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    /// Polls until at least `n` requests arrived.
    pub async fn wait_for(&self, n: usize) -> Vec<Recorded> {
        for _ in 0..200 {
            let requests = self.requests();
            if requests.len() >= n {
                return requests;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {n} requests, got {:?}", self.requests());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn record(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let recorded = Recorded {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let response = (state.responder)(&recorded);
    state.requests.lock().unwrap().push(recorded);
    response
}

// ── Fixtures ──

pub fn services() -> Services {
    Services::in_memory(CoreSettings::default()).unwrap()
}

/// Registers an endpoint-backed service pointing at `url`.
pub async fn register_service(services: &Services, name: &str, url: &str) {
    services
        .service_store
        .create(Service {
            name: name.to_string(),
            password: "abcde".to_string(),
            endpoint: [("production".to_string(), url.to_string())].into(),
            owner_teams: vec!["tsuruteam".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
}
