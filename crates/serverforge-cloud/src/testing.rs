//! In-process mock of a vendor JSON API for driver tests
//!
//! Routes match on method and path (query strings are ignored for matching
//! but recorded). The most recently registered route wins, so a test can
//! override a default response. Unmatched requests get a 404.

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct MockRoute {
    method: String,
    path: String,
    status: u16,
    body: String,
}

/// A request received by the mock server
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub body: String,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Default)]
struct MockState {
    routes: Mutex<Vec<MockRoute>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Mock vendor API bound to an ephemeral localhost port
pub struct MockApi {
    base_url: String,
    state: Arc<MockState>,
}

impl MockApi {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());

        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(e) => panic!("failed to bind mock API listener: {e}"),
        };
        let base_url = match listener.local_addr() {
            Ok(addr) => format!("http://{}", addr),
            Err(e) => panic!("mock API listener has no address: {e}"),
        };

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { base_url, state }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register a JSON response
    pub fn route(&self, method: &str, path: &str, status: u16, body: serde_json::Value) -> &Self {
        self.route_raw(method, path, status, &body.to_string())
    }

    /// Register a raw response body
    pub fn route_raw(&self, method: &str, path: &str, status: u16, body: &str) -> &Self {
        if let Ok(mut routes) = self.state.routes.lock() {
            routes.push(MockRoute {
                method: method.to_ascii_uppercase(),
                path: path.to_string(),
                status,
                body: body.to_string(),
            });
        }
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let recorded = RecordedRequest {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    };

    let route = state.routes.lock().ok().and_then(|routes| {
        routes
            .iter()
            .rev()
            .find(|r| r.method == recorded.method && r.path == recorded.path)
            .cloned()
    });

    if let Ok(mut requests) = state.requests.lock() {
        requests.push(recorded);
    }

    match route {
        Some(route) => (
            StatusCode::from_u16(route.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            [(header::CONTENT_TYPE, "application/json")],
            route.body,
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"error":"not_found"}"#.to_string(),
        )
            .into_response(),
    }
}
