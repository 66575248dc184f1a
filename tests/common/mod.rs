//! 测试用面板替身
//!
//! 单个 `any` 路由按 `action` 查询参数分发，支持 ETag/304 与
//! msgpack 用户列表，并把 push/alive 上报记录下来供断言。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;

#[derive(Default)]
pub struct PanelState {
    pub config: serde_json::Value,
    pub config_etag: String,
    pub users: serde_json::Value,
    pub users_etag: String,
    pub serve_msgpack: bool,
    pub alive: serde_json::Value,
    pub pushes: Vec<serde_json::Value>,
    pub online_reports: Vec<serde_json::Value>,
    pub config_hits: u32,
    pub not_modified_hits: u32,
}

pub struct MockPanel {
    pub addr: String,
    pub state: Arc<Mutex<PanelState>>,
}

pub async fn start_panel(state: PanelState) -> MockPanel {
    let state = Arc::new(Mutex::new(state));
    let app = axum::Router::new()
        .route("/", any(handle))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockPanel {
        addr: addr.to_string(),
        state,
    }
}

fn if_none_match(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok())
}

async fn handle(
    State(state): State<Arc<Mutex<PanelState>>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let action = params.get("action").cloned().unwrap_or_default();
    let mut s = state.lock().unwrap();
    match action.as_str() {
        "config" => {
            s.config_hits += 1;
            let etag = s.config_etag.clone();
            if !etag.is_empty() && if_none_match(&headers) == Some(etag.as_str()) {
                s.not_modified_hits += 1;
                return StatusCode::NOT_MODIFIED.into_response();
            }
            ([(header::ETAG, etag)], axum::Json(s.config.clone())).into_response()
        }
        "user" => {
            let etag = s.users_etag.clone();
            if !etag.is_empty() && if_none_match(&headers) == Some(etag.as_str()) {
                s.not_modified_hits += 1;
                return StatusCode::NOT_MODIFIED.into_response();
            }
            if s.serve_msgpack {
                let encoded = rmp_serde::to_vec_named(&s.users).unwrap();
                (
                    [
                        (header::ETAG, etag),
                        (header::CONTENT_TYPE, "application/x-msgpack".to_string()),
                    ],
                    encoded,
                )
                    .into_response()
            } else {
                ([(header::ETAG, etag)], axum::Json(s.users.clone())).into_response()
            }
        }
        "alivelist" => axum::Json(s.alive.clone()).into_response(),
        "push" => {
            s.pushes.push(serde_json::from_slice(&body).unwrap_or_default());
            axum::Json(serde_json::json!({"data": true})).into_response()
        }
        "alive" => {
            s.online_reports.push(serde_json::from_slice(&body).unwrap_or_default());
            axum::Json(serde_json::json!({"data": true})).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
