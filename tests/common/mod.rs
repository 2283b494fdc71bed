#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Multipart, State},
    http::StatusCode,
    routing::post,
};
use serde_json::Value;
use tokio::net::TcpListener;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub struct ReceivedField {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl ReceivedField {
    pub fn text(&self) -> String {
        String::from_utf8(self.data.clone()).unwrap()
    }
}

struct ServerState {
    status: StatusCode,
    body: Value,
    received: Mutex<Vec<ReceivedField>>,
}

/// 1種類の応答だけを返すファイナライザのHTTPサーバー
pub struct FinalizerServer {
    pub url: String,
    state: Arc<ServerState>,
}

impl FinalizerServer {
    pub async fn start(status: StatusCode, body: Value) -> Self {
        let state = Arc::new(ServerState {
            status,
            body,
            received: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/finalize", post(finalize))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/finalize", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        FinalizerServer { url, state }
    }

    pub fn received(&self) -> Vec<ReceivedField> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn field(&self, name: &str) -> Option<ReceivedField> {
        self.received().into_iter().find(|f| f.name == name)
    }
}

async fn finalize(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.unwrap().to_vec();
        state.received.lock().unwrap().push(ReceivedField {
            name,
            file_name,
            content_type,
            data,
        });
    }
    (state.status, Json(state.body.clone()))
}
