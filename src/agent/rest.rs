use std::collections::BTreeMap;

use axum::extract::{Path, Query, State as ExtractState};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde_json::{json, Value};

use crate::agent::errors::Result;
use crate::agent::state::SharedState;

const API_VTAG: &str = "v0";

fn envelope(data: Value) -> Value {
    json!({ "data": data, "error": null })
}

fn error_envelope(message: &str) -> Value {
    json!({ "data": null, "error": message })
}

async fn check_health(ExtractState(state): ExtractState<SharedState>) -> Json<Value> {
    Json(envelope(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": state.get().service_status(),
        "api_version": env!("CARGO_PKG_VERSION"),
    })))
}

async fn check_action(
    Path(action): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if action == "fail" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(error_envelope("requested failure")),
        );
    }
    let data = json!({
        "path_value": action,
        "query_value": query.get("data"),
        "body_value": body,
    });
    (StatusCode::OK, Json(envelope(data)))
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(&format!("/{API_VTAG}/"), get(check_health))
        .route(&format!("/{API_VTAG}/check/{{action}}"), post(check_action))
        .with_state(state)
}

/// Serve the diagnostics API until the process ends. The health endpoint
/// stays responsive whatever the reconciliation loop is doing.
pub async fn serve(host: &str, port: u16, state: SharedState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("rest api listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::State;

    async fn spawn_server(state: SharedState) -> String {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_check_health_reflects_state() {
        let state = SharedState::new();
        state.set(State::Running);
        let base = spawn_server(state.clone()).await;

        let payload: Value = reqwest::get(format!("{base}/v0/"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(payload["error"].is_null());
        assert_eq!(payload["data"]["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(payload["data"]["status"], "SERVICE_RUNNING");

        state.set(State::Paused);
        let payload: Value = reqwest::get(format!("{base}/v0/"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(payload["data"]["status"], "SERVICE_PAUSED");
    }

    #[tokio::test]
    async fn test_check_action_echoes_input() {
        let base = spawn_server(SharedState::new()).await;
        let body = json!({"a": "foo", "b": "45"});

        let payload: Value = reqwest::Client::new()
            .post(format!("{base}/v0/check/echo?data=value"))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(payload["error"].is_null());
        assert_eq!(payload["data"]["path_value"], "echo");
        assert_eq!(payload["data"]["query_value"], "value");
        assert_eq!(payload["data"]["body_value"], body);
    }

    #[tokio::test]
    async fn test_check_action_fail_returns_error() {
        let base = spawn_server(SharedState::new()).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/v0/check/fail?data=x"))
            .json(&json!({"a": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
        let payload: Value = response.json().await.unwrap();
        assert!(payload["data"].is_null());
        assert!(!payload["error"].is_null());
    }
}
