use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use kiln_core::testing::{provision_checkpoint, provision_lora, StubLoader};
use kiln_core::{IdlePolicy, ModelLayout, Service};
use kiln_server::router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn service(root: &Path, idle_minutes: u64) -> Arc<Service<StubLoader>> {
    Arc::new(Service::new(
        StubLoader::new(),
        ModelLayout::new(root),
        IdlePolicy::from_minutes(idle_minutes),
    ))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Method::GET, uri, None).await
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    send(app, Method::POST, uri, Some(body)).await
}

#[tokio::test]
async fn health_reports_empty_cache() {
    let root = tempfile::tempdir().unwrap();
    let app = router(service(root.path(), 60));

    let (status, body) = get(&app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "no_model_loaded");
    assert_eq!(body["current_model"], Value::Null);
    assert_eq!(body["available_models"], json!(["animagine", "pony", "noobai"]));
    assert_eq!(body["ip_adapter_loaded"], false);
    assert_eq!(body["idle_timeout_minutes"], 60);
    assert_eq!(body["watchdog_enabled"], true);
}

#[tokio::test]
async fn zero_timeout_reports_watchdog_disabled() {
    let root = tempfile::tempdir().unwrap();
    let app = router(service(root.path(), 0));

    let (_, body) = get(&app, "/health").await;

    assert_eq!(body["idle_timeout_minutes"], 0);
    assert_eq!(body["watchdog_enabled"], false);
}

#[tokio::test]
async fn models_show_download_and_load_state() {
    let root = tempfile::tempdir().unwrap();
    provision_checkpoint(root.path(), "pony");
    let app = router(service(root.path(), 60));

    let (status, body) = get(&app, "/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current"], Value::Null);
    assert_eq!(body["models"]["pony"]["downloaded"], true);
    assert_eq!(body["models"]["pony"]["loaded"], false);
    assert_eq!(body["models"]["noobai"]["downloaded"], false);
    assert_eq!(body["models"]["noobai"]["default_cfg"], 5.5);
    assert_eq!(body["models"]["noobai"]["default_steps"], 28);

    let (status, body) = post(&app, "/switch-model", json!({ "model": "pony" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "model": "pony" }));

    let (_, body) = get(&app, "/models").await;
    assert_eq!(body["current"], "pony");
    assert_eq!(body["models"]["pony"]["loaded"], true);
    let (_, body) = get(&app, "/health").await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["current_model"], "pony");
}

#[tokio::test]
async fn switch_model_failures_use_distinct_statuses() {
    let root = tempfile::tempdir().unwrap();
    let app = router(service(root.path(), 60));

    let (status, body) = post(&app, "/switch-model", json!({ "model": "sd15" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("sd15"), "{detail}");
    assert!(detail.contains("animagine"), "{detail}");

    let (status, body) = post(&app, "/switch-model", json!({ "model": "noobai" })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["detail"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn loras_lists_provisioned_files() {
    let root = tempfile::tempdir().unwrap();
    provision_lora(root.path(), "watercolor");
    provision_lora(root.path(), "ink_sketch");
    let app = router(service(root.path(), 60));

    let (status, body) = get(&app, "/loras").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "loras": ["ink_sketch", "watercolor"] }));
}

#[tokio::test]
async fn generate_is_reproducible_with_a_seed() {
    let root = tempfile::tempdir().unwrap();
    provision_checkpoint(root.path(), "animagine");
    let app = router(service(root.path(), 60));
    let request = json!({ "prompt": "a lighthouse at dusk", "seed": 1234 });

    let (status, first) = post(&app, "/generate", request.clone()).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    let (_, second) = post(&app, "/generate", request).await;

    assert_eq!(first["seed"], 1234);
    assert_eq!(first["image"], second["image"]);
    let png = BASE64_STANDARD
        .decode(first["image"].as_str().unwrap())
        .unwrap();
    assert!(png.starts_with(b"\x89PNG"));

    let parameters = &first["parameters"];
    assert_eq!(parameters["model"], "animagine");
    assert_eq!(parameters["steps"], 28);
    assert_eq!(parameters["cfg_scale"], 5.0);
    assert_eq!(parameters["width"], 1024);
    assert!(parameters.get("lora_name").is_none());
    assert!(parameters.get("ip_adapter_scale").is_none());
}

#[tokio::test]
async fn generate_rejects_invalid_bodies() {
    let root = tempfile::tempdir().unwrap();
    let app = router(service(root.path(), 60));

    let (status, body) = post(&app, "/generate", json!({ "prompt": "x", "steps": 0 })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].as_str().unwrap().contains("steps"));

    let (status, body) = post(&app, "/generate", json!({ "width": 1024 })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].as_str().unwrap().contains("prompt"));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/generate")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn generate_model_failures_use_distinct_statuses() {
    let root = tempfile::tempdir().unwrap();
    let app = router(service(root.path(), 60));

    let (status, body) = post(&app, "/generate", json!({ "prompt": "x", "model": "sd15" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("sd15"), "{detail}");
    assert!(detail.contains("animagine"), "{detail}");

    let (status, body) = post(&app, "/generate", json!({ "prompt": "x", "model": "noobai" })).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["detail"].as_str().unwrap().contains("not found"));

    let (_, health) = get(&app, "/health").await;
    assert_eq!(health["current_model"], Value::Null);
}

#[tokio::test]
async fn generate_rejects_unknown_lora() {
    let root = tempfile::tempdir().unwrap();
    provision_checkpoint(root.path(), "animagine");
    provision_lora(root.path(), "watercolor");
    let app = router(service(root.path(), 60));

    let (status, body) = post(
        &app,
        "/generate",
        json!({ "prompt": "a fox", "lora_name": "oil_paint" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("oil_paint"), "{detail}");
    assert!(detail.contains("watercolor"), "{detail}");
}

#[tokio::test]
async fn generate_reports_lora_in_parameters() {
    let root = tempfile::tempdir().unwrap();
    provision_checkpoint(root.path(), "animagine");
    provision_lora(root.path(), "watercolor");
    let app = router(service(root.path(), 60));

    let (status, body) = post(
        &app,
        "/generate",
        json!({ "prompt": "a fox", "seed": 7, "lora_name": "watercolor", "lora_scale": 1.2 }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["parameters"]["lora_name"], "watercolor");
    assert_eq!(body["parameters"]["lora_scale"], 1.2);
}

#[tokio::test(start_paused = true)]
async fn requests_reset_the_idle_clock() {
    let root = tempfile::tempdir().unwrap();
    let service = service(root.path(), 60);
    let clock = service.clock().clone();
    let app = router(service);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(clock.idle(), Duration::from_secs(30));

    let (status, _) = get(&app, "/models").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(clock.idle(), Duration::ZERO);
}
