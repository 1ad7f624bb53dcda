//! Router behavior that does not need a live key-value store: validation,
//! model registration, compatibility checks, error mapping.

#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use modelrelay::app::Gateway;
use modelrelay::config::Settings;
use modelrelay::dispatch::{Dispatcher, WebhookDelivery};
use modelrelay::gpu::{GpuGuard, StaticProbe, VramMonitor};
use modelrelay::http::{AppState, router};
use modelrelay::presets::{
    LocalModelPreset, LocalProviderConfig, ModelDefaultsCatalog, PresetCatalog,
};
use modelrelay::providers::registry::RegistryConfig;
use modelrelay::providers::{EchoProvider, ModelResidency, ProviderRegistry};
use modelrelay::store::{ConversationStore, RedisHandle, StoreConfig, TaskStore};
use modelrelay_events::EventBus;
use serde_json::{Value, json};
use tower::ServiceExt;

/// An app wired exactly like the binary, but with a fixed-value GPU probe
/// and a key-value endpoint that refuses connections (port 1).
async fn test_app() -> Router {
    let settings = Settings {
        redis_url: "redis://127.0.0.1:1/0".to_string(),
        ..Settings::default()
    };
    let handle = Arc::new(RedisHandle::open(&settings.redis_url).unwrap());
    let store = Arc::new(TaskStore::new(Arc::clone(&handle), StoreConfig::default()));
    let conversations = Arc::new(ConversationStore::new(Arc::clone(&handle), 24 * 3600));

    let catalog = Arc::new(PresetCatalog::new());
    catalog.register_local(LocalModelPreset {
        name: "tiny-7b".to_string(),
        huggingface_repo: "org/tiny".to_string(),
        filename: "tiny-7b-q4_k_m.gguf".to_string(),
        size_b: 7.0,
        vram_requirements: [
            ("q4_k_m".to_string(), 5_500),
            ("q8_0".to_string(), 9_000),
            ("fp16".to_string(), 14_000),
        ]
        .into_iter()
        .collect(),
        provider_config: LocalProviderConfig::default(),
        autoload: false,
    });
    catalog.register_local(LocalModelPreset {
        name: "huge-70b".to_string(),
        huggingface_repo: "org/huge".to_string(),
        filename: "huge-70b-q4_k_m.gguf".to_string(),
        size_b: 70.0,
        vram_requirements: Default::default(),
        provider_config: LocalProviderConfig::default(),
        autoload: false,
    });
    let registry = Arc::new(ProviderRegistry::new(
        Arc::clone(&catalog),
        RegistryConfig {
            models_dir: "/tmp/models".to_string(),
            http_timeout: Duration::from_secs(5),
            http_max_retries: 0,
            cloud: settings.cloud.clone(),
        },
    ));

    // 24 GB card, 4 GB used, 95% cap, 1 GB reserve -> 17776 MB allocatable.
    let monitor = Arc::new(VramMonitor::new(
        Box::new(StaticProbe::new(24_000, 4_000)),
        0,
        95,
        1024,
    ));
    let guard = Arc::new(GpuGuard::new(Arc::clone(&monitor)));
    let bus = EventBus::new(64);
    let residency = Arc::new(ModelResidency::new(Arc::clone(&monitor), bus.clone()));
    let webhooks = Arc::new(WebhookDelivery::new(Duration::from_secs(1), 0).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&conversations),
        Arc::clone(&registry),
        Arc::clone(&residency),
        Arc::clone(&guard),
        webhooks,
        bus.clone(),
    ));

    let state = AppState {
        settings: Arc::new(settings),
        store,
        conversations,
        registry: Arc::clone(&registry),
        residency,
        dispatcher,
        guard,
        monitor,
        bus,
        defaults: Arc::new(ModelDefaultsCatalog::with_builtin()),
    };
    // `echo` is pre-registered like in the binary bootstrap.
    registry
        .register("echo", Arc::new(EchoProvider::new()))
        .await
        .unwrap();
    router(state)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn create_task_without_input_is_400_validation() {
    let app = test_app().await;
    let (status, body) = call(
        &app,
        post_json("/api/v1/tasks/", json!({ "model": "echo" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "validation");
}

#[tokio::test]
async fn create_task_with_unknown_model_is_404() {
    let app = test_app().await;
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/tasks/",
            json!({ "model": "no-such-model", "prompt": "hi" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "model_not_found");
    assert_eq!(body["details"]["model"], "no-such-model");
}

#[tokio::test]
async fn create_task_with_bad_temperature_is_400() {
    let app = test_app().await;
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/tasks/",
            json!({ "model": "echo", "prompt": "hi", "temperature": 5.0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "validation");
}

#[tokio::test]
async fn models_listing_includes_presets() {
    let app = test_app().await;
    let (status, body) = call(&app, get("/api/v1/models/")).await;
    assert_eq!(status, StatusCode::OK);
    let presets: Vec<String> =
        serde_json::from_value(body["presets"].clone()).unwrap();
    assert!(presets.contains(&"tiny-7b".to_string()));
}

#[tokio::test]
async fn unknown_model_info_is_404() {
    let app = test_app().await;
    let (status, body) = call(&app, get("/api/v1/models/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "model_not_found");
}

#[tokio::test]
async fn lazy_model_info_from_preset_is_200() {
    let app = test_app().await;
    let (status, body) = call(&app, get("/api/v1/models/tiny-7b")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "local");
    assert_eq!(body["loaded"], false);
}

#[tokio::test]
async fn register_model_twice_is_409() {
    let app = test_app().await;
    let preset = json!({
        "cloud": {
            "name": "my-gpt",
            "provider": "openai",
            "provider_config": { "model_name": "gpt-4-turbo", "api_key": "sk-test" }
        }
    });
    let (status, body) = call(&app, post_json("/api/v1/models/register", preset.clone())).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let (status, body) = call(&app, post_json("/api/v1/models/register", preset)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "conflict");
}

#[tokio::test]
async fn register_with_no_preset_family_is_400() {
    let app = test_app().await;
    let (status, body) = call(&app, post_json("/api/v1/models/register", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "validation");
}

#[tokio::test]
async fn register_from_unknown_preset_is_404() {
    let app = test_app().await;
    let (status, body) = call(
        &app,
        post_json("/api/v1/models/register-from-preset", json!({ "name": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "not_found");
}

#[tokio::test]
async fn compatibility_check_reports_fit_and_recommendation() {
    let app = test_app().await;
    // q4_k_m needs 5500 MB, 17776 MB allocatable -> fits.
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/models/check-compatibility",
            json!({ "name": "tiny-7b" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["compatibility"]["compatible"], true);
    assert_eq!(body["compatibility"]["required_vram_mb"], 5500);

    // A 70B does not fit at any quantization on this card.
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/models/check-compatibility",
            json!({ "name": "huge-70b" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["compatibility"]["compatible"], false, "{body}");
    assert!(body["compatibility"]["recommended_quantization"].is_null());
    assert!(body["compatibility"]["warning"].is_string());
}

#[tokio::test]
async fn compatibility_check_unknown_preset_is_404() {
    let app = test_app().await;
    let (status, _) = call(
        &app,
        post_json(
            "/api/v1/models/check-compatibility",
            json!({ "name": "ghost" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn store_backed_endpoints_surface_infrastructure_unavailable() {
    let app = test_app().await;
    let (status, body) = call(&app, get("/api/v1/tasks/task-123")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "infrastructure_unavailable");
}

#[tokio::test]
async fn health_reports_degraded_without_store() {
    let app = test_app().await;
    let (status, body) = call(&app, get("/api/v1/monitor/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["components"]["store"], false);
    // The static probe keeps the GPU component truthful.
    assert_eq!(body["components"]["gpu"], true);
}

#[tokio::test]
async fn bootstrap_refuses_unreachable_store_in_production() {
    let settings = Settings {
        app_env: "production".parse().unwrap(),
        redis_url: "redis://127.0.0.1:1/0".to_string(),
        presets_dir: "/nonexistent/presets".to_string(),
        ..Settings::default()
    };
    assert!(Gateway::bootstrap(settings).await.is_err());
}
