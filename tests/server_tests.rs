mod common;

use std::sync::Arc;

use actix_web::{http::StatusCode, test, web, App};
use serde_json::{json, Value};

use common::{MockVendor, Reply, TEST_SECRET};
use llmgate::config::GatewayConfig;
use llmgate::server::config_routes;
use llmgate::store::{StoreBackend, TokenFilter, TokenKind, TokenOwner};
use llmgate::store_memory::MemoryStore;
use llmgate::util::AppState;

const ADMIN: &str = "admin-secret";

fn completion() -> Value {
    json!({
        "id": "chatcmpl-9",
        "object": "chat.completion",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": "pong" } }]
    })
}

fn state_with(store: Arc<dyn StoreBackend>, admin_token: Option<&str>) -> AppState {
    let mut config = GatewayConfig::with_secret(TEST_SECRET);
    config.admin_token = admin_token.map(str::to_string);
    config.no_proxy = true;
    config.retry_base_delay_ms = 5;
    config.retry_max_delay_ms = 20;
    AppState::from_config(&config, store).expect("app state")
}

async fn seeded_state(base_url: &str) -> (AppState, Arc<dyn StoreBackend>) {
    let store: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
    let state = state_with(store.clone(), Some(ADMIN));
    state
        .registry
        .upsert(common::vendor_spec("openai", base_url, Some("sk-openai")))
        .await
        .unwrap();
    (state, store)
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state))
                .configure(config_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn composite_model_routes_to_vendor() {
    let mock = MockVendor::start(Reply::Json(completion())).await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "OpenAI__gpt-4o",
            "messages": [{ "role": "user", "content": "ping" }],
            "top_p": 0.5
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("x-llmgate-attempts").unwrap().to_str().unwrap(),
        "1"
    );
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, completion());

    let seen = mock.last_request().await;
    assert_eq!(seen.body["model"], "gpt-4o");
    assert_eq!(seen.body["top_p"], 0.5);
    assert_eq!(seen.authorization.as_deref(), Some("Bearer sk-openai"));
}

#[actix_web::test]
async fn vendor_can_be_named_in_path_or_body() {
    let mock = MockVendor::start(Reply::Json(completion())).await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/vendors/openai/chat/completions")
        .set_json(json!({ "messages": [{ "role": "user", "content": "ping" }] }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    assert_eq!(mock.last_request().await.body["model"], "gpt-test");

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({ "vendor": "openai", "model": "gpt-4o-mini", "prompt": "ping" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    let seen = mock.last_request().await;
    assert_eq!(seen.body["model"], "gpt-4o-mini");
    assert!(seen.body.get("vendor").is_none());
    assert_eq!(mock.hits(), 2);
}

#[actix_web::test]
async fn unknown_vendor_and_bad_model_are_client_errors() {
    let mock = MockVendor::start(Reply::Json(completion())).await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/vendors/unknown-vendor/chat/completions")
        .set_json(json!({ "prompt": "ping" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "vendor_not_found");

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({ "model": "gpt-4o", "prompt": "ping" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(mock.hits(), 0);
}

#[actix_web::test]
async fn vendor_rejection_is_passed_through() {
    let vendor_body = json!({ "error": { "message": "unknown model", "code": "model_not_found" } });
    let mock = MockVendor::start(Reply::Status(404, vendor_body.clone())).await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({ "model": "openai__nope", "prompt": "ping" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, vendor_body);
    assert_eq!(mock.hits(), 1);
}

#[actix_web::test]
async fn exhausted_retries_report_attempts() {
    let mock = MockVendor::start(Reply::Status(502, json!({ "error": "bad gateway" }))).await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({ "model": "openai__gpt-4o", "prompt": "ping" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "dispatch_exhausted");
    assert_eq!(body["error"]["attempts"], 3);
    assert_eq!(mock.hits(), 3);
}

#[actix_web::test]
async fn streaming_passes_vendor_framing_through() {
    let mock = MockVendor::start(Reply::Sse {
        chunks: vec!["data: {\"n\":1}\n\n", "data: {\"n\":2}\n\n", "data: [DONE]\n\n"],
        fail: false,
    })
    .await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({ "model": "openai__gpt-4o", "prompt": "ping", "stream": true }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );
    let body = test::read_body(resp).await;
    assert_eq!(
        std::str::from_utf8(&body).unwrap(),
        "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: [DONE]\n\n"
    );
}

#[actix_web::test]
async fn interrupted_stream_ends_with_error_event() {
    let mock = MockVendor::start(Reply::Sse {
        chunks: vec!["data: {\"n\":1}\n\n"],
        fail: true,
    })
    .await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({ "model": "openai__gpt-4o", "prompt": "ping", "stream": true }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = test::read_body(resp).await;
    let text = std::str::from_utf8(&body).unwrap();
    assert!(text.starts_with("data: {\"n\":1}\n\n"));
    assert!(text.contains("event: error\ndata: "));
    assert!(text.contains("stream_interrupted"));
    assert_eq!(mock.hits(), 1);
}

#[actix_web::test]
async fn models_and_cancel_endpoints() {
    let mock = MockVendor::start(Reply::Json(completion())).await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::get().uri("/v1/models").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["openai__model-a", "openai__model-b"]);

    let req = test::TestRequest::delete()
        .uri("/v1/chat/completions/chatcmpl-7?vendor=openai")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(mock.cancelled().await, vec!["chatcmpl-7".to_string()]);

    let req = test::TestRequest::delete()
        .uri("/v1/chat/completions/chatcmpl-7")
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[actix_web::test]
async fn admin_routes_require_the_admin_token() {
    let store: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
    let app = app!(state_with(store.clone(), Some(ADMIN)));

    let req = test::TestRequest::get().uri("/admin/vendors").to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::UNAUTHORIZED
    );
    let req = test::TestRequest::get()
        .uri("/admin/vendors")
        .insert_header(("authorization", "Bearer wrong"))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let disabled = app!(state_with(store, None));
    let req = test::TestRequest::get()
        .uri("/admin/vendors")
        .insert_header(("authorization", format!("Bearer {ADMIN}")))
        .to_request();
    assert_eq!(
        test::call_service(&disabled, req).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[actix_web::test]
async fn admin_vendor_and_activation_token_commit_together() {
    let mock = MockVendor::start(Reply::Json(completion())).await;
    let store: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
    let app = app!(state_with(store.clone(), Some(ADMIN)));
    let auth = ("authorization", format!("Bearer {ADMIN}"));

    let req = test::TestRequest::post()
        .uri("/admin/vendors")
        .insert_header(auth.clone())
        .set_json(json!({
            "slug": "acme",
            "base_url": mock.base_url,
            "default_model": "acme-1",
            "api_key": "sk-acme",
            "retry_count": 1,
            "issue_activation_token": true,
            "activation_ttl_seconds": 3600
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["vendor"]["has_api_key"], true);
    assert!(body["vendor"].get("encrypted_api_key").is_none());
    assert!(body["activation_token"]["secret"]
        .as_str()
        .unwrap()
        .starts_with("lgt_"));
    let vendor_id = body["vendor"]["id"].as_str().unwrap().to_string();

    // A second live activation token conflicts, and the vendor change riding
    // in the same unit of work must not land either.
    let req = test::TestRequest::post()
        .uri("/admin/vendors")
        .insert_header(auth.clone())
        .set_json(json!({ "slug": "acme", "retry_count": 4, "issue_activation_token": true }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);
    let stored = store.get_vendor(&vendor_id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    let tokens = store
        .list_tokens(
            &TokenFilter::for_owner(TokenOwner::Vendor(vendor_id.clone()))
                .with_kind(TokenKind::Activation),
        )
        .await
        .unwrap();
    assert_eq!(tokens.len(), 1);

    // The stored key is usable for dispatch.
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({ "model": "acme__acme-2", "prompt": "ping" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    assert_eq!(
        mock.last_request().await.authorization.as_deref(),
        Some("Bearer sk-acme")
    );

    let req = test::TestRequest::get()
        .uri("/admin/vendors/acme/tokens")
        .insert_header(auth.clone())
        .to_request();
    let listed: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(listed[0].get("token_hash").is_none());
    let token_id = listed[0]["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/admin/tokens/{token_id}/revoke"))
        .insert_header(auth.clone())
        .to_request();
    let revoked: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(revoked["is_active"], false);

    // With the old token revoked a fresh one can be issued.
    let req = test::TestRequest::post()
        .uri("/admin/vendors")
        .insert_header(auth.clone())
        .set_json(json!({ "slug": "acme", "issue_activation_token": true }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
}

#[actix_web::test]
async fn deactivated_vendor_stops_resolving() {
    let mock = MockVendor::start(Reply::Json(completion())).await;
    let (state, _) = seeded_state(&mock.base_url).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/admin/vendors/openai/deactivate")
        .insert_header(("authorization", format!("Bearer {ADMIN}")))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["is_active"], false);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({ "model": "openai__gpt-4o", "prompt": "ping" }))
        .to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::NOT_FOUND
    );

    let req = test::TestRequest::get()
        .uri("/admin/vendors?active=false")
        .insert_header(("authorization", format!("Bearer {ADMIN}")))
        .to_request();
    let listed: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listed[0]["slug"], "openai");
    assert_eq!(mock.hits(), 0);
}
