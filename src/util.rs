use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use actix_web::http::header;
use actix_web::HttpResponse;
use anyhow::Context;
use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use crate::catalog::ModelCatalog;
use crate::config::GatewayConfig;
use crate::dispatcher::{ChunkStream, RequestDispatcher};
use crate::error::GatewayError;
use crate::registry::VendorRegistry;
use crate::store::StoreBackend;

/// Load env files and install the global tracing subscriber.
///
/// - ENV_FILE or DOTENV_PATH name an explicit env file
/// - otherwise `.env` in the working directory, if present
/// - RUST_LOG drives the filter (default "info")
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

pub fn env_truthy(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        }
        Err(_) => default,
    }
}

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn uuid_hex() -> String {
    format!("{:032x}", Uuid::new_v4().as_u128())
}

/// `n` bytes from the OS CSPRNG, hex encoded.
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time equality for two byte slices.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Build the shared outbound client.
///
/// An explicit proxy URL (http, https or socks5) routes all vendor traffic.
/// Without one, reqwest still honors HTTP_PROXY / HTTPS_PROXY from the
/// environment unless `no_proxy` is set.
pub fn build_http_client(proxy_url: Option<&str>, no_proxy: bool) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(format!("llmgate/{}", env!("CARGO_PKG_VERSION")))
        .pool_idle_timeout(Duration::from_secs(90));

    if no_proxy {
        builder = builder.no_proxy();
    } else if let Some(url) = proxy_url.map(str::trim).filter(|u| !u.is_empty()) {
        // The URL may embed credentials, so it is not echoed back.
        let proxy = reqwest::Proxy::all(url).context("invalid proxy URL")?;
        builder = builder.proxy(proxy);
        tracing::info!("Vendor traffic routed through configured proxy");
    }

    builder.build().context("failed to build HTTP client")
}

/// Shared application state used by the HTTP server and handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StoreBackend>,
    pub registry: Arc<VendorRegistry>,
    pub dispatcher: Arc<RequestDispatcher>,
    pub catalog: Arc<ModelCatalog>,
    /// Bearer token for /admin routes; admin routes are disabled without one.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn from_config(config: &GatewayConfig, store: Arc<dyn StoreBackend>) -> anyhow::Result<Self> {
        let http = build_http_client(config.proxy_url.as_deref(), config.no_proxy)?;
        let registry = Arc::new(VendorRegistry::new(
            store.clone(),
            config.cipher()?,
            config.registry_options(),
        ));
        let dispatcher = Arc::new(RequestDispatcher::new(
            http.clone(),
            registry.clone(),
            config.dispatcher_options(),
        ));
        let catalog = Arc::new(ModelCatalog::new(
            http,
            registry.clone(),
            Duration::from_secs(config.models_cache_ttl_seconds),
        ));
        Ok(Self {
            store,
            registry,
            dispatcher,
            catalog,
            admin_token: config
                .admin_token
                .clone()
                .filter(|t| !t.trim().is_empty()),
        })
    }

    /// Check `Authorization: Bearer <admin token>`.
    pub fn verify_admin(&self, headers: &header::HeaderMap) -> Result<(), GatewayError> {
        let Some(expected) = self.admin_token.as_deref() else {
            return Err(GatewayError::Unauthorized);
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| {
                let s = s.trim();
                if s.len() >= 7 && s[..6].eq_ignore_ascii_case("bearer") {
                    Some(s[6..].trim())
                } else {
                    None
                }
            })
            .ok_or(GatewayError::Unauthorized)?;
        if ct_eq(presented.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized)
        }
    }
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// Terminal SSE event emitted when a relayed stream fails part-way.
pub fn sse_error_event(err: &GatewayError) -> Bytes {
    let payload = serde_json::json!({
        "error": { "message": err.to_string(), "type": err.kind() }
    });
    Bytes::from(format!("event: error\ndata: {payload}\n\n"))
}

/// Wrap a relayed chunk stream into an SSE response. Vendor framing passes
/// through untouched; a mid-stream failure becomes one final error event.
pub fn sse_response(chunks: ChunkStream) -> HttpResponse {
    let body = chunks.map(|item| match item {
        Ok(bytes) => Ok::<Bytes, actix_web::Error>(bytes),
        Err(err) => {
            tracing::warn!(error = %err, "Relayed stream ended with an error");
            Ok(sse_error_event(&err))
        }
    });
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .streaming(body)
}

fn csv_env(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
}

/// CORS from CORS_ALLOWED_ORIGINS / _METHODS / _HEADERS ("*" or a
/// comma-separated list), CORS_ALLOW_CREDENTIALS and CORS_MAX_AGE.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match csv_env("CORS_ALLOWED_ORIGINS") {
        Some(list) if !list.iter().any(|o| o == "*") => {
            for origin in &list {
                cors = cors.allowed_origin(origin);
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match csv_env("CORS_ALLOWED_METHODS") {
        Some(list) if !list.is_empty() && !list.iter().any(|m| m == "*") => {
            let methods: Vec<actix_web::http::Method> =
                list.iter().filter_map(|m| m.parse().ok()).collect();
            cors = cors.allowed_methods(methods);
        }
        _ => cors = cors.allow_any_method(),
    }

    match csv_env("CORS_ALLOWED_HEADERS") {
        Some(list) if !list.is_empty() && !list.iter().any(|h| h == "*") => {
            for h in &list {
                cors = cors.allowed_header(h.as_str());
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if env_truthy("CORS_ALLOW_CREDENTIALS", false) {
        cors = cors.supports_credentials();
    }
    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }
    cors
}
