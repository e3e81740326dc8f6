use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::dispatcher::{split_composite_model, DispatchRequest, DispatchResult};
use crate::error::GatewayError;
use crate::registry::VendorSpec;
use crate::repository::{IssuedToken, TokenRepository};
use crate::store::{
    StoreBackend, Token, TokenFilter, TokenKind, TokenOwner, Vendor, VendorFilter,
};
use crate::uow::UnitOfWork;
use crate::util::{error_response, sse_response, AppState};

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route(
                "/v1/chat/completions/{completion_id}",
                web::delete().to(cancel_completion),
            )
            .route(
                "/v1/vendors/{vendor}/chat/completions",
                web::post().to(vendor_chat_completions),
            )
            .route("/v1/models", web::get().to(list_models))
            .route("/admin/vendors", web::get().to(admin_list_vendors))
            .route("/admin/vendors", web::post().to(admin_upsert_vendor))
            .route(
                "/admin/vendors/{vendor}/deactivate",
                web::post().to(admin_deactivate_vendor),
            )
            .route(
                "/admin/vendors/{vendor}/tokens",
                web::get().to(admin_vendor_tokens),
            )
            .route("/admin/tokens/{id}/revoke", web::post().to(admin_revoke_token)),
    );
}

/// Log the category and render the taxonomy response.
fn failure(err: GatewayError) -> HttpResponse {
    debug!(error = err.kind(), "Request failed");
    err.error_response()
}

fn into_object(body: Value) -> Result<Map<String, Value>, GatewayError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(GatewayError::InvalidInput(
            "request body must be a JSON object".into(),
        )),
    }
}

async fn forward(state: &AppState, vendor: String, body: Map<String, Value>) -> HttpResponse {
    let request = match DispatchRequest::from_openai_body(vendor, body) {
        Ok(r) => r,
        Err(e) => return failure(e),
    };
    match state.dispatcher.dispatch(request).await {
        Ok(DispatchResult::Complete { body, attempts }) => HttpResponse::Ok()
            .insert_header(("x-llmgate-attempts", attempts.to_string()))
            .json(body),
        Ok(DispatchResult::Streaming { chunks, attempts }) => {
            let mut response = sse_response(chunks);
            if let Ok(value) = actix_web::http::header::HeaderValue::from_str(&attempts.to_string()) {
                response.headers_mut().insert(
                    actix_web::http::header::HeaderName::from_static("x-llmgate-attempts"),
                    value,
                );
            }
            response
        }
        Err(e) => failure(e),
    }
}

/// OpenAI chat endpoint. The vendor comes from a `vendor` field or from a
/// composite `model` of the form `vendor__model`.
async fn chat_completions(state: web::Data<AppState>, body: web::Json<Value>) -> impl Responder {
    let mut body = match into_object(body.into_inner()) {
        Ok(m) => m,
        Err(e) => return failure(e),
    };

    let explicit = body
        .get("vendor")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let vendor = match explicit {
        Some(vendor) => vendor,
        None => {
            let model = body.get("model").and_then(Value::as_str).unwrap_or_default();
            match split_composite_model(model) {
                Ok((vendor, model)) => {
                    body.insert("model".into(), Value::String(model));
                    vendor
                }
                Err(e) => return failure(e),
            }
        }
    };
    forward(&state, vendor, body).await
}

async fn vendor_chat_completions(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<Value>,
) -> impl Responder {
    match into_object(body.into_inner()) {
        Ok(body) => forward(&state, path.into_inner(), body).await,
        Err(e) => failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub vendor: Option<String>,
}

async fn cancel_completion(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<CancelQuery>,
) -> impl Responder {
    let Some(vendor) = query.into_inner().vendor.filter(|v| !v.trim().is_empty()) else {
        return failure(GatewayError::InvalidInput(
            "query parameter 'vendor' is required".into(),
        ));
    };
    match state.dispatcher.cancel(&vendor, &path.into_inner()).await {
        Ok(body) => HttpResponse::Ok().json(body),
        Err(e) => failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    #[serde(default)]
    pub refresh: bool,
}

async fn list_models(state: web::Data<AppState>, query: web::Query<ModelsQuery>) -> impl Responder {
    match state.catalog.list_models(query.refresh).await {
        Ok(data) => HttpResponse::Ok().json(serde_json::json!({ "object": "list", "data": data })),
        Err(e) => failure(e),
    }
}

// --- admin ---------------------------------------------------------------

/// `None` when the caller may proceed.
fn admin_guard(state: &AppState, req: &HttpRequest) -> Option<HttpResponse> {
    if state.admin_token.is_none() {
        return Some(error_response(
            http::StatusCode::NOT_FOUND,
            "admin routes are disabled",
        ));
    }
    state.verify_admin(req.headers()).err().map(failure)
}

/// Vendor as shown to operators; the encrypted key is reduced to a flag.
#[derive(Debug, Serialize)]
pub struct VendorView {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub base_url: String,
    pub default_model: Option<String>,
    pub has_api_key: bool,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub is_active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&Vendor> for VendorView {
    fn from(v: &Vendor) -> Self {
        Self {
            id: v.id.clone(),
            slug: v.slug.clone(),
            name: v.name.clone(),
            base_url: v.base_url.clone(),
            default_model: v.default_model.clone(),
            has_api_key: v.encrypted_api_key.is_some(),
            timeout_seconds: v.timeout_seconds,
            retry_count: v.retry_count,
            is_active: v.is_active,
            created_at: v.created_at,
            updated_at: v.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenView {
    pub id: String,
    pub owner: String,
    pub kind: &'static str,
    pub label: Option<String>,
    pub is_active: bool,
    pub expires_at: Option<u64>,
    pub created_at: u64,
}

impl From<&Token> for TokenView {
    fn from(t: &Token) -> Self {
        Self {
            id: t.id.clone(),
            owner: t.owner.to_string(),
            kind: t.kind.as_str(),
            label: t.label.clone(),
            is_active: t.is_active,
            expires_at: t.expires_at,
            created_at: t.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminVendorsQuery {
    pub active: Option<bool>,
    pub limit: Option<usize>,
}

async fn admin_list_vendors(
    state: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<AdminVendorsQuery>,
) -> impl Responder {
    if let Some(denied) = admin_guard(&state, &req) {
        return denied;
    }
    let query = query.into_inner();
    let filter = VendorFilter {
        active: query.active,
        slugs: None,
        limit: query.limit,
    };
    match state.registry.list(&filter).await {
        Ok(vendors) => {
            let views: Vec<VendorView> = vendors.iter().map(VendorView::from).collect();
            HttpResponse::Ok().json(views)
        }
        Err(e) => failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminVendorRequest {
    #[serde(flatten)]
    pub spec: VendorSpec,
    /// Also create an activation token for the vendor, in the same commit.
    #[serde(default)]
    pub issue_activation_token: bool,
    #[serde(default)]
    pub activation_ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct IssuedTokenView {
    #[serde(flatten)]
    token: TokenView,
    /// Shown once; only its hash is stored.
    secret: String,
}

impl From<IssuedToken> for IssuedTokenView {
    fn from(issued: IssuedToken) -> Self {
        Self {
            token: TokenView::from(&issued.token),
            secret: issued.secret,
        }
    }
}

async fn admin_upsert_vendor(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<AdminVendorRequest>,
) -> impl Responder {
    if let Some(denied) = admin_guard(&state, &req) {
        return denied;
    }
    let payload = body.into_inner();
    let registry = state.registry.clone();

    let mut uow = UnitOfWork::new(state.store.clone());
    let outcome = async {
        let session = uow.open()?;
        let vendor = registry.upsert_in(session, payload.spec).await?;
        let token = if payload.issue_activation_token {
            let issued = TokenRepository
                .issue(
                    session,
                    TokenOwner::Vendor(vendor.id.clone()),
                    TokenKind::Activation,
                    payload.activation_ttl_seconds,
                    Some("activation".into()),
                )
                .await?;
            Some(issued)
        } else {
            None
        };
        Ok::<_, GatewayError>((vendor, token))
    }
    .await;
    if outcome.is_ok() {
        uow.mark_for_commit();
    }

    match uow.finish(outcome).await {
        Ok((vendor, token)) => {
            registry.invalidate(&vendor);
            state.catalog.invalidate(&vendor.slug).await;
            info!(
                vendor = %vendor.slug,
                activation_token = token.is_some(),
                "Vendor saved via admin API"
            );
            HttpResponse::Ok().json(serde_json::json!({
                "vendor": VendorView::from(&vendor),
                "activation_token": token.map(IssuedTokenView::from),
            }))
        }
        Err(e) => failure(e),
    }
}

async fn admin_deactivate_vendor(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> impl Responder {
    if let Some(denied) = admin_guard(&state, &req) {
        return denied;
    }
    match state.registry.deactivate(&path.into_inner()).await {
        Ok(vendor) => {
            state.catalog.invalidate(&vendor.slug).await;
            HttpResponse::Ok().json(VendorView::from(&vendor))
        }
        Err(e) => failure(e),
    }
}

async fn admin_vendor_tokens(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> impl Responder {
    if let Some(denied) = admin_guard(&state, &req) {
        return denied;
    }
    let key = path.into_inner();
    let vendor = match state.registry.get(&key).await {
        Ok(Some(v)) => v,
        Ok(None) => return failure(GatewayError::VendorNotFound(key)),
        Err(e) => return failure(e),
    };
    let filter = TokenFilter::for_owner(TokenOwner::Vendor(vendor.id.clone()));
    match state.store.list_tokens(&filter).await {
        Ok(tokens) => {
            let views: Vec<TokenView> = tokens.iter().map(TokenView::from).collect();
            HttpResponse::Ok().json(views)
        }
        Err(e) => failure(e),
    }
}

async fn admin_revoke_token(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> impl Responder {
    if let Some(denied) = admin_guard(&state, &req) {
        return denied;
    }
    let id = path.into_inner();
    let mut uow = UnitOfWork::new(state.store.clone());
    let outcome = match uow.open() {
        Ok(session) => TokenRepository.revoke(session, &id).await,
        Err(e) => Err(e),
    };
    if outcome.is_ok() {
        uow.mark_for_commit();
    }
    match uow.finish(outcome).await {
        Ok(token) => HttpResponse::Ok().json(TokenView::from(&token)),
        Err(e) => failure(e),
    }
}
