//! Persistence contract for vendor and token records.
//!
//! Backends expose point reads, filtered listings and a single atomic write
//! entry point, [`StoreBackend::apply`]. Every write reaches a backend as a
//! batch produced by a [`crate::uow::UnitOfWork`]; a backend either applies the
//! whole batch or none of it. Uniqueness rules (vendor slug, one live token per
//! owner and kind) are re-checked at apply time by [`validate_batch`], so two
//! racing units of work cannot both succeed.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{GatewayError, Result};

/// Persisted vendor configuration.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vendor {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub default_model: Option<String>,
    /// base64(nonce || ciphertext || tag); `None` for keyless local endpoints.
    #[serde(default)]
    pub encrypted_api_key: Option<String>,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub is_active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl std::fmt::Debug for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vendor")
            .field("id", &self.id)
            .field("slug", &self.slug)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field(
                "encrypted_api_key",
                &self.encrypted_api_key.as_ref().map(|_| "<encrypted>"),
            )
            .field("timeout_seconds", &self.timeout_seconds)
            .field("retry_count", &self.retry_count)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Who a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum TokenOwner {
    Vendor(String),
    User(String),
}

impl std::fmt::Display for TokenOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenOwner::Vendor(id) => write!(f, "vendor:{id}"),
            TokenOwner::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl std::str::FromStr for TokenOwner {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("vendor", id)) if !id.is_empty() => Ok(TokenOwner::Vendor(id.to_string())),
            Some(("user", id)) if !id.is_empty() => Ok(TokenOwner::User(id.to_string())),
            _ => Err(GatewayError::InvalidInput(format!(
                "invalid token owner '{s}', expected vendor:<id> or user:<id>"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Default,
    Activation,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Default => "default",
            TokenKind::Activation => "activation",
        }
    }
}

/// Credential/activation record. Only the SHA-256 of the token value is kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub id: String,
    pub owner: TokenOwner,
    pub kind: TokenKind,
    pub token_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub expires_at: Option<u64>,
    pub created_at: u64,
}

impl Token {
    /// Active and not yet expired at `now`.
    pub fn is_live(&self, now: u64) -> bool {
        self.is_active && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VendorFilter {
    pub active: Option<bool>,
    pub slugs: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl VendorFilter {
    pub fn active_only() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    pub fn with_slugs(mut self, slugs: Vec<String>) -> Self {
        self.slugs = Some(slugs);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, vendor: &Vendor) -> bool {
        if let Some(active) = self.active {
            if vendor.is_active != active {
                return false;
            }
        }
        if let Some(slugs) = &self.slugs {
            if !slugs.iter().any(|s| s == &vendor.slug) {
                return false;
            }
        }
        true
    }

    /// Sort by slug and apply the limit.
    pub fn finish(&self, mut vendors: Vec<Vendor>) -> Vec<Vendor> {
        vendors.sort_by(|a, b| a.slug.cmp(&b.slug));
        if let Some(limit) = self.limit {
            vendors.truncate(limit);
        }
        vendors
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenFilter {
    pub owner: Option<TokenOwner>,
    pub kind: Option<TokenKind>,
    pub active: Option<bool>,
    pub limit: Option<usize>,
}

impl TokenFilter {
    pub fn for_owner(owner: TokenOwner) -> Self {
        Self {
            owner: Some(owner),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: TokenKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, token: &Token) -> bool {
        if let Some(owner) = &self.owner {
            if &token.owner != owner {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if token.kind != kind {
                return false;
            }
        }
        if let Some(active) = self.active {
            if token.is_active != active {
                return false;
            }
        }
        true
    }

    /// Oldest first, then the limit.
    pub fn finish(&self, mut tokens: Vec<Token>) -> Vec<Token> {
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            tokens.truncate(limit);
        }
        tokens
    }
}

/// One staged mutation. Inserts require an unused id, updates an existing one.
#[derive(Debug, Clone)]
pub enum WriteOp {
    InsertVendor(Vendor),
    UpdateVendor(Vendor),
    InsertToken(Token),
    UpdateToken(Token),
}

#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn get_vendor(&self, id: &str) -> Result<Option<Vendor>>;

    async fn get_vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>>;

    async fn list_vendors(&self, filter: &VendorFilter) -> Result<Vec<Vendor>>;

    async fn get_token(&self, id: &str) -> Result<Option<Token>>;

    async fn list_tokens(&self, filter: &TokenFilter) -> Result<Vec<Token>>;

    /// Apply a batch atomically. Constraint violations surface as `Conflict`
    /// and leave the store untouched.
    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()>;
}

/// Read view of committed state used to validate a batch before it is applied.
pub(crate) trait CommittedState {
    fn vendor(&self, id: &str) -> Result<Option<Vendor>>;
    fn vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>>;
    fn token(&self, id: &str) -> Result<Option<Token>>;
    fn tokens_for(&self, owner: &TokenOwner, kind: TokenKind) -> Result<Vec<Token>>;
}

/// Check a batch against committed state plus its own earlier operations.
pub(crate) fn validate_batch(state: &dyn CommittedState, batch: &[WriteOp], now: u64) -> Result<()> {
    let mut vendors: HashMap<&str, &Vendor> = HashMap::new();
    let mut tokens: HashMap<&str, &Token> = HashMap::new();

    for op in batch {
        match op {
            WriteOp::InsertVendor(v) => {
                if vendors.contains_key(v.id.as_str()) || state.vendor(&v.id)?.is_some() {
                    return Err(GatewayError::Conflict(format!("vendor id {} already exists", v.id)));
                }
                let taken_in_batch = vendors.values().any(|o| o.slug == v.slug);
                if taken_in_batch || state.vendor_by_slug(&v.slug)?.is_some() {
                    return Err(GatewayError::Conflict(format!(
                        "vendor slug '{}' already exists",
                        v.slug
                    )));
                }
                vendors.insert(v.id.as_str(), v);
            }
            WriteOp::UpdateVendor(v) => {
                let existing_slug = match vendors.get(v.id.as_str()) {
                    Some(staged) => Some(staged.slug.clone()),
                    None => state.vendor(&v.id)?.map(|e| e.slug),
                };
                match existing_slug {
                    None => {
                        return Err(GatewayError::Conflict(format!(
                            "vendor {} does not exist",
                            v.id
                        )))
                    }
                    Some(slug) if slug != v.slug => {
                        return Err(GatewayError::Conflict("vendor slug is immutable".into()))
                    }
                    Some(_) => {}
                }
                vendors.insert(v.id.as_str(), v);
            }
            WriteOp::InsertToken(t) => {
                if tokens.contains_key(t.id.as_str()) || state.token(&t.id)?.is_some() {
                    return Err(GatewayError::Conflict(format!("token id {} already exists", t.id)));
                }
                tokens.insert(t.id.as_str(), t);
            }
            WriteOp::UpdateToken(t) => {
                let existing = match tokens.get(t.id.as_str()) {
                    Some(staged) => Some((staged.owner.clone(), staged.kind)),
                    None => state.token(&t.id)?.map(|e| (e.owner, e.kind)),
                };
                match existing {
                    None => {
                        return Err(GatewayError::Conflict(format!(
                            "token {} does not exist",
                            t.id
                        )))
                    }
                    Some((owner, kind)) if owner != t.owner || kind != t.kind => {
                        return Err(GatewayError::Conflict(
                            "token owner and kind are immutable".into(),
                        ))
                    }
                    Some(_) => {}
                }
                tokens.insert(t.id.as_str(), t);
            }
        }
    }

    // One live token per (owner, kind), counting the batch's final versions.
    let touched: HashSet<(&TokenOwner, TokenKind)> = tokens
        .values()
        .filter(|t| t.is_live(now))
        .map(|t| (&t.owner, t.kind))
        .collect();
    for (owner, kind) in touched {
        let mut live: HashSet<String> = state
            .tokens_for(owner, kind)?
            .into_iter()
            .filter(|t| !tokens.contains_key(t.id.as_str()) && t.is_live(now))
            .map(|t| t.id)
            .collect();
        live.extend(
            tokens
                .values()
                .filter(|t| &t.owner == owner && t.kind == kind && t.is_live(now))
                .map(|t| t.id.clone()),
        );
        if live.len() > 1 {
            return Err(GatewayError::Conflict(format!(
                "{owner} already has an active {} token",
                kind.as_str()
            )));
        }
    }
    Ok(())
}

/// Backend selection, parsed from strings such as `memory`, `sled:<path>`
/// or `sqlite:<url>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSpec {
    Memory,
    Sled { path: PathBuf },
    Sqlite { url: String },
}

impl StoreSpec {
    pub fn parse(spec: &str) -> Option<StoreSpec> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("memory") {
            return Some(StoreSpec::Memory);
        }
        if let Some(rest) = spec.strip_prefix("sled:") {
            if !rest.is_empty() {
                return Some(StoreSpec::Sled {
                    path: PathBuf::from(rest),
                });
            }
        }
        if spec.starts_with("sqlite:") {
            return Some(StoreSpec::Sqlite {
                url: spec.to_string(),
            });
        }
        None
    }

    pub async fn open(&self) -> Result<Arc<dyn StoreBackend>> {
        match self {
            StoreSpec::Memory => Ok(Arc::new(crate::store_memory::MemoryStore::new())),
            #[cfg(feature = "sled")]
            StoreSpec::Sled { path } => Ok(Arc::new(crate::store_sled::SledStore::open_path(
                path.clone(),
            )?)),
            #[cfg(not(feature = "sled"))]
            StoreSpec::Sled { .. } => Err(GatewayError::InvalidInput(
                "sled storage requires the 'sled' feature".into(),
            )),
            #[cfg(feature = "sqlite")]
            StoreSpec::Sqlite { url } => Ok(Arc::new(
                crate::store_sqlite::SqliteStore::connect(url).await?,
            )),
            #[cfg(not(feature = "sqlite"))]
            StoreSpec::Sqlite { .. } => Err(GatewayError::InvalidInput(
                "sqlite storage requires the 'sqlite' feature".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_specs() {
        assert_eq!(StoreSpec::parse("memory"), Some(StoreSpec::Memory));
        assert_eq!(
            StoreSpec::parse("sled:./data/gate.db"),
            Some(StoreSpec::Sled {
                path: PathBuf::from("./data/gate.db")
            })
        );
        assert_eq!(
            StoreSpec::parse("sqlite://gate.db"),
            Some(StoreSpec::Sqlite {
                url: "sqlite://gate.db".into()
            })
        );
        assert_eq!(StoreSpec::parse("sled:"), None);
        assert_eq!(StoreSpec::parse("postgres://x"), None);
    }

    #[test]
    fn token_owner_round_trips_through_display() {
        let owner: TokenOwner = "vendor:abc".parse().unwrap();
        assert_eq!(owner, TokenOwner::Vendor("abc".into()));
        assert_eq!(owner.to_string(), "vendor:abc");
        assert!("team:abc".parse::<TokenOwner>().is_err());
        assert!("user:".parse::<TokenOwner>().is_err());
    }

    #[test]
    fn expired_tokens_are_not_live() {
        let token = Token {
            id: "t1".into(),
            owner: TokenOwner::User("u1".into()),
            kind: TokenKind::Default,
            token_hash: "00".into(),
            label: None,
            is_active: true,
            expires_at: Some(100),
            created_at: 1,
        };
        assert!(token.is_live(99));
        assert!(!token.is_live(100));
    }

    #[test]
    fn vendor_debug_hides_ciphertext() {
        let vendor = Vendor {
            id: "v1".into(),
            slug: "openai".into(),
            name: "OpenAI".into(),
            base_url: "https://api.openai.com/v1".into(),
            default_model: None,
            encrypted_api_key: Some("c2VjcmV0LWJsb2I=".into()),
            timeout_seconds: 30,
            retry_count: 2,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!format!("{vendor:?}").contains("c2VjcmV0"));
    }
}
