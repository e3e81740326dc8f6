//! Entity repositories over an explicit [`Session`].
//!
//! Repositories never hold a session of their own; every call receives the
//! caller's `&mut Session`, so all writes of one logical operation land in the
//! same unit of work. Checks done here give early, precise errors; the
//! backend re-validates the whole batch at commit.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{GatewayError, Result};
use crate::store::{Token, TokenFilter, TokenKind, TokenOwner, Vendor, VendorFilter, WriteOp};
use crate::uow::Session;
use crate::util::{now_epoch, random_hex, sha256_hex, uuid_hex};

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("slug pattern compiles"));

pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.contains("__") || !SLUG_RE.is_match(slug) {
        return Err(GatewayError::InvalidInput(format!(
            "invalid vendor slug '{slug}': use lowercase letters, digits, '-' or '_' (no '__')"
        )));
    }
    Ok(())
}

#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    type Record: Send;
    type Filter: Send + Sync;

    async fn get(&self, session: &mut Session, id: &str) -> Result<Option<Self::Record>>;
    async fn create(&self, session: &mut Session, record: Self::Record) -> Result<Self::Record>;
    async fn update(&self, session: &mut Session, record: Self::Record) -> Result<Self::Record>;
    async fn list(&self, session: &mut Session, filter: &Self::Filter) -> Result<Vec<Self::Record>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VendorRepository;

impl VendorRepository {
    pub async fn get_by_slug(&self, session: &mut Session, slug: &str) -> Result<Option<Vendor>> {
        session.vendor_by_slug(slug).await
    }

    /// Look up by slug first, then by id.
    pub async fn find(&self, session: &mut Session, key: &str) -> Result<Option<Vendor>> {
        match session.vendor_by_slug(key).await? {
            Some(v) => Ok(Some(v)),
            None => session.vendor(key).await,
        }
    }
}

#[async_trait::async_trait]
impl Repository for VendorRepository {
    type Record = Vendor;
    type Filter = VendorFilter;

    async fn get(&self, session: &mut Session, id: &str) -> Result<Option<Vendor>> {
        session.vendor(id).await
    }

    async fn create(&self, session: &mut Session, mut vendor: Vendor) -> Result<Vendor> {
        validate_slug(&vendor.slug)?;
        if vendor.id.is_empty() {
            vendor.id = uuid_hex();
        }
        if session.vendor(&vendor.id).await?.is_some() {
            return Err(GatewayError::Conflict(format!(
                "vendor id {} already exists",
                vendor.id
            )));
        }
        if session.vendor_by_slug(&vendor.slug).await?.is_some() {
            return Err(GatewayError::Conflict(format!(
                "vendor slug '{}' already exists",
                vendor.slug
            )));
        }
        let now = now_epoch();
        vendor.created_at = now;
        vendor.updated_at = now;
        session.stage(WriteOp::InsertVendor(vendor.clone()));
        Ok(vendor)
    }

    async fn update(&self, session: &mut Session, mut vendor: Vendor) -> Result<Vendor> {
        let existing = session
            .vendor(&vendor.id)
            .await?
            .ok_or_else(|| GatewayError::VendorNotFound(vendor.id.clone()))?;
        if existing.slug != vendor.slug {
            return Err(GatewayError::Conflict("vendor slug is immutable".into()));
        }
        vendor.created_at = existing.created_at;
        vendor.updated_at = now_epoch();
        session.stage(WriteOp::UpdateVendor(vendor.clone()));
        Ok(vendor)
    }

    async fn list(&self, session: &mut Session, filter: &VendorFilter) -> Result<Vec<Vendor>> {
        session.list_vendors(filter).await
    }
}

/// Freshly issued token. `secret` is shown once and never stored.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: Token,
    pub secret: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenRepository;

impl TokenRepository {
    /// Create a token with a random secret; only its SHA-256 is persisted.
    pub async fn issue(
        &self,
        session: &mut Session,
        owner: TokenOwner,
        kind: TokenKind,
        ttl_seconds: Option<u64>,
        label: Option<String>,
    ) -> Result<IssuedToken> {
        let secret = format!("lgt_{}", random_hex(32));
        let now = now_epoch();
        let token = Token {
            id: uuid_hex(),
            owner,
            kind,
            token_hash: sha256_hex(secret.as_bytes()),
            label,
            is_active: true,
            expires_at: ttl_seconds.map(|ttl| now.saturating_add(ttl)),
            created_at: now,
        };
        let token = self.create(session, token).await?;
        Ok(IssuedToken { token, secret })
    }

    pub async fn revoke(&self, session: &mut Session, id: &str) -> Result<Token> {
        let mut token = session
            .token(id)
            .await?
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown token {id}")))?;
        token.is_active = false;
        self.update(session, token).await
    }

    async fn ensure_single_live(&self, session: &mut Session, token: &Token) -> Result<()> {
        let now = now_epoch();
        if !token.is_live(now) {
            return Ok(());
        }
        let filter = TokenFilter::for_owner(token.owner.clone()).with_kind(token.kind);
        let clash = session
            .list_tokens(&filter)
            .await?
            .into_iter()
            .any(|t| t.id != token.id && t.is_live(now));
        if clash {
            return Err(GatewayError::Conflict(format!(
                "{} already has an active {} token",
                token.owner,
                token.kind.as_str()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Repository for TokenRepository {
    type Record = Token;
    type Filter = TokenFilter;

    async fn get(&self, session: &mut Session, id: &str) -> Result<Option<Token>> {
        session.token(id).await
    }

    async fn create(&self, session: &mut Session, mut token: Token) -> Result<Token> {
        if token.id.is_empty() {
            token.id = uuid_hex();
        }
        if session.token(&token.id).await?.is_some() {
            return Err(GatewayError::Conflict(format!(
                "token id {} already exists",
                token.id
            )));
        }
        if let TokenOwner::Vendor(vendor_id) = &token.owner {
            if session.vendor(vendor_id).await?.is_none() {
                return Err(GatewayError::VendorNotFound(vendor_id.clone()));
            }
        }
        self.ensure_single_live(session, &token).await?;
        session.stage(WriteOp::InsertToken(token.clone()));
        Ok(token)
    }

    async fn update(&self, session: &mut Session, token: Token) -> Result<Token> {
        let existing = session
            .token(&token.id)
            .await?
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown token {}", token.id)))?;
        if existing.owner != token.owner || existing.kind != token.kind {
            return Err(GatewayError::Conflict(
                "token owner and kind are immutable".into(),
            ));
        }
        self.ensure_single_live(session, &token).await?;
        session.stage(WriteOp::UpdateToken(token.clone()));
        Ok(token)
    }

    async fn list(&self, session: &mut Session, filter: &TokenFilter) -> Result<Vec<Token>> {
        session.list_tokens(filter).await
    }
}
