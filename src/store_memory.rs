//! In-memory storage backend
//!
//! Used by tests and as the zero-config option. Data is lost when the
//! process exits.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{GatewayError, Result};
use crate::store::{
    validate_batch, CommittedState, StoreBackend, Token, TokenFilter, TokenKind, TokenOwner,
    Vendor, VendorFilter, WriteOp,
};
use crate::util::now_epoch;

#[derive(Default)]
struct Tables {
    vendors: HashMap<String, Vendor>,
    slugs: HashMap<String, String>,
    tokens: HashMap<String, Token>,
}

impl CommittedState for Tables {
    fn vendor(&self, id: &str) -> Result<Option<Vendor>> {
        Ok(self.vendors.get(id).cloned())
    }

    fn vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
        Ok(self
            .slugs
            .get(slug)
            .and_then(|id| self.vendors.get(id))
            .cloned())
    }

    fn token(&self, id: &str) -> Result<Option<Token>> {
        Ok(self.tokens.get(id).cloned())
    }

    fn tokens_for(&self, owner: &TokenOwner, kind: TokenKind) -> Result<Vec<Token>> {
        Ok(self
            .tokens
            .values()
            .filter(|t| &t.owner == owner && t.kind == kind)
            .cloned()
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Storage(format!("Lock error: {}", e))
}

#[async_trait::async_trait]
impl StoreBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_vendor(&self, id: &str) -> Result<Option<Vendor>> {
        let tables = self.tables.read().map_err(lock_error)?;
        tables.vendor(id)
    }

    async fn get_vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
        let tables = self.tables.read().map_err(lock_error)?;
        tables.vendor_by_slug(slug)
    }

    async fn list_vendors(&self, filter: &VendorFilter) -> Result<Vec<Vendor>> {
        let tables = self.tables.read().map_err(lock_error)?;
        let matched = tables
            .vendors
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect();
        Ok(filter.finish(matched))
    }

    async fn get_token(&self, id: &str) -> Result<Option<Token>> {
        let tables = self.tables.read().map_err(lock_error)?;
        tables.token(id)
    }

    async fn list_tokens(&self, filter: &TokenFilter) -> Result<Vec<Token>> {
        let tables = self.tables.read().map_err(lock_error)?;
        let matched = tables
            .tokens
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        Ok(filter.finish(matched))
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()> {
        let mut tables = self.tables.write().map_err(lock_error)?;
        validate_batch(&*tables, &batch, now_epoch())?;
        for op in batch {
            match op {
                WriteOp::InsertVendor(v) | WriteOp::UpdateVendor(v) => {
                    tables.slugs.insert(v.slug.clone(), v.id.clone());
                    tables.vendors.insert(v.id.clone(), v);
                }
                WriteOp::InsertToken(t) | WriteOp::UpdateToken(t) => {
                    tables.tokens.insert(t.id.clone(), t);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendor(id: &str, slug: &str) -> Vendor {
        Vendor {
            id: id.into(),
            slug: slug.into(),
            name: slug.into(),
            base_url: "http://127.0.0.1:9/v1".into(),
            default_model: None,
            encrypted_api_key: None,
            timeout_seconds: 5,
            retry_count: 0,
            is_active: true,
            created_at: 1,
            updated_at: 1,
        }
    }

    fn token(id: &str, owner: &str) -> Token {
        Token {
            id: id.into(),
            owner: TokenOwner::Vendor(owner.into()),
            kind: TokenKind::Activation,
            token_hash: "ab".into(),
            label: None,
            is_active: true,
            expires_at: None,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn rejected_batch_leaves_store_untouched() {
        let store = MemoryStore::new();
        store
            .apply(vec![WriteOp::InsertVendor(vendor("v1", "openai"))])
            .await
            .unwrap();

        let err = store
            .apply(vec![
                WriteOp::InsertVendor(vendor("v2", "deepseek")),
                WriteOp::InsertVendor(vendor("v3", "openai")),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        assert!(store.get_vendor("v2").await.unwrap().is_none());
        assert_eq!(
            store
                .list_vendors(&VendorFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn second_live_token_for_same_owner_conflicts() {
        let store = MemoryStore::new();
        store
            .apply(vec![WriteOp::InsertToken(token("t1", "v1"))])
            .await
            .unwrap();
        let err = store
            .apply(vec![WriteOp::InsertToken(token("t2", "v1"))])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));

        // Revoking the first and issuing the second in one batch is fine.
        let mut revoked = token("t1", "v1");
        revoked.is_active = false;
        store
            .apply(vec![
                WriteOp::UpdateToken(revoked),
                WriteOp::InsertToken(token("t2", "v1")),
            ])
            .await
            .unwrap();
        let live = store
            .list_tokens(&TokenFilter {
                active: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "t2");
    }

    #[tokio::test]
    async fn slug_cannot_change_on_update() {
        let store = MemoryStore::new();
        store
            .apply(vec![WriteOp::InsertVendor(vendor("v1", "openai"))])
            .await
            .unwrap();
        let err = store
            .apply(vec![WriteOp::UpdateVendor(vendor("v1", "renamed"))])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        assert!(store.get_vendor_by_slug("openai").await.unwrap().is_some());
    }
}
