/* llmgate/src/store_sled.rs

sled-backed storage (default feature "sled").

Trees:
- vendors        id   -> Vendor (JSON)
- vendor_slugs   slug -> id
- tokens         id   -> Token (JSON)

A batch is validated under a process-local commit lock, then written with a
single multi-tree sled transaction, so either every tree sees the batch or
none does. sled is embedded and single-process, which is what makes the
process-local lock sufficient.
*/

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::store::{
    validate_batch, CommittedState, StoreBackend, Token, TokenFilter, TokenKind, TokenOwner,
    Vendor, VendorFilter, WriteOp,
};
use crate::util::now_epoch;

pub struct SledStore {
    db: sled::Db,
    vendors: sled::Tree,
    slugs: sled::Tree,
    tokens: sled::Tree,
    commit_lock: Mutex<()>,
}

impl SledStore {
    pub fn open_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let db = sled::open(&path).map_err(GatewayError::storage)?;
        let vendors = db.open_tree("vendors").map_err(GatewayError::storage)?;
        let slugs = db.open_tree("vendor_slugs").map_err(GatewayError::storage)?;
        let tokens = db.open_tree("tokens").map_err(GatewayError::storage)?;
        debug!(path = %path.display(), "opened sled store");
        Ok(Self {
            db,
            vendors,
            slugs,
            tokens,
            commit_lock: Mutex::new(()),
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| GatewayError::Storage(format!("corrupt record: {e}")))
    }

    fn scan_tokens(&self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        for item in self.tokens.iter() {
            let (_k, v) = item.map_err(GatewayError::storage)?;
            out.push(Self::decode::<Token>(&v)?);
        }
        Ok(out)
    }

    fn log_commit_latency(ops: usize, elapsed: Duration) {
        if elapsed >= Duration::from_millis(250) {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                ops, "sled commit latency"
            );
        } else if elapsed >= Duration::from_millis(50) {
            debug!(
                duration_ms = elapsed.as_millis() as u64,
                ops, "sled commit latency"
            );
        }
    }
}

impl CommittedState for SledStore {
    fn vendor(&self, id: &str) -> Result<Option<Vendor>> {
        match self.vendors.get(id.as_bytes()).map_err(GatewayError::storage)? {
            Some(ivec) => Ok(Some(Self::decode(&ivec)?)),
            None => Ok(None),
        }
    }

    fn vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
        match self.slugs.get(slug.as_bytes()).map_err(GatewayError::storage)? {
            Some(id) => {
                let id = String::from_utf8_lossy(&id).into_owned();
                self.vendor(&id)
            }
            None => Ok(None),
        }
    }

    fn token(&self, id: &str) -> Result<Option<Token>> {
        match self.tokens.get(id.as_bytes()).map_err(GatewayError::storage)? {
            Some(ivec) => Ok(Some(Self::decode(&ivec)?)),
            None => Ok(None),
        }
    }

    fn tokens_for(&self, owner: &TokenOwner, kind: TokenKind) -> Result<Vec<Token>> {
        Ok(self
            .scan_tokens()?
            .into_iter()
            .filter(|t| &t.owner == owner && t.kind == kind)
            .collect())
    }
}

/// Pre-encoded batch entry so the transaction closure stays infallible
/// apart from sled itself.
enum Encoded {
    Vendor {
        id: String,
        slug: String,
        value: Vec<u8>,
    },
    Token {
        id: String,
        value: Vec<u8>,
    },
}

#[async_trait::async_trait]
impl StoreBackend for SledStore {
    fn name(&self) -> &'static str {
        "sled"
    }

    async fn get_vendor(&self, id: &str) -> Result<Option<Vendor>> {
        self.vendor(id)
    }

    async fn get_vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
        self.vendor_by_slug(slug)
    }

    async fn list_vendors(&self, filter: &VendorFilter) -> Result<Vec<Vendor>> {
        let mut out = Vec::new();
        for item in self.vendors.iter() {
            let (_k, v) = item.map_err(GatewayError::storage)?;
            let vendor: Vendor = Self::decode(&v)?;
            if filter.matches(&vendor) {
                out.push(vendor);
            }
        }
        Ok(filter.finish(out))
    }

    async fn get_token(&self, id: &str) -> Result<Option<Token>> {
        self.token(id)
    }

    async fn list_tokens(&self, filter: &TokenFilter) -> Result<Vec<Token>> {
        let matched = self
            .scan_tokens()?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        Ok(filter.finish(matched))
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()> {
        let start = Instant::now();
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|e| GatewayError::Storage(format!("Lock error: {}", e)))?;
        validate_batch(self, &batch, now_epoch())?;

        let mut encoded = Vec::with_capacity(batch.len());
        for op in &batch {
            match op {
                WriteOp::InsertVendor(v) | WriteOp::UpdateVendor(v) => {
                    encoded.push(Encoded::Vendor {
                        id: v.id.clone(),
                        slug: v.slug.clone(),
                        value: serde_json::to_vec(v).map_err(GatewayError::storage)?,
                    })
                }
                WriteOp::InsertToken(t) | WriteOp::UpdateToken(t) => {
                    encoded.push(Encoded::Token {
                        id: t.id.clone(),
                        value: serde_json::to_vec(t).map_err(GatewayError::storage)?,
                    })
                }
            }
        }

        (&self.vendors, &self.slugs, &self.tokens)
            .transaction(|(vendors, slugs, tokens)| {
                for entry in &encoded {
                    match entry {
                        Encoded::Vendor { id, slug, value } => {
                            vendors.insert(id.as_bytes(), value.as_slice())?;
                            slugs.insert(slug.as_bytes(), id.as_bytes())?;
                        }
                        Encoded::Token { id, value } => {
                            tokens.insert(id.as_bytes(), value.as_slice())?;
                        }
                    }
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| {
                GatewayError::Storage(format!("sled transaction failed: {e:?}"))
            })?;
        self.db.flush().map_err(GatewayError::storage)?;
        Self::log_commit_latency(encoded.len(), start.elapsed());
        Ok(())
    }
}
