/* llmgate/src/registry.rs

Vendor catalog: resolution, listing, upsert and deactivation.

- `resolve` never falls back: unknown or inactive vendors are `VendorNotFound`.
- Stored API keys are encrypted with `CredentialCipher` before they are staged
  and decrypted only on demand by `credential_for`.
- Reads go through an optional snapshot cache (`Arc<Vendor>` per key, TTL).
  Entries are replaced whole, so a reader sees the old or the new record,
  never a mix. Every registry write drops the affected entries after commit.
- The "custom" vendor is a distinguished variant built from configuration: it
  points at a fixed base URL (self-hosted / local endpoint) and never touches
  the encrypted-storage path; its key, if any, comes from an env var.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cipher::{CredentialCipher, PlainApiKey};
use crate::error::{GatewayError, Result};
use crate::repository::{validate_slug, Repository, VendorRepository};
use crate::store::{StoreBackend, Vendor, VendorFilter};
use crate::uow::{Session, UnitOfWork};

pub const CUSTOM_VENDOR_SLUG: &str = "custom";
pub const DEFAULT_VENDOR_TIMEOUT_SECONDS: u64 = 30;

/// Well-known vendor base URLs used when an upsert omits `base_url`.
pub fn default_base_url(slug: &str) -> Option<&'static str> {
    match slug {
        "openai" => Some("https://api.openai.com/v1"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        "google" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "local" => Some("http://localhost:1234/v1"),
        _ => None,
    }
}

/// Where the bearer credential for a resolved vendor comes from.
#[derive(Clone)]
pub enum Credential {
    Encrypted(String),
    Env(String),
    None,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Encrypted(_) => f.write_str("Encrypted(..)"),
            Credential::Env(var) => write!(f, "Env({var})"),
            Credential::None => f.write_str("None"),
        }
    }
}

/// Per-call view of a vendor. Holds no plaintext.
#[derive(Debug, Clone)]
pub struct ResolvedVendor {
    pub id: String,
    pub slug: String,
    pub base_url: String,
    pub default_model: Option<String>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub credential: Credential,
}

impl ResolvedVendor {
    pub fn from_vendor(vendor: &Vendor) -> Self {
        Self {
            id: vendor.id.clone(),
            slug: vendor.slug.clone(),
            base_url: vendor.base_url.clone(),
            default_model: vendor.default_model.clone(),
            timeout: Duration::from_secs(vendor.timeout_seconds.max(1)),
            retry_count: vendor.retry_count,
            credential: match &vendor.encrypted_api_key {
                Some(blob) => Credential::Encrypted(blob.clone()),
                None => Credential::None,
            },
        }
    }

    /// `base_url` joined with a relative API path.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn is_custom(&self) -> bool {
        self.slug == CUSTOM_VENDOR_SLUG && self.id.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CustomVendor {
    pub base_url: String,
    pub default_model: Option<String>,
    /// Environment variable holding the key; `None` for keyless endpoints.
    pub api_key_env: Option<String>,
    pub timeout_seconds: u64,
    pub retry_count: u32,
}

impl CustomVendor {
    fn resolved(&self) -> ResolvedVendor {
        ResolvedVendor {
            id: String::new(),
            slug: CUSTOM_VENDOR_SLUG.to_string(),
            base_url: self.base_url.clone(),
            default_model: self.default_model.clone(),
            timeout: Duration::from_secs(self.timeout_seconds.max(1)),
            retry_count: self.retry_count,
            credential: match &self.api_key_env {
                Some(var) => Credential::Env(var.clone()),
                None => Credential::None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub default_timeout_seconds: u64,
    pub default_retry_count: u32,
    /// `None` disables the read cache.
    pub cache_ttl: Option<Duration>,
    pub custom: Option<CustomVendor>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            default_timeout_seconds: DEFAULT_VENDOR_TIMEOUT_SECONDS,
            default_retry_count: 2,
            cache_ttl: Some(Duration::from_secs(60)),
            custom: None,
        }
    }
}

/// Input for create-or-update. Absent fields keep their current value on
/// update and fall back to defaults on create.
#[derive(Clone, Default, Deserialize)]
pub struct VendorSpec {
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Plaintext key; encrypted before it is staged.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl std::fmt::Debug for VendorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorSpec")
            .field("slug", &self.slug)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

struct CacheEntry {
    vendor: Arc<Vendor>,
    fetched_at: Instant,
}

pub struct VendorRegistry {
    store: Arc<dyn StoreBackend>,
    cipher: CredentialCipher,
    options: RegistryOptions,
    cache: Option<RwLock<HashMap<String, CacheEntry>>>,
    /// Bumped by every invalidation; a store read that started under an older
    /// generation is returned but not cached.
    generation: AtomicU64,
}

impl VendorRegistry {
    pub fn new(store: Arc<dyn StoreBackend>, cipher: CredentialCipher, options: RegistryOptions) -> Self {
        let cache = options.cache_ttl.map(|_| RwLock::new(HashMap::new()));
        if cache.is_none() {
            debug!("Vendor cache disabled");
        }
        Self {
            store,
            cipher,
            options,
            cache,
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> Arc<dyn StoreBackend> {
        self.store.clone()
    }

    pub fn custom_vendor(&self) -> Option<ResolvedVendor> {
        self.options.custom.as_ref().map(CustomVendor::resolved)
    }

    /// Resolve a vendor by slug or id for one dispatch.
    pub async fn resolve(&self, key: &str) -> Result<ResolvedVendor> {
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(GatewayError::VendorNotFound(String::new()));
        }
        if key == CUSTOM_VENDOR_SLUG {
            if let Some(custom) = self.custom_vendor() {
                return Ok(custom);
            }
        }
        match self.lookup(&key).await? {
            Some(vendor) if vendor.is_active => Ok(ResolvedVendor::from_vendor(&vendor)),
            _ => Err(GatewayError::VendorNotFound(key)),
        }
    }

    /// Stored record by slug or id, active or not.
    pub async fn get(&self, key: &str) -> Result<Option<Arc<Vendor>>> {
        self.lookup(&key.trim().to_ascii_lowercase()).await
    }

    async fn lookup(&self, key: &str) -> Result<Option<Arc<Vendor>>> {
        if let Some(hit) = self.cache_lookup(key) {
            return Ok(Some(hit));
        }
        let generation = self.generation.load(Ordering::Acquire);
        let found = match self.store.get_vendor_by_slug(key).await? {
            Some(v) => Some(v),
            None => self.store.get_vendor(key).await?,
        };
        Ok(found.map(|v| self.cache_upsert(key, v, generation)))
    }

    fn cache_lookup(&self, key: &str) -> Option<Arc<Vendor>> {
        let ttl = self.options.cache_ttl?;
        let cache = self.cache.as_ref()?;
        let map = cache.read().ok()?;
        map.get(key)
            .filter(|entry| entry.fetched_at.elapsed() < ttl)
            .map(|entry| entry.vendor.clone())
    }

    fn cache_upsert(&self, key: &str, vendor: Vendor, generation: u64) -> Arc<Vendor> {
        let vendor = Arc::new(vendor);
        if let Some(cache) = &self.cache {
            if let Ok(mut map) = cache.write() {
                // Checked under the write lock so it cannot interleave with `invalidate`.
                if self.generation.load(Ordering::Acquire) != generation {
                    debug!(vendor = %vendor.slug, "Skipping cache fill after concurrent invalidation");
                    return vendor;
                }
                map.insert(
                    key.to_string(),
                    CacheEntry {
                        vendor: vendor.clone(),
                        fetched_at: Instant::now(),
                    },
                );
            }
        }
        vendor
    }

    /// Drop every cache entry for this vendor. Call after the write commits.
    pub fn invalidate(&self, vendor: &Vendor) {
        if let Some(cache) = &self.cache {
            if let Ok(mut map) = cache.write() {
                self.generation.fetch_add(1, Ordering::AcqRel);
                map.retain(|_, entry| entry.vendor.id != vendor.id);
                map.remove(&vendor.slug);
                map.remove(&vendor.id);
            }
        }
    }

    pub async fn list(&self, filter: &VendorFilter) -> Result<Vec<Vendor>> {
        self.store.list_vendors(filter).await
    }

    /// Decrypt (or read) the credential for exactly one outbound call.
    pub fn credential_for(&self, vendor: &ResolvedVendor) -> Result<Option<PlainApiKey>> {
        match &vendor.credential {
            Credential::Encrypted(blob) => self.cipher.decrypt(blob).map(Some).map_err(|err| {
                warn!(vendor = %vendor.slug, "Stored API key could not be decrypted");
                err
            }),
            Credential::Env(var) => Ok(std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PlainApiKey::new)),
            Credential::None => Ok(None),
        }
    }

    /// Create or update a vendor in its own unit of work.
    pub async fn upsert(&self, spec: VendorSpec) -> Result<Vendor> {
        let mut uow = UnitOfWork::new(self.store.clone());
        let outcome = self.upsert_in(uow.open()?, spec).await;
        if outcome.is_ok() {
            uow.mark_for_commit();
        }
        let vendor = uow.finish(outcome).await?;
        self.invalidate(&vendor);
        info!(vendor = %vendor.slug, active = vendor.is_active, "Vendor upserted");
        Ok(vendor)
    }

    /// Stage a create-or-update inside the caller's session. The caller owns
    /// the commit and must call [`VendorRegistry::invalidate`] afterwards.
    pub async fn upsert_in(&self, session: &mut Session, spec: VendorSpec) -> Result<Vendor> {
        let slug = spec.slug.trim().to_ascii_lowercase();
        validate_slug(&slug)?;
        if slug == CUSTOM_VENDOR_SLUG && self.options.custom.is_some() {
            return Err(GatewayError::InvalidInput(format!(
                "slug '{CUSTOM_VENDOR_SLUG}' is reserved for the configured custom vendor"
            )));
        }
        let encrypted = match spec.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Some(self.cipher.encrypt(key)?),
            _ => None,
        };
        let repo = VendorRepository;

        match repo.get_by_slug(session, &slug).await? {
            Some(mut existing) => {
                if let Some(name) = spec.name {
                    existing.name = name;
                }
                if let Some(url) = spec.base_url {
                    existing.base_url = normalize_base_url(&url)?;
                }
                if spec.default_model.is_some() {
                    existing.default_model = spec.default_model;
                }
                if encrypted.is_some() {
                    existing.encrypted_api_key = encrypted;
                }
                if let Some(t) = spec.timeout_seconds {
                    existing.timeout_seconds = t.max(1);
                }
                if let Some(r) = spec.retry_count {
                    existing.retry_count = r;
                }
                if let Some(active) = spec.is_active {
                    existing.is_active = active;
                }
                repo.update(session, existing).await
            }
            None => {
                let base_url = match spec.base_url.as_deref() {
                    Some(url) => normalize_base_url(url)?,
                    None => default_base_url(&slug).map(str::to_string).ok_or_else(|| {
                        GatewayError::InvalidInput(format!("base_url is required for vendor '{slug}'"))
                    })?,
                };
                let draft = Vendor {
                    id: String::new(),
                    name: spec.name.unwrap_or_else(|| slug.clone()),
                    slug,
                    base_url,
                    default_model: spec.default_model,
                    encrypted_api_key: encrypted,
                    timeout_seconds: spec
                        .timeout_seconds
                        .unwrap_or(self.options.default_timeout_seconds)
                        .max(1),
                    retry_count: spec.retry_count.unwrap_or(self.options.default_retry_count),
                    is_active: spec.is_active.unwrap_or(true),
                    created_at: 0,
                    updated_at: 0,
                };
                repo.create(session, draft).await
            }
        }
    }

    /// Soft delete: the record stays, `resolve` stops returning it.
    pub async fn deactivate(&self, key: &str) -> Result<Vendor> {
        let key = key.trim().to_ascii_lowercase();
        let mut uow = UnitOfWork::new(self.store.clone());
        let outcome = async {
            let session = uow.open()?;
            let repo = VendorRepository;
            let mut vendor = repo
                .find(session, &key)
                .await?
                .ok_or_else(|| GatewayError::VendorNotFound(key.clone()))?;
            vendor.is_active = false;
            repo.update(session, vendor).await
        }
        .await;
        if outcome.is_ok() {
            uow.mark_for_commit();
        }
        let vendor = uow.finish(outcome).await?;
        self.invalidate(&vendor);
        info!(vendor = %vendor.slug, "Vendor deactivated");
        Ok(vendor)
    }

    /// Upsert every entry, skipping (and logging) the ones that fail.
    pub async fn seed(&self, specs: Vec<VendorSpec>) -> usize {
        let mut applied = 0usize;
        for spec in specs {
            let slug = spec.slug.clone();
            match self.upsert(spec).await {
                Ok(_) => applied += 1,
                Err(err) => warn!(vendor = %slug, error = %err, "Skipping vendor seed entry"),
            }
        }
        applied
    }
}

fn normalize_base_url(url: &str) -> Result<String> {
    let url = url.trim().trim_end_matches('/');
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(GatewayError::InvalidInput(format!(
            "base_url must be an http(s) URL, got '{url}'"
        )));
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    fn registry_with(options: RegistryOptions) -> VendorRegistry {
        VendorRegistry::new(
            Arc::new(MemoryStore::new()),
            CredentialCipher::new("registry-test").unwrap(),
            options,
        )
    }

    fn spec(slug: &str, key: Option<&str>) -> VendorSpec {
        VendorSpec {
            slug: slug.into(),
            base_url: Some("http://127.0.0.1:9/v1/".into()),
            default_model: Some("m-1".into()),
            api_key: key.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_encrypts_and_resolve_decrypts() {
        let registry = registry_with(RegistryOptions::default());
        let vendor = registry.upsert(spec("openai", Some("sk-abc"))).await.unwrap();
        let stored_key = vendor.encrypted_api_key.clone().unwrap();
        assert_ne!(stored_key, "sk-abc");
        assert_eq!(vendor.base_url, "http://127.0.0.1:9/v1");

        let resolved = registry.resolve("OpenAI").await.unwrap();
        let key = registry.credential_for(&resolved).unwrap().unwrap();
        assert_eq!(key.expose(), "sk-abc");
        assert_eq!(resolved.endpoint("chat/completions"), "http://127.0.0.1:9/v1/chat/completions");
    }

    #[tokio::test]
    async fn unknown_and_inactive_vendors_do_not_resolve() {
        let registry = registry_with(RegistryOptions::default());
        assert!(matches!(
            registry.resolve("unknown-vendor").await,
            Err(GatewayError::VendorNotFound(_))
        ));

        registry.upsert(spec("deepseek", None)).await.unwrap();
        assert!(registry.resolve("deepseek").await.is_ok());
        registry.deactivate("deepseek").await.unwrap();
        // The cached active snapshot must not survive the deactivation.
        assert!(matches!(
            registry.resolve("deepseek").await,
            Err(GatewayError::VendorNotFound(_))
        ));
    }

    /// Parks the first armed slug read after it has fetched the record.
    struct StallingStore {
        inner: MemoryStore,
        armed: std::sync::atomic::AtomicBool,
        reached: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl StoreBackend for StallingStore {
        fn name(&self) -> &'static str {
            "stalling"
        }

        async fn get_vendor(&self, id: &str) -> Result<Option<Vendor>> {
            self.inner.get_vendor(id).await
        }

        async fn get_vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
            let found = self.inner.get_vendor_by_slug(slug).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            Ok(found)
        }

        async fn list_vendors(&self, filter: &VendorFilter) -> Result<Vec<Vendor>> {
            self.inner.list_vendors(filter).await
        }

        async fn get_token(&self, id: &str) -> Result<Option<crate::store::Token>> {
            self.inner.get_token(id).await
        }

        async fn list_tokens(
            &self,
            filter: &crate::store::TokenFilter,
        ) -> Result<Vec<crate::store::Token>> {
            self.inner.list_tokens(filter).await
        }

        async fn apply(&self, batch: Vec<crate::store::WriteOp>) -> Result<()> {
            self.inner.apply(batch).await
        }
    }

    #[tokio::test]
    async fn read_overlapping_deactivate_does_not_repopulate_cache() {
        let store = Arc::new(StallingStore {
            inner: MemoryStore::new(),
            armed: std::sync::atomic::AtomicBool::new(false),
            reached: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let registry = Arc::new(VendorRegistry::new(
            store.clone(),
            CredentialCipher::new("registry-test").unwrap(),
            RegistryOptions::default(),
        ));
        registry.upsert(spec("openai", None)).await.unwrap();

        store.armed.store(true, Ordering::SeqCst);
        let reader = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("openai").await })
        };
        store.reached.notified().await;

        registry.deactivate("openai").await.unwrap();
        store.release.notify_one();
        // The overlapping read may still see the record it fetched.
        assert!(reader.await.unwrap().is_ok());

        assert!(matches!(
            registry.resolve("openai").await,
            Err(GatewayError::VendorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_keeps_key_when_none_supplied() {
        let registry = registry_with(RegistryOptions::default());
        let created = registry.upsert(spec("openai", Some("sk-1"))).await.unwrap();
        let updated = registry
            .upsert(VendorSpec {
                slug: "openai".into(),
                retry_count: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.retry_count, 5);
        assert_eq!(updated.encrypted_api_key, created.encrypted_api_key);
        assert_eq!(registry.resolve("openai").await.unwrap().retry_count, 5);
    }

    #[tokio::test]
    async fn custom_vendor_bypasses_storage() {
        std::env::set_var("LLMGATE_TEST_CUSTOM_KEY", "sk-local");
        let registry = registry_with(RegistryOptions {
            custom: Some(CustomVendor {
                base_url: "http://localhost:1234/v1".into(),
                default_model: Some("llama".into()),
                api_key_env: Some("LLMGATE_TEST_CUSTOM_KEY".into()),
                timeout_seconds: 10,
                retry_count: 0,
            }),
            ..Default::default()
        });
        let resolved = registry.resolve("custom").await.unwrap();
        assert!(resolved.is_custom());
        assert_eq!(
            registry.credential_for(&resolved).unwrap().unwrap().expose(),
            "sk-local"
        );
        assert!(registry.upsert(spec("custom", None)).await.is_err());
        std::env::remove_var("LLMGATE_TEST_CUSTOM_KEY");
    }

    #[tokio::test]
    async fn missing_base_url_uses_known_default_or_fails() {
        let registry = registry_with(RegistryOptions::default());
        let v = registry
            .upsert(VendorSpec {
                slug: "openai".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(v.base_url, "https://api.openai.com/v1");
        let err = registry
            .upsert(VendorSpec {
                slug: "nobody".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn corrupted_key_surfaces_decryption_failure() {
        let store = Arc::new(MemoryStore::new());
        let writer = VendorRegistry::new(
            store.clone(),
            CredentialCipher::new("one-secret").unwrap(),
            RegistryOptions::default(),
        );
        writer.upsert(spec("openai", Some("sk-x"))).await.unwrap();
        let reader = VendorRegistry::new(
            store,
            CredentialCipher::new("other-secret").unwrap(),
            RegistryOptions::default(),
        );
        let resolved = reader.resolve("openai").await.unwrap();
        assert!(matches!(
            reader.credential_for(&resolved),
            Err(GatewayError::DecryptionFailed)
        ));
    }
}
