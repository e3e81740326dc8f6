//! Process configuration: command-line flags with `LLMGATE_*` env fallbacks,
//! plus an optional YAML file of vendors seeded at startup.
//!
//! ```yaml
//! vendors:
//!   - slug: openai
//!     default_model: gpt-4o-mini
//!     api_key_env: OPENAI_API_KEY
//!   - slug: local
//!     base_url: http://localhost:1234/v1
//!     retry_count: 0
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use serde::Deserialize;

use crate::cipher::CredentialCipher;
use crate::dispatcher::DispatcherOptions;
use crate::registry::{CustomVendor, RegistryOptions, VendorSpec};
use crate::store::StoreSpec;

#[derive(Parser, Clone)]
#[command(name = "llmgate", version, about = "Gateway for OpenAI-compatible LLM vendors")]
pub struct GatewayConfig {
    #[arg(long, env = "LLMGATE_BIND_ADDR", default_value = "0.0.0.0:8088")]
    pub bind_addr: String,

    /// Secret the credential encryption key is derived from.
    #[arg(long, env = "LLMGATE_SECRET_KEY", hide_env_values = true)]
    pub secret_key: String,

    /// memory | sled:<path> | sqlite:<url>
    #[arg(long, env = "LLMGATE_STORE", default_value = "sled:./data/llmgate.db")]
    pub store: String,

    #[arg(long, env = "LLMGATE_VENDORS_FILE")]
    pub vendors_file: Option<String>,

    #[arg(long, env = "LLMGATE_DEFAULT_TIMEOUT_SECONDS", default_value_t = 30)]
    pub default_timeout_seconds: u64,

    #[arg(long, env = "LLMGATE_DEFAULT_RETRIES", default_value_t = 2)]
    pub default_retries: u32,

    #[arg(long, env = "LLMGATE_RETRY_BASE_DELAY_MS", default_value_t = 250)]
    pub retry_base_delay_ms: u64,

    #[arg(long, env = "LLMGATE_RETRY_MAX_DELAY_MS", default_value_t = 5000)]
    pub retry_max_delay_ms: u64,

    /// Forward proxy for vendor traffic (http://, https:// or socks5://).
    #[arg(long, env = "LLMGATE_PROXY_URL", hide_env_values = true)]
    pub proxy_url: Option<String>,

    /// Ignore proxy settings, including HTTP(S)_PROXY.
    #[arg(long, env = "LLMGATE_NO_PROXY", default_value_t = false)]
    pub no_proxy: bool,

    /// Base URL of a self-hosted vendor reachable as slug "custom".
    #[arg(long, env = "LLMGATE_CUSTOM_VENDOR_URL")]
    pub custom_vendor_url: Option<String>,

    #[arg(long, env = "LLMGATE_CUSTOM_VENDOR_MODEL")]
    pub custom_vendor_model: Option<String>,

    /// Env var holding the custom vendor's key, read on every call.
    #[arg(long, env = "LLMGATE_CUSTOM_VENDOR_KEY_ENV")]
    pub custom_vendor_key_env: Option<String>,

    /// Bearer token for /admin routes. Admin routes are off when unset.
    #[arg(long, env = "LLMGATE_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Relay buffer between a vendor stream and the caller, in chunks.
    #[arg(long, env = "LLMGATE_STREAM_BUFFER", default_value_t = 16)]
    pub stream_buffer: usize,

    #[arg(long, env = "LLMGATE_MODELS_CACHE_TTL_SECONDS", default_value_t = 3600)]
    pub models_cache_ttl_seconds: u64,

    #[arg(long, env = "LLMGATE_VENDOR_CACHE_TTL_SECONDS", default_value_t = 60)]
    pub vendor_cache_ttl_seconds: u64,

    #[arg(long, env = "LLMGATE_DISABLE_VENDOR_CACHE", default_value_t = false)]
    pub disable_vendor_cache: bool,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind_addr", &self.bind_addr)
            .field("store", &self.store)
            .field("vendors_file", &self.vendors_file)
            .field("default_timeout_seconds", &self.default_timeout_seconds)
            .field("default_retries", &self.default_retries)
            .field("proxy", &self.proxy_url.as_ref().map(|_| "<set>"))
            .field("custom_vendor_url", &self.custom_vendor_url)
            .field("admin", &self.admin_token.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    /// Defaults for everything except the secret; handy for tests and embedding.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            bind_addr: "127.0.0.1:8088".into(),
            secret_key: secret.into(),
            store: "memory".into(),
            vendors_file: None,
            default_timeout_seconds: 30,
            default_retries: 2,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 5000,
            proxy_url: None,
            no_proxy: false,
            custom_vendor_url: None,
            custom_vendor_model: None,
            custom_vendor_key_env: None,
            admin_token: None,
            stream_buffer: 16,
            models_cache_ttl_seconds: 3600,
            vendor_cache_ttl_seconds: 60,
            disable_vendor_cache: false,
        }
    }

    pub fn cipher(&self) -> anyhow::Result<CredentialCipher> {
        if self.secret_key.trim().is_empty() {
            return Err(anyhow!("LLMGATE_SECRET_KEY must not be empty"));
        }
        CredentialCipher::new(&self.secret_key).context("failed to initialise credential cipher")
    }

    pub fn store_spec(&self) -> anyhow::Result<StoreSpec> {
        StoreSpec::parse(&self.store).ok_or_else(|| {
            anyhow!(
                "unsupported store '{}': use memory, sled:<path> or sqlite:<url>",
                self.store
            )
        })
    }

    pub fn registry_options(&self) -> RegistryOptions {
        let custom = self
            .custom_vendor_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|url| CustomVendor {
                base_url: url.trim_end_matches('/').to_string(),
                default_model: self.custom_vendor_model.clone(),
                api_key_env: self.custom_vendor_key_env.clone(),
                timeout_seconds: self.default_timeout_seconds,
                retry_count: self.default_retries,
            });
        RegistryOptions {
            default_timeout_seconds: self.default_timeout_seconds,
            default_retry_count: self.default_retries,
            cache_ttl: (!self.disable_vendor_cache)
                .then(|| Duration::from_secs(self.vendor_cache_ttl_seconds)),
            custom,
        }
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms)),
            stream_buffer: self.stream_buffer.max(1),
        }
    }
}

/// One vendor entry of the seed file.
#[derive(Deserialize)]
pub struct SeedVendor {
    #[serde(flatten)]
    pub spec: VendorSpec,
    /// Read the key from this env var instead of storing it in the file.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct VendorSeedFile {
    #[serde(default)]
    pub vendors: Vec<SeedVendor>,
}

impl VendorSeedFile {
    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(raw).context("invalid vendor seed file")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read vendor seed file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    /// Resolve `api_key_env` references into specs ready for upsert.
    pub fn into_specs(self) -> Vec<VendorSpec> {
        self.vendors
            .into_iter()
            .map(|entry| {
                let mut spec = entry.spec;
                if spec.api_key.is_none() {
                    if let Some(var) = entry.api_key_env.as_deref() {
                        match std::env::var(var) {
                            Ok(key) if !key.trim().is_empty() => spec.api_key = Some(key),
                            _ => tracing::warn!(
                                vendor = %spec.slug,
                                env = var,
                                "Seed entry names an unset key variable"
                            ),
                        }
                    }
                }
                spec
            })
            .collect()
    }
}
