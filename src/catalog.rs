//! Aggregated model listing across active vendors.
//!
//! Each vendor's `GET <base_url>/models` is fetched concurrently and cached
//! per vendor. A vendor that fails is logged and left out of this listing;
//! the other vendors' cache entries stay valid.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::registry::{ResolvedVendor, VendorRegistry};
use crate::store::VendorFilter;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelEntry {
    /// Composite `vendor__model` id, usable as `model` in chat requests.
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
}

impl ModelEntry {
    fn new(vendor: &str, model: &str) -> Self {
        Self {
            id: format!("{vendor}__{model}"),
            object: "model",
            owned_by: vendor.to_string(),
        }
    }
}

struct CachedModels {
    models: Vec<ModelEntry>,
    fetched_at: Instant,
}

pub struct ModelCatalog {
    http: reqwest::Client,
    registry: Arc<VendorRegistry>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedModels>>,
}

impl ModelCatalog {
    pub fn new(http: reqwest::Client, registry: Arc<VendorRegistry>, ttl: Duration) -> Self {
        Self {
            http,
            registry,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn list_models(&self, force_refresh: bool) -> Result<Vec<ModelEntry>> {
        let mut vendors: Vec<ResolvedVendor> = self
            .registry
            .list(&VendorFilter::active_only())
            .await?
            .iter()
            .map(ResolvedVendor::from_vendor)
            .collect();
        if let Some(custom) = self.registry.custom_vendor() {
            vendors.push(custom);
        }

        let mut listed = Vec::new();
        let mut stale = Vec::new();
        {
            let cache = self.cache.read().await;
            for vendor in vendors {
                match cache.get(&vendor.slug) {
                    Some(hit) if !force_refresh && hit.fetched_at.elapsed() < self.ttl => {
                        listed.extend(hit.models.iter().cloned());
                    }
                    _ => stale.push(vendor),
                }
            }
        }

        let fetched = join_all(stale.iter().map(|vendor| self.fetch(vendor))).await;
        let mut cache = self.cache.write().await;
        for (vendor, outcome) in stale.iter().zip(fetched) {
            match outcome {
                Ok(models) => {
                    debug!(vendor = %vendor.slug, count = models.len(), "Fetched vendor models");
                    listed.extend(models.iter().cloned());
                    cache.insert(
                        vendor.slug.clone(),
                        CachedModels {
                            models,
                            fetched_at: Instant::now(),
                        },
                    );
                }
                Err(err) => {
                    warn!(vendor = %vendor.slug, error = %err, "Failed to list vendor models");
                }
            }
        }

        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }

    async fn fetch(&self, vendor: &ResolvedVendor) -> Result<Vec<ModelEntry>> {
        let api_key = self.registry.credential_for(vendor)?;
        let mut rb = self.http.get(vendor.endpoint("models"));
        if let Some(key) = api_key.as_ref() {
            rb = rb.bearer_auth(key.expose());
        }
        let call = async {
            let response = rb.send().await.map_err(|e| GatewayError::VendorTransient {
                vendor: vendor.slug.clone(),
                status: None,
                reason: if e.is_connect() {
                    "connection failed".into()
                } else {
                    "request failed".into()
                },
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(GatewayError::VendorTransient {
                    vendor: vendor.slug.clone(),
                    status: Some(status.as_u16()),
                    reason: format!("HTTP {}", status.as_u16()),
                });
            }
            response.json::<Value>().await.map_err(|_| GatewayError::MalformedResponse {
                vendor: vendor.slug.clone(),
                reason: "models listing is not valid JSON".into(),
            })
        };
        let body = tokio::time::timeout(vendor.timeout, call)
            .await
            .map_err(|_| GatewayError::VendorTimeout {
                vendor: vendor.slug.clone(),
                timeout_secs: vendor.timeout.as_secs(),
            })??;
        Ok(parse_models(&vendor.slug, &body))
    }

    pub async fn invalidate(&self, vendor_slug: &str) {
        self.cache.write().await.remove(vendor_slug);
    }
}

/// Model ids from an OpenAI style `{"data": [...]}` or a `{"models": [...]}`
/// listing. Entries without a string `id` are skipped.
fn parse_models(vendor: &str, body: &Value) -> Vec<ModelEntry> {
    body.get("data")
        .or_else(|| body.get("models"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("id").and_then(Value::as_str))
                .map(|id| ModelEntry::new(vendor, id))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_data_and_models_shapes() {
        let openai = json!({ "object": "list", "data": [{ "id": "gpt-4o" }, { "name": "no-id" }] });
        assert_eq!(
            parse_models("openai", &openai),
            vec![ModelEntry::new("openai", "gpt-4o")]
        );
        let alt = json!({ "models": [{ "id": "claude-3" }] });
        assert_eq!(parse_models("anthropic", &alt)[0].id, "anthropic__claude-3");
        assert!(parse_models("x", &json!({ "unexpected": true })).is_empty());
    }
}
