/* llmgate/src/dispatcher.rs

Vendor dispatch core.

One `dispatch` call:
- resolves the vendor through the registry and decrypts its key once; the
  plaintext lives in this call frame only and is reused for every attempt
- posts to `<base_url>/chat/completions` with a bearer header
- bounds each attempt with the vendor timeout (tokio deadline)
- retries timeouts, connection errors, 429 and 5xx with capped exponential
  backoff, at most `retry_count` extra attempts
- returns the parsed JSON body, or hands an opened stream to `StreamRelay`

Streaming calls are retried only while the connection is being opened; once
the relay owns the body nothing here touches it again.
*/

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::cipher::PlainApiKey;
use crate::error::{DispatchStatus, GatewayError, Result};
use crate::registry::{ResolvedVendor, VendorRegistry};
use crate::relay::{StreamRelay, DEFAULT_RELAY_CAPACITY};

/// Lazy, finite, consume-once sequence of vendor chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub const COMPLETIONS_PATH: &str = "chat/completions";
const MODEL_SEPARATOR: &str = "__";

/// Split a composite `vendor__model` id. The vendor part is lowercased.
pub fn split_composite_model(model: &str) -> Result<(String, String)> {
    match model.split_once(MODEL_SEPARATOR) {
        Some((vendor, name)) if !vendor.trim().is_empty() && !name.trim().is_empty() => {
            Ok((vendor.trim().to_ascii_lowercase(), name.trim().to_string()))
        }
        _ => Err(GatewayError::InvalidInput(format!(
            "invalid model '{model}'. Expected 'vendor__model', e.g. 'openai__gpt-4o'"
        ))),
    }
}

/// Transient request addressed to one vendor.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    /// Vendor slug or id.
    pub vendor: String,
    /// Overrides the vendor's default model.
    pub model: Option<String>,
    pub messages: Option<Vec<Value>>,
    /// Single user turn, used when `messages` is absent.
    pub prompt: Option<String>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Remaining OpenAI-compatible parameters, forwarded untouched.
    pub extra: Map<String, Value>,
}

impl DispatchRequest {
    pub fn prompt(vendor: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn chat(vendor: impl Into<String>, messages: Vec<Value>) -> Self {
        Self {
            vendor: vendor.into(),
            messages: Some(messages),
            ..Default::default()
        }
    }

    /// Build from an OpenAI chat request body. Typed fields are lifted out;
    /// everything else goes to `extra`.
    pub fn from_openai_body(vendor: impl Into<String>, mut body: Map<String, Value>) -> Result<Self> {
        let model = match body.remove("model") {
            Some(Value::String(m)) if !m.trim().is_empty() => Some(m),
            Some(Value::String(_)) | Some(Value::Null) | None => None,
            Some(_) => return Err(GatewayError::InvalidInput("'model' must be a string".into())),
        };
        let messages = match body.remove("messages") {
            Some(Value::Array(items)) => Some(items),
            Some(Value::Null) | None => None,
            Some(_) => return Err(GatewayError::InvalidInput("'messages' must be an array".into())),
        };
        let prompt = match body.remove("prompt") {
            Some(Value::String(p)) => Some(p),
            Some(Value::Null) | None => None,
            Some(_) => return Err(GatewayError::InvalidInput("'prompt' must be a string".into())),
        };
        let stream = body.remove("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        let temperature = body.remove("temperature").and_then(|v| v.as_f64());
        let max_tokens = body.remove("max_tokens").and_then(|v| v.as_u64());
        body.remove("vendor");
        Ok(Self {
            vendor: vendor.into(),
            model,
            messages,
            prompt,
            stream,
            temperature,
            max_tokens,
            extra: body,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Outbound JSON: extra params, then the typed fields on top.
    pub fn outbound_body(&self, vendor: &ResolvedVendor) -> Result<Value> {
        let model = self
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| vendor.default_model.clone())
            .ok_or_else(|| {
                GatewayError::InvalidInput(format!(
                    "no model given and vendor '{}' has no default model",
                    vendor.slug
                ))
            })?;
        let messages = match (&self.messages, &self.prompt) {
            (Some(messages), _) if !messages.is_empty() => Value::Array(messages.clone()),
            (_, Some(prompt)) => json!([{ "role": "user", "content": prompt }]),
            _ => {
                return Err(GatewayError::InvalidInput(
                    "request needs 'messages' or a 'prompt'".into(),
                ))
            }
        };

        let mut body = self.extra.clone();
        body.insert("model".into(), Value::String(model));
        body.insert("messages".into(), messages);
        body.insert("stream".into(), Value::Bool(self.stream));
        if let Some(t) = self.temperature {
            body.insert("temperature".into(), json!(t));
        }
        if let Some(n) = self.max_tokens {
            body.insert("max_tokens".into(), json!(n));
        }
        Ok(Value::Object(body))
    }
}

pub enum DispatchResult {
    Complete { body: Value, attempts: u32 },
    Streaming { chunks: ChunkStream, attempts: u32 },
}

impl DispatchResult {
    /// Always `Success`: failed dispatches are `Err(GatewayError)` and carry
    /// their status through [`GatewayError::dispatch_status`].
    pub fn status(&self) -> DispatchStatus {
        DispatchStatus::Success
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DispatchResult::Complete { attempts, .. } | DispatchResult::Streaming { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_body(self) -> Option<Value> {
        match self {
            DispatchResult::Complete { body, .. } => Some(body),
            DispatchResult::Streaming { .. } => None,
        }
    }

    pub fn into_stream(self) -> Option<ChunkStream> {
        match self {
            DispatchResult::Streaming { chunks, .. } => Some(chunks),
            DispatchResult::Complete { .. } => None,
        }
    }
}

impl std::fmt::Debug for DispatchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchResult::Complete { body, attempts } => f
                .debug_struct("Complete")
                .field("body", body)
                .field("attempts", attempts)
                .finish(),
            DispatchResult::Streaming { attempts, .. } => f
                .debug_struct("Streaming")
                .field("attempts", attempts)
                .finish_non_exhaustive(),
        }
    }
}

/// Retry budget and backoff for one vendor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn for_vendor(vendor: &ResolvedVendor, options: &DispatcherOptions) -> Self {
        Self {
            max_retries: vendor.retry_count,
            initial_delay: options.retry_base_delay,
            max_delay: options.retry_max_delay,
        }
    }

    /// Delay before retry number `retry` (0-based), doubling and capped.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn should_retry(&self, err: &GatewayError, attempts_made: u32) -> bool {
        err.is_retryable() && attempts_made <= self.max_retries
    }

    /// Rate limits and server errors are transient; every other status is final.
    pub fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Relay channel capacity, in chunks.
    pub stream_buffer: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(5),
            stream_buffer: DEFAULT_RELAY_CAPACITY,
        }
    }
}

enum Attempt {
    Json(Value),
    Stream(reqwest::Response),
}

pub struct RequestDispatcher {
    http: reqwest::Client,
    registry: Arc<VendorRegistry>,
    options: DispatcherOptions,
}

impl RequestDispatcher {
    pub fn new(http: reqwest::Client, registry: Arc<VendorRegistry>, options: DispatcherOptions) -> Self {
        Self {
            http,
            registry,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<VendorRegistry> {
        &self.registry
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResult> {
        let vendor = self.registry.resolve(&request.vendor).await?;
        let body = request.outbound_body(&vendor)?;
        let api_key = self.registry.credential_for(&vendor)?;
        let url = vendor.endpoint(COMPLETIONS_PATH);
        let policy = RetryPolicy::for_vendor(&vendor, &self.options);
        let started = Instant::now();

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let outcome = self
                .attempt(&vendor, &url, api_key.as_ref(), &body, request.stream)
                .await;
            match outcome {
                Ok(Attempt::Json(body)) => {
                    log_latency(&vendor.slug, "complete", attempts, started.elapsed());
                    return Ok(DispatchResult::Complete { body, attempts });
                }
                Ok(Attempt::Stream(response)) => {
                    log_latency(&vendor.slug, "stream_open", attempts, started.elapsed());
                    let chunks = StreamRelay::spawn(
                        response,
                        &vendor.slug,
                        vendor.timeout,
                        self.options.stream_buffer,
                    );
                    return Ok(DispatchResult::Streaming { chunks, attempts });
                }
                Err(err) if policy.should_retry(&err, attempts) => {
                    let delay = policy.delay_for_attempt(attempts - 1);
                    warn!(
                        vendor = %vendor.slug,
                        attempt = attempts,
                        max_attempts = policy.max_retries + 1,
                        error = err.kind(),
                        delay_ms = delay.as_millis() as u64,
                        "Vendor attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        vendor = %vendor.slug,
                        attempts,
                        error = err.kind(),
                        "Vendor retries exhausted"
                    );
                    return Err(GatewayError::DispatchExhausted {
                        vendor: vendor.slug.clone(),
                        attempts,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    info!(
                        vendor = %vendor.slug,
                        attempts,
                        error = err.kind(),
                        "Vendor call failed without retry"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        vendor: &ResolvedVendor,
        url: &str,
        api_key: Option<&PlainApiKey>,
        body: &Value,
        stream: bool,
    ) -> Result<Attempt> {
        let mut rb = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body);
        if stream {
            rb = rb.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        if let Some(key) = api_key {
            rb = rb.bearer_auth(key.expose());
        }

        let call = async {
            let response = rb.send().await.map_err(|e| transport_error(vendor, e))?;
            let response = check_status(vendor, response).await?;
            if stream {
                return Ok(Attempt::Stream(response));
            }
            let bytes = response.bytes().await.map_err(|e| transport_error(vendor, e))?;
            parse_json_object(vendor, &bytes).map(Attempt::Json)
        };

        match tokio::time::timeout(vendor.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(vendor)),
        }
    }

    /// Forward `DELETE chat/completions/{id}` to the vendor. Single attempt.
    pub async fn cancel(&self, vendor_key: &str, completion_id: &str) -> Result<Value> {
        let completion_id = completion_id.trim();
        if completion_id.is_empty() {
            return Err(GatewayError::InvalidInput(
                "completion id is required for cancellation".into(),
            ));
        }
        if !is_completion_id(completion_id) {
            return Err(GatewayError::InvalidInput(
                "completion id may only contain letters, digits, '-' and '_'".into(),
            ));
        }
        let vendor = self.registry.resolve(vendor_key).await?;
        let api_key = self.registry.credential_for(&vendor)?;
        let url = vendor.endpoint(&format!("{COMPLETIONS_PATH}/{completion_id}"));

        let mut rb = self.http.delete(&url);
        if let Some(key) = api_key.as_ref() {
            rb = rb.bearer_auth(key.expose());
        }
        let call = async {
            let response = rb.send().await.map_err(|e| transport_error(&vendor, e))?;
            let response = check_status(&vendor, response).await?;
            let bytes = response.bytes().await.map_err(|e| transport_error(&vendor, e))?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(json!({ "id": completion_id, "cancelled": true }));
            }
            parse_json_object(&vendor, &bytes)
        };
        let out = match tokio::time::timeout(vendor.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(&vendor)),
        };
        debug!(vendor = %vendor.slug, ok = out.is_ok(), "Cancellation forwarded");
        out
    }
}

async fn check_status(vendor: &ResolvedVendor, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    if RetryPolicy::is_retryable_status(code) {
        return Err(GatewayError::VendorTransient {
            vendor: vendor.slug.clone(),
            status: Some(code),
            reason: format!("HTTP {code}"),
        });
    }
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            debug!(
                vendor = %vendor.slug,
                status = code,
                error = %err.without_url(),
                "Rejected response body could not be read"
            );
            Bytes::new()
        }
    };
    Err(GatewayError::VendorRejected {
        vendor: vendor.slug.clone(),
        status: code,
        body,
    })
}

/// Ids are spliced into the vendor URL path, so only `[A-Za-z0-9_-]` passes.
fn is_completion_id(id: &str) -> bool {
    id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn parse_json_object(vendor: &ResolvedVendor, bytes: &[u8]) -> Result<Value> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(GatewayError::MalformedResponse {
            vendor: vendor.slug.clone(),
            reason: "response body is not a JSON object".into(),
        }),
        Err(e) => Err(GatewayError::MalformedResponse {
            vendor: vendor.slug.clone(),
            reason: format!("invalid JSON at line {} column {}", e.line(), e.column()),
        }),
    }
}

fn transport_error(vendor: &ResolvedVendor, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        return timeout_error(vendor);
    }
    let category = if err.is_connect() {
        "connection failed"
    } else if err.is_body() || err.is_decode() {
        "response body could not be read"
    } else {
        "request failed"
    };
    debug!(vendor = %vendor.slug, error = %err.without_url(), "Vendor transport error");
    GatewayError::VendorTransient {
        vendor: vendor.slug.clone(),
        status: None,
        reason: category.to_string(),
    }
}

fn timeout_error(vendor: &ResolvedVendor) -> GatewayError {
    GatewayError::VendorTimeout {
        vendor: vendor.slug.clone(),
        timeout_secs: vendor.timeout.as_secs(),
    }
}

fn log_latency(vendor: &str, phase: &str, attempts: u32, elapsed: Duration) {
    let ms = elapsed.as_millis();
    if ms >= 250 {
        warn!(vendor, phase, attempts, latency_ms = ms as u64, "Slow vendor dispatch");
    } else if ms >= 50 {
        debug!(vendor, phase, attempts, latency_ms = ms as u64, "Vendor dispatch");
    }
}
