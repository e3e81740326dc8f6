#![forbid(unsafe_code)]
#![doc = r#"
llmgate

Gateway in front of OpenAI-compatible LLM vendors. Callers address a vendor by
slug (or with a composite `vendor__model` id); the gateway decrypts the
vendor's stored key for that one call, applies the vendor's timeout and retry
budget, and returns the JSON body or relays the vendor's SSE stream as-is.

Crate highlights
- `dispatcher`: build, send, retry and classify vendor calls.
- `relay`: bounded, cancellable forwarding of streamed responses.
- `cipher`: AES-256-GCM protection of vendor API keys at rest.
- `registry`: vendor resolution with a TTL snapshot cache and the "custom" variant.
- `uow` + `repository`: explicit sessions and all-or-nothing multi-entity writes.
- `store*`: storage backends (memory, sled, optional SQLite via sqlx).
- `server`: actix-web routes (chat, cancel, models, admin).

Note: vendor bodies and credentials never appear in error messages or logs.
"#]

pub mod catalog;
pub mod cipher;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod relay;
pub mod repository;
pub mod server;
pub mod store;
pub mod store_memory;
#[cfg(feature = "sled")]
pub mod store_sled;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;
pub mod uow;
pub mod util;

pub use crate::catalog::{ModelCatalog, ModelEntry};
pub use crate::cipher::{CredentialCipher, PlainApiKey};
pub use crate::config::{GatewayConfig, VendorSeedFile};
pub use crate::dispatcher::{
    split_composite_model, ChunkStream, DispatchRequest, DispatchResult, DispatcherOptions,
    RequestDispatcher, RetryPolicy,
};
pub use crate::error::{DispatchStatus, GatewayError, Result};
pub use crate::registry::{
    CustomVendor, RegistryOptions, ResolvedVendor, VendorRegistry, VendorSpec, CUSTOM_VENDOR_SLUG,
};
pub use crate::relay::StreamRelay;
pub use crate::repository::{IssuedToken, Repository, TokenRepository, VendorRepository};
pub use crate::store::{
    StoreBackend, StoreSpec, Token, TokenFilter, TokenKind, TokenOwner, Vendor, VendorFilter,
};
pub use crate::store_memory::MemoryStore;
#[cfg(feature = "sled")]
pub use crate::store_sled::SledStore;
pub use crate::uow::{Session, UnitOfWork, UowState};
pub use crate::util::AppState;
