//! SQLite storage backend (feature "sqlite")
//!
//! Single-file persistence through sqlx. A batch is validated and written
//! inside one SQL transaction; the schema's UNIQUE constraints back up the
//! slug and token-hash rules.

use std::collections::HashMap;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, SqliteConnection};

use crate::error::{GatewayError, Result};
use crate::store::{
    validate_batch, CommittedState, StoreBackend, Token, TokenFilter, TokenKind, TokenOwner,
    Vendor, VendorFilter, WriteOp,
};
use crate::util::now_epoch;

const VENDOR_COLUMNS: &str = "id, slug, name, base_url, default_model, encrypted_api_key, \
     timeout_seconds, retry_count, is_active, created_at, updated_at";
const TOKEN_COLUMNS: &str =
    "id, owner, kind, token_hash, label, is_active, expires_at, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    // Serializes validate-then-write so the single-active-token rule cannot race.
    commit_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl SqliteStore {
    /// URL format: "sqlite:path/to/gate.db" or "sqlite::memory:".
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| GatewayError::Storage(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .disable_statement_logging();

        // In-memory databases are per-connection, so keep a single one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::Storage(format!("SQLite connection error: {}", e)))?;

        let store = Self {
            pool,
            commit_lock: Default::default(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let schema = include_str!("store_schema.sql");
        for statement in schema.split(';') {
            let trimmed = statement
                .lines()
                .filter(|line| {
                    let l = line.trim();
                    !l.is_empty() && !l.starts_with("--")
                })
                .collect::<Vec<_>>()
                .join("\n");
            if trimmed.trim().is_empty() {
                continue;
            }
            sqlx::query(&trimmed)
                .execute(&self.pool)
                .await
                .map_err(|e| GatewayError::Storage(format!("Schema creation error: {}", e)))?;
        }
        Ok(())
    }
}

fn vendor_from_row(row: &SqliteRow) -> Result<Vendor> {
    let get = |e: sqlx::Error| GatewayError::Storage(format!("Row decode error: {}", e));
    Ok(Vendor {
        id: row.try_get("id").map_err(get)?,
        slug: row.try_get("slug").map_err(get)?,
        name: row.try_get("name").map_err(get)?,
        base_url: row.try_get("base_url").map_err(get)?,
        default_model: row.try_get("default_model").map_err(get)?,
        encrypted_api_key: row.try_get("encrypted_api_key").map_err(get)?,
        timeout_seconds: row.try_get::<i64, _>("timeout_seconds").map_err(get)? as u64,
        retry_count: row.try_get::<i64, _>("retry_count").map_err(get)? as u32,
        is_active: row.try_get::<i64, _>("is_active").map_err(get)? != 0,
        created_at: row.try_get::<i64, _>("created_at").map_err(get)? as u64,
        updated_at: row.try_get::<i64, _>("updated_at").map_err(get)? as u64,
    })
}

fn token_from_row(row: &SqliteRow) -> Result<Token> {
    let get = |e: sqlx::Error| GatewayError::Storage(format!("Row decode error: {}", e));
    let owner: String = row.try_get("owner").map_err(get)?;
    let kind: String = row.try_get("kind").map_err(get)?;
    Ok(Token {
        id: row.try_get("id").map_err(get)?,
        owner: owner.parse()?,
        kind: parse_kind(&kind)?,
        token_hash: row.try_get("token_hash").map_err(get)?,
        label: row.try_get("label").map_err(get)?,
        is_active: row.try_get::<i64, _>("is_active").map_err(get)? != 0,
        expires_at: row
            .try_get::<Option<i64>, _>("expires_at")
            .map_err(get)?
            .map(|v| v as u64),
        created_at: row.try_get::<i64, _>("created_at").map_err(get)? as u64,
    })
}

fn parse_kind(s: &str) -> Result<TokenKind> {
    match s {
        "default" => Ok(TokenKind::Default),
        "activation" => Ok(TokenKind::Activation),
        other => Err(GatewayError::Storage(format!("unknown token kind '{other}'"))),
    }
}

fn query_error(e: sqlx::Error) -> GatewayError {
    GatewayError::Storage(format!("SQLite query error: {}", e))
}

async fn fetch_vendor(conn: &mut SqliteConnection, column: &str, key: &str) -> Result<Option<Vendor>> {
    let sql = format!("SELECT {VENDOR_COLUMNS} FROM vendors WHERE {column} = ?1");
    let row = sqlx::query(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;
    row.as_ref().map(vendor_from_row).transpose()
}

async fn fetch_token(conn: &mut SqliteConnection, id: &str) -> Result<Option<Token>> {
    let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;
    row.as_ref().map(token_from_row).transpose()
}

async fn fetch_tokens_for(
    conn: &mut SqliteConnection,
    owner: &TokenOwner,
    kind: TokenKind,
) -> Result<Vec<Token>> {
    let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE owner = ?1 AND kind = ?2");
    let rows = sqlx::query(&sql)
        .bind(owner.to_string())
        .bind(kind.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(query_error)?;
    rows.iter().map(token_from_row).collect()
}

/// Committed rows a batch can touch, loaded inside the write transaction.
#[derive(Default)]
struct Prefetched {
    vendors: HashMap<String, Vendor>,
    slugs: HashMap<String, Vendor>,
    tokens: HashMap<String, Token>,
    owned: HashMap<(TokenOwner, TokenKind), Vec<Token>>,
}

impl Prefetched {
    async fn load(conn: &mut SqliteConnection, batch: &[WriteOp]) -> Result<Self> {
        let mut out = Prefetched::default();
        for op in batch {
            match op {
                WriteOp::InsertVendor(v) | WriteOp::UpdateVendor(v) => {
                    if let Some(found) = fetch_vendor(conn, "id", &v.id).await? {
                        out.vendors.insert(found.id.clone(), found);
                    }
                    if let Some(found) = fetch_vendor(conn, "slug", &v.slug).await? {
                        out.slugs.insert(found.slug.clone(), found);
                    }
                }
                WriteOp::InsertToken(t) | WriteOp::UpdateToken(t) => {
                    if let Some(found) = fetch_token(conn, &t.id).await? {
                        out.tokens.insert(found.id.clone(), found);
                    }
                    let key = (t.owner.clone(), t.kind);
                    if !out.owned.contains_key(&key) {
                        let owned = fetch_tokens_for(conn, &t.owner, t.kind).await?;
                        out.owned.insert(key, owned);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl CommittedState for Prefetched {
    fn vendor(&self, id: &str) -> Result<Option<Vendor>> {
        Ok(self.vendors.get(id).cloned())
    }

    fn vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
        Ok(self.slugs.get(slug).cloned())
    }

    fn token(&self, id: &str) -> Result<Option<Token>> {
        Ok(self.tokens.get(id).cloned())
    }

    fn tokens_for(&self, owner: &TokenOwner, kind: TokenKind) -> Result<Vec<Token>> {
        Ok(self
            .owned
            .get(&(owner.clone(), kind))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl StoreBackend for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get_vendor(&self, id: &str) -> Result<Option<Vendor>> {
        let mut conn = self.pool.acquire().await.map_err(query_error)?;
        fetch_vendor(&mut conn, "id", id).await
    }

    async fn get_vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
        let mut conn = self.pool.acquire().await.map_err(query_error)?;
        fetch_vendor(&mut conn, "slug", slug).await
    }

    async fn list_vendors(&self, filter: &VendorFilter) -> Result<Vec<Vendor>> {
        let sql = format!("SELECT {VENDOR_COLUMNS} FROM vendors ORDER BY slug");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let vendor = vendor_from_row(row)?;
            if filter.matches(&vendor) {
                out.push(vendor);
            }
        }
        Ok(filter.finish(out))
    }

    async fn get_token(&self, id: &str) -> Result<Option<Token>> {
        let mut conn = self.pool.acquire().await.map_err(query_error)?;
        fetch_token(&mut conn, id).await
    }

    async fn list_tokens(&self, filter: &TokenFilter) -> Result<Vec<Token>> {
        let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens ORDER BY created_at");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let token = token_from_row(row)?;
            if filter.matches(&token) {
                out.push(token);
            }
        }
        Ok(filter.finish(out))
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(query_error)?;

        let committed = Prefetched::load(&mut *tx, &batch).await?;
        validate_batch(&committed, &batch, now_epoch())?;

        for op in &batch {
            match op {
                WriteOp::InsertVendor(v) | WriteOp::UpdateVendor(v) => {
                    sqlx::query(
                        r#"
                        INSERT INTO vendors (id, slug, name, base_url, default_model, encrypted_api_key,
                                             timeout_seconds, retry_count, is_active, created_at, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                        ON CONFLICT(id) DO UPDATE SET
                            name = excluded.name,
                            base_url = excluded.base_url,
                            default_model = excluded.default_model,
                            encrypted_api_key = excluded.encrypted_api_key,
                            timeout_seconds = excluded.timeout_seconds,
                            retry_count = excluded.retry_count,
                            is_active = excluded.is_active,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&v.id)
                    .bind(&v.slug)
                    .bind(&v.name)
                    .bind(&v.base_url)
                    .bind(&v.default_model)
                    .bind(&v.encrypted_api_key)
                    .bind(v.timeout_seconds as i64)
                    .bind(v.retry_count as i64)
                    .bind(v.is_active as i64)
                    .bind(v.created_at as i64)
                    .bind(v.updated_at as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_error)?;
                }
                WriteOp::InsertToken(t) | WriteOp::UpdateToken(t) => {
                    sqlx::query(
                        r#"
                        INSERT INTO tokens (id, owner, kind, token_hash, label, is_active, expires_at, created_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                        ON CONFLICT(id) DO UPDATE SET
                            label = excluded.label,
                            is_active = excluded.is_active,
                            expires_at = excluded.expires_at
                        "#,
                    )
                    .bind(&t.id)
                    .bind(t.owner.to_string())
                    .bind(t.kind.as_str())
                    .bind(&t.token_hash)
                    .bind(&t.label)
                    .bind(t.is_active as i64)
                    .bind(t.expires_at.map(|v| v as i64))
                    .bind(t.created_at as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_error)?;
                }
            }
        }

        // Dropping `tx` on any early return above rolls it back.
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }
}
