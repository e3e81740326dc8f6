//! Transactional scope over a [`StoreBackend`].
//!
//! A [`Session`] stages writes in memory and answers reads from its own staged
//! records first, then from the backend. A [`UnitOfWork`] owns exactly one
//! session and turns it into either one atomic `apply` (commit) or nothing
//! (rollback):
//!
//! ```text
//! NotStarted --open()--> Open --commit()--> Committed
//!                          \---rollback()/drop/error--> RolledBack
//! ```
//!
//! Commit is opt-in: [`UnitOfWork::finish`] and [`UnitOfWork::run`] only
//! commit when [`UnitOfWork::mark_for_commit`] was called and the scope
//! returned `Ok`. Errors raised inside the scope are returned unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::store::{StoreBackend, Token, TokenFilter, Vendor, VendorFilter, WriteOp};

/// Exclusive transactional handle, threaded explicitly through repository calls.
pub struct Session {
    backend: Arc<dyn StoreBackend>,
    vendors: HashMap<String, Vendor>,
    tokens: HashMap<String, Token>,
    ops: Vec<WriteOp>,
}

impl Session {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            vendors: HashMap::new(),
            tokens: HashMap::new(),
            ops: Vec::new(),
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn stage(&mut self, op: WriteOp) {
        match &op {
            WriteOp::InsertVendor(v) | WriteOp::UpdateVendor(v) => {
                self.vendors.insert(v.id.clone(), v.clone());
            }
            WriteOp::InsertToken(t) | WriteOp::UpdateToken(t) => {
                self.tokens.insert(t.id.clone(), t.clone());
            }
        }
        self.ops.push(op);
    }

    pub async fn vendor(&self, id: &str) -> Result<Option<Vendor>> {
        if let Some(staged) = self.vendors.get(id) {
            return Ok(Some(staged.clone()));
        }
        self.backend.get_vendor(id).await
    }

    pub async fn vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>> {
        if let Some(staged) = self.vendors.values().find(|v| v.slug == slug) {
            return Ok(Some(staged.clone()));
        }
        self.backend.get_vendor_by_slug(slug).await
    }

    pub async fn list_vendors(&self, filter: &VendorFilter) -> Result<Vec<Vendor>> {
        let unlimited = VendorFilter {
            limit: None,
            ..filter.clone()
        };
        let mut merged: HashMap<String, Vendor> = self
            .backend
            .list_vendors(&unlimited)
            .await?
            .into_iter()
            .filter(|v| !self.vendors.contains_key(&v.id))
            .map(|v| (v.id.clone(), v))
            .collect();
        for staged in self.vendors.values().filter(|v| filter.matches(v)) {
            merged.insert(staged.id.clone(), staged.clone());
        }
        Ok(filter.finish(merged.into_values().collect()))
    }

    pub async fn token(&self, id: &str) -> Result<Option<Token>> {
        if let Some(staged) = self.tokens.get(id) {
            return Ok(Some(staged.clone()));
        }
        self.backend.get_token(id).await
    }

    pub async fn list_tokens(&self, filter: &TokenFilter) -> Result<Vec<Token>> {
        let unlimited = TokenFilter {
            limit: None,
            ..filter.clone()
        };
        let mut merged: HashMap<String, Token> = self
            .backend
            .list_tokens(&unlimited)
            .await?
            .into_iter()
            .filter(|t| !self.tokens.contains_key(&t.id))
            .map(|t| (t.id.clone(), t))
            .collect();
        for staged in self.tokens.values().filter(|t| filter.matches(t)) {
            merged.insert(staged.id.clone(), staged.clone());
        }
        Ok(filter.finish(merged.into_values().collect()))
    }

    fn discard(&mut self) -> usize {
        let dropped = self.ops.len();
        self.ops.clear();
        self.vendors.clear();
        self.tokens.clear();
        dropped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UowState {
    NotStarted,
    Open,
    Committed,
    RolledBack,
}

pub struct UnitOfWork {
    backend: Arc<dyn StoreBackend>,
    session: Option<Session>,
    state: UowState,
    commit_requested: bool,
}

impl UnitOfWork {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            session: None,
            state: UowState::NotStarted,
            commit_requested: false,
        }
    }

    /// Adopt an externally created session; the unit of work starts Open.
    pub fn with_session(session: Session) -> Self {
        Self {
            backend: session.backend.clone(),
            session: Some(session),
            state: UowState::Open,
            commit_requested: false,
        }
    }

    pub fn state(&self) -> UowState {
        self.state
    }

    pub fn is_marked_for_commit(&self) -> bool {
        self.commit_requested
    }

    pub fn open(&mut self) -> Result<&mut Session> {
        if self.state != UowState::NotStarted {
            return Err(GatewayError::TransactionFailed(format!(
                "unit of work cannot be opened from state {:?}",
                self.state
            )));
        }
        self.state = UowState::Open;
        Ok(self.session.insert(Session::new(self.backend.clone())))
    }

    pub fn session(&mut self) -> Result<&mut Session> {
        match (self.state, self.session.as_mut()) {
            (UowState::Open, Some(session)) => Ok(session),
            (state, _) => Err(GatewayError::TransactionFailed(format!(
                "no open session (state {:?})",
                state
            ))),
        }
    }

    pub fn mark_for_commit(&mut self) {
        self.commit_requested = true;
    }

    /// Apply every staged write atomically. A failed apply leaves the unit
    /// of work rolled back; constraint conflicts keep their own variant.
    pub async fn commit(&mut self) -> Result<()> {
        if self.state != UowState::Open {
            return Err(GatewayError::TransactionFailed(format!(
                "cannot commit from state {:?}",
                self.state
            )));
        }
        let ops = match self.session.as_mut() {
            Some(session) => {
                let ops = std::mem::take(&mut session.ops);
                session.discard();
                ops
            }
            None => Vec::new(),
        };
        if ops.is_empty() {
            self.state = UowState::Committed;
            return Ok(());
        }

        let count = ops.len();
        match self.backend.apply(ops).await {
            Ok(()) => {
                self.state = UowState::Committed;
                debug!(backend = self.backend.name(), ops = count, "unit of work committed");
                Ok(())
            }
            Err(err) => {
                self.state = UowState::RolledBack;
                debug!(backend = self.backend.name(), error = %err, "unit of work commit failed");
                Err(match err {
                    GatewayError::Conflict(msg) => GatewayError::Conflict(msg),
                    other => GatewayError::TransactionFailed(other.to_string()),
                })
            }
        }
    }

    pub fn rollback(&mut self) {
        if matches!(self.state, UowState::Committed | UowState::RolledBack) {
            return;
        }
        let dropped = self.session.as_mut().map(Session::discard).unwrap_or(0);
        if dropped > 0 {
            debug!(backend = self.backend.name(), ops = dropped, "unit of work rolled back");
        }
        self.state = UowState::RolledBack;
    }

    /// Scope exit: commit when marked and `outcome` is Ok, otherwise roll back.
    /// The outcome's error, if any, is returned untouched.
    pub async fn finish<T>(&mut self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) if self.commit_requested && self.state == UowState::Open => {
                self.commit().await?;
                Ok(value)
            }
            Ok(value) => {
                self.rollback();
                Ok(value)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// Open a unit of work, run `body` inside it and finish it.
    ///
    /// ```ignore
    /// let vendor = UnitOfWork::run(store, |uow| Box::pin(async move {
    ///     let v = VendorRepository.create(uow.session()?, draft).await?;
    ///     uow.mark_for_commit();
    ///     Ok(v)
    /// })).await?;
    /// ```
    pub async fn run<T, F>(backend: Arc<dyn StoreBackend>, body: F) -> Result<T>
    where
        F: for<'u> FnOnce(&'u mut UnitOfWork) -> BoxFuture<'u, Result<T>>,
    {
        let mut uow = UnitOfWork::new(backend);
        uow.open()?;
        let outcome = body(&mut uow).await;
        uow.finish(outcome).await
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.state == UowState::Open {
            self.rollback();
        }
    }
}
