//! Per-session access to an open store.
//!
//! A connection issues statement operations and queries, and owns at most
//! one transaction at a time. Reads inside a transaction see that
//! transaction's pending changes; reads outside one see only committed
//! data. The stronger isolation levels take the store-wide exclusive
//! transaction lock in `begin`; read-committed takes it on first write.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::IsolationLevel;
use crate::error::{Result, StoreError};
use crate::index::{get_id, RecordIterator, CONTEXT_IDX, OBJ_IDX, PRED_IDX, SUBJ_IDX};
use crate::model::{Quad, Term, TermId, NO_CONTEXT, UNKNOWN_ID};
use crate::query::{
    EvaluationStrategy, PatternStatistics, QuadCursor, StatementSource, OPTIMIZER_PIPELINE,
};
use crate::store::lock::TxnLock;
use crate::store::quads::ReadMode;
use crate::store::{ChangeSummary, StoreInner};
use crate::values::ValueStore;

struct ActiveTxn {
    level: IsolationLevel,
    lock: Option<TxnLock>,
    /// Whether the tuple-store transaction has begun. Stays false for a
    /// read-committed transaction until its first write.
    started: bool,
    change: ChangeSummary,
}

/// One logical session against a [`crate::store::Store`].
///
/// Dropping a connection with an open transaction rolls the transaction
/// back and panics, since it indicates a missing `commit` or `rollback`.
pub struct Connection {
    inner: Arc<StoreInner>,
    txn: Option<ActiveTxn>,
}

impl Connection {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner, txn: None }
    }

    /// Begins a transaction at the store's default isolation level.
    ///
    /// # Panics
    ///
    /// Panics when a transaction is already active on this connection.
    pub fn begin(&mut self) -> Result<()> {
        self.begin_with(self.inner.config.default_isolation)
    }

    /// Begins a transaction at the given isolation level.
    ///
    /// # Panics
    ///
    /// Panics when a transaction is already active on this connection.
    pub fn begin_with(&mut self, level: IsolationLevel) -> Result<()> {
        assert!(
            self.txn.is_none(),
            "transaction already active on this connection"
        );
        let mut txn = ActiveTxn {
            level,
            lock: None,
            started: false,
            change: ChangeSummary::default(),
        };
        if level.locks_upfront() {
            txn.lock = Some(self.inner.txn_locks.acquire());
            self.inner.quads.start_transaction()?;
            txn.started = true;
        }
        debug!(?level, "transaction started");
        self.txn = Some(txn);
        Ok(())
    }

    /// Whether a transaction is active on this connection.
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// The isolation level of the active transaction, if any.
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.txn.as_ref().map(|txn| txn.level)
    }

    /// Commits the active transaction: interned terms and namespaces are
    /// flushed first, then the tuple store reconciles and syncs, then the
    /// exclusive lock is released and change listeners fire.
    ///
    /// On error the transaction stays open so the caller can inspect the
    /// store and roll back; a failed commit is never a commit.
    ///
    /// # Panics
    ///
    /// Panics when no transaction is active.
    pub fn commit(&mut self) -> Result<()> {
        {
            let txn = self
                .txn
                .as_ref()
                .expect("commit without an active transaction");
            if txn.started {
                self.inner.values.sync()?;
                self.inner.namespaces.sync()?;
                self.inner.quads.commit()?;
            }
        }
        let txn = self.txn.take().expect("transaction present");
        drop(txn.lock);
        debug!("transaction committed");
        self.inner.notify(&txn.change);
        Ok(())
    }

    /// Rolls back the active transaction, discarding its pending changes.
    ///
    /// # Panics
    ///
    /// Panics when no transaction is active.
    pub fn rollback(&mut self) -> Result<()> {
        {
            let txn = self
                .txn
                .as_ref()
                .expect("rollback without an active transaction");
            if txn.started {
                self.inner.values.sync()?;
                self.inner.quads.rollback()?;
            }
        }
        let txn = self.txn.take().expect("transaction present");
        drop(txn.lock);
        warn!("transaction rolled back");
        Ok(())
    }

    /// Asserts an explicit statement in each given context (all of them
    /// default-graph when `contexts` is empty). Returns `true` when at
    /// least one store did not already contain the statement.
    pub fn add_statement(
        &mut self,
        subj: &Term,
        pred: &Term,
        obj: &Term,
        contexts: &[Option<Term>],
    ) -> Result<bool> {
        self.add(subj, pred, obj, contexts, true)
    }

    /// Asserts an inferred statement. Explicit assertions take precedence
    /// over inferred ones when both happen.
    pub fn add_inferred_statement(
        &mut self,
        subj: &Term,
        pred: &Term,
        obj: &Term,
        contexts: &[Option<Term>],
    ) -> Result<bool> {
        self.add(subj, pred, obj, contexts, false)
    }

    /// Removes explicit statements matching the pattern. Returns how many
    /// statements were removed.
    pub fn remove_statements(
        &mut self,
        subj: Option<&Term>,
        pred: Option<&Term>,
        obj: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<usize> {
        self.remove(subj, pred, obj, contexts, true)
    }

    /// Removes inferred statements matching the pattern.
    pub fn remove_inferred_statements(
        &mut self,
        subj: Option<&Term>,
        pred: Option<&Term>,
        obj: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<usize> {
        self.remove(subj, pred, obj, contexts, false)
    }

    /// Removes every explicit statement in the given contexts (everywhere
    /// when `contexts` is empty).
    pub fn clear(&mut self, contexts: &[Option<Term>]) -> Result<usize> {
        self.remove(None, None, None, contexts, true)
    }

    /// Cursor over statements matching the pattern, resolved back to
    /// terms. `None` is a wildcard. Inside a transaction the cursor sees
    /// that transaction's pending changes.
    pub fn statements(
        &self,
        subj: Option<&Term>,
        pred: Option<&Term>,
        obj: Option<&Term>,
        include_inferred: bool,
        contexts: &[Option<Term>],
    ) -> Result<StatementCursor> {
        pattern_cursor(
            &self.inner,
            subj,
            pred,
            obj,
            include_inferred,
            self.read_mode(),
            contexts,
        )
    }

    /// Number of statements matching the pattern.
    pub fn size(
        &self,
        subj: Option<&Term>,
        pred: Option<&Term>,
        obj: Option<&Term>,
        include_inferred: bool,
        contexts: &[Option<Term>],
    ) -> Result<u64> {
        let iters = record_iterators(
            &self.inner,
            subj,
            pred,
            obj,
            include_inferred,
            self.read_mode(),
            contexts,
        )?;
        let mut size = 0;
        for mut iter in iters {
            while iter.next()?.is_some() {
                size += 1;
            }
        }
        Ok(size)
    }

    /// The distinct named contexts in use, resolved to terms.
    ///
    /// Context usage is not tracked separately, so this walks statements:
    /// through a context-leading index when one is configured, otherwise
    /// over all statements with explicit deduplication.
    pub fn context_ids(&self) -> Result<Vec<Term>> {
        let mode = self.read_mode();
        let mut ids: Vec<TermId> = Vec::new();
        match self.inner.quads.quads_ordered_by_context(mode)? {
            Some(mut iter) => {
                // Equal contexts are adjacent, so dedup on the fly.
                let mut last = None;
                while let Some(record) = iter.next()? {
                    let context = get_id(&record, CONTEXT_IDX);
                    if context != NO_CONTEXT && last != Some(context) {
                        ids.push(context);
                        last = Some(context);
                    }
                }
            }
            None => {
                let mut iter = self.inner.quads.quads(-1, -1, -1, -1, mode)?;
                while let Some(record) = iter.next()? {
                    let context = get_id(&record, CONTEXT_IDX);
                    if context != NO_CONTEXT {
                        ids.push(context);
                    }
                }
                ids.sort_unstable();
                ids.dedup();
            }
        }
        ids.into_iter()
            .map(|id| self.inner.values.get_value(id))
            .collect()
    }

    /// The namespace name bound to `prefix`.
    pub fn namespace(&self, prefix: &str) -> Option<String> {
        self.inner.namespaces.get(prefix)
    }

    /// Binds `prefix` to a namespace name.
    pub fn set_namespace(&mut self, prefix: &str, name: &str) {
        self.inner.namespaces.set(prefix, name);
    }

    /// Removes the binding for `prefix`.
    pub fn remove_namespace(&mut self, prefix: &str) -> Option<String> {
        self.inner.namespaces.remove(prefix)
    }

    /// Drops every namespace binding.
    pub fn clear_namespaces(&mut self) {
        self.inner.namespaces.clear();
    }

    /// Snapshot of every namespace binding.
    pub fn namespaces(&self) -> Vec<(String, String)> {
        self.inner.namespaces.iter()
    }

    /// Runs a query plan: the strategy's rewrite passes are applied in
    /// the fixed pipeline order, with this store's cardinality statistics
    /// available to them, and evaluation receives a statement source with
    /// this connection's visibility.
    pub fn evaluate<S: EvaluationStrategy>(
        &self,
        mut plan: S::Plan,
        strategy: &mut S,
        include_inferred: bool,
    ) -> Result<S::Output> {
        let statistics = PatternStatistics::new(&self.inner.quads, self.inner.values.as_ref());
        for stage in OPTIMIZER_PIPELINE {
            if let Some(pass) = strategy.optimizer(stage, &statistics) {
                pass.optimize(&mut plan);
            }
        }
        let source = ConnectionSource {
            inner: &self.inner,
            include_inferred,
            mode: self.read_mode(),
        };
        strategy.evaluate(plan, &source)
    }

    fn read_mode(&self) -> ReadMode {
        if self.txn.is_some() {
            ReadMode::Transaction
        } else {
            ReadMode::Committed
        }
    }

    /// Makes sure the tuple-store transaction has begun, acquiring the
    /// exclusive lock first when the isolation level deferred it.
    ///
    /// # Panics
    ///
    /// Panics when no transaction is active on this connection.
    fn ensure_write(&mut self) -> Result<()> {
        let txn = self
            .txn
            .as_mut()
            .expect("no active transaction: call begin first");
        if !txn.started {
            if txn.lock.is_none() {
                txn.lock = Some(self.inner.txn_locks.acquire());
            }
            self.inner.quads.start_transaction()?;
            txn.started = true;
        }
        Ok(())
    }

    fn add(
        &mut self,
        subj: &Term,
        pred: &Term,
        obj: &Term,
        contexts: &[Option<Term>],
        explicit: bool,
    ) -> Result<bool> {
        if !subj.is_resource() {
            return Err(StoreError::InvalidArgument(
                "subject must be an IRI or blank node".into(),
            ));
        }
        if !pred.is_iri() {
            return Err(StoreError::InvalidArgument("predicate must be an IRI".into()));
        }
        if let Some(context) = contexts.iter().flatten().find(|c| !c.is_resource()) {
            return Err(StoreError::InvalidArgument(format!(
                "context must be an IRI or blank node, got {context:?}"
            )));
        }

        self.ensure_write()?;
        let values = &self.inner.values;
        let s = values.store_value(subj)?;
        let p = values.store_value(pred)?;
        let o = values.store_value(obj)?;

        let default_graph = [None];
        let contexts: &[Option<Term>] = if contexts.is_empty() {
            &default_graph
        } else {
            contexts
        };

        let mut new_any = false;
        for context in contexts {
            let c = match context {
                None => NO_CONTEXT,
                Some(term) => values.store_value(term)?,
            };
            if self.inner.quads.store_quad(s, p, o, c, explicit)? {
                new_any = true;
            }
        }

        if new_any {
            self.txn
                .as_mut()
                .expect("transaction present")
                .change
                .statements_added = true;
        }
        Ok(new_any)
    }

    fn remove(
        &mut self,
        subj: Option<&Term>,
        pred: Option<&Term>,
        obj: Option<&Term>,
        contexts: &[Option<Term>],
        explicit: bool,
    ) -> Result<usize> {
        self.ensure_write()?;
        let values = Arc::clone(&self.inner.values);

        let mut bound = |term: Option<&Term>| -> Result<Option<TermId>> {
            match term {
                None => Ok(Some(-1)),
                Some(term) => {
                    let id = values.get_id(term)?;
                    Ok((id != UNKNOWN_ID).then_some(id))
                }
            }
        };
        let (Some(s), Some(p), Some(o)) = (bound(subj)?, bound(pred)?, bound(obj)?) else {
            // An unknown term cannot match any stored statement.
            return Ok(0);
        };

        let mut context_ids = Vec::new();
        if contexts.is_empty() {
            context_ids.push(-1);
        } else {
            for context in contexts {
                match context {
                    None => context_ids.push(NO_CONTEXT),
                    Some(term) => {
                        let id = values.get_id(term)?;
                        if id != UNKNOWN_ID {
                            context_ids.push(id);
                        }
                    }
                }
            }
        }

        let mut count = 0;
        for c in context_ids {
            count += self
                .inner
                .quads
                .remove_quads_filtered(s, p, o, c, explicit)?;
        }

        if count > 0 {
            self.txn
                .as_mut()
                .expect("transaction present")
                .change
                .statements_removed = true;
        }
        Ok(count)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if txn.started {
                if let Err(e) = self.inner.quads.rollback() {
                    warn!(error = %e, "rollback of an abandoned transaction failed");
                }
            }
            drop(txn);
            if !std::thread::panicking() {
                panic!("connection dropped with an open transaction");
            }
        }
    }
}

/// Statement access facade with a fixed visibility, handed to the
/// evaluation strategy.
struct ConnectionSource<'a> {
    inner: &'a StoreInner,
    include_inferred: bool,
    mode: ReadMode,
}

impl StatementSource for ConnectionSource<'_> {
    fn statements(
        &self,
        subj: Option<&Term>,
        pred: Option<&Term>,
        obj: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<QuadCursor> {
        let cursor = pattern_cursor(
            self.inner,
            subj,
            pred,
            obj,
            self.include_inferred,
            self.mode,
            contexts,
        )?;
        Ok(Box::new(cursor))
    }
}

/// Term-resolving cursor over the records matched by a pattern.
pub struct StatementCursor {
    iters: VecDeque<Box<dyn RecordIterator>>,
    values: Arc<dyn ValueStore>,
}

impl StatementCursor {
    fn decode(&self, record: &crate::index::QuadRecord) -> Result<Quad> {
        let context = match get_id(record, CONTEXT_IDX) {
            NO_CONTEXT => None,
            id => Some(self.values.get_value(id)?),
        };
        Ok(Quad {
            subject: self.values.get_value(get_id(record, SUBJ_IDX))?,
            predicate: self.values.get_value(get_id(record, PRED_IDX))?,
            object: self.values.get_value(get_id(record, OBJ_IDX))?,
            context,
        })
    }
}

impl Iterator for StatementCursor {
    type Item = Result<Quad>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = self.iters.front_mut()?.next();
            match step {
                Ok(Some(record)) => return Some(self.decode(&record)),
                Ok(None) => {
                    self.iters.pop_front();
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn pattern_cursor(
    inner: &StoreInner,
    subj: Option<&Term>,
    pred: Option<&Term>,
    obj: Option<&Term>,
    include_inferred: bool,
    mode: ReadMode,
    contexts: &[Option<Term>],
) -> Result<StatementCursor> {
    let iters = record_iterators(inner, subj, pred, obj, include_inferred, mode, contexts)?;
    Ok(StatementCursor {
        iters: iters.into(),
        values: Arc::clone(&inner.values),
    })
}

/// One record iterator per requested context, or none at all when a bound
/// term is unknown to the store.
fn record_iterators(
    inner: &StoreInner,
    subj: Option<&Term>,
    pred: Option<&Term>,
    obj: Option<&Term>,
    include_inferred: bool,
    mode: ReadMode,
    contexts: &[Option<Term>],
) -> Result<Vec<Box<dyn RecordIterator>>> {
    let values = &inner.values;
    let mut bound = |term: Option<&Term>| -> Result<Option<TermId>> {
        match term {
            None => Ok(Some(-1)),
            Some(term) => {
                let id = values.get_id(term)?;
                Ok((id != UNKNOWN_ID).then_some(id))
            }
        }
    };
    let (Some(s), Some(p), Some(o)) = (bound(subj)?, bound(pred)?, bound(obj)?) else {
        return Ok(Vec::new());
    };

    let mut context_ids = Vec::new();
    if contexts.is_empty() {
        context_ids.push(-1);
    } else {
        for context in contexts {
            match context {
                None => context_ids.push(NO_CONTEXT),
                Some(term) => {
                    let id = values.get_id(term)?;
                    if id != UNKNOWN_ID {
                        context_ids.push(id);
                    }
                }
            }
        }
    }

    let mut iters = Vec::with_capacity(context_ids.len());
    for c in context_ids {
        let iter = if include_inferred {
            inner.quads.quads(s, p, o, c, mode)?
        } else {
            inner.quads.quads_filtered(s, p, o, c, true, mode)?
        };
        iters.push(iter);
    }
    Ok(iters)
}
