//! Single-threaded dispatch of edits into the reconciler.
//!
//! A [`Session`] owns the current tree, the row store and the reconciler.
//! Edits enter through an [`Inbox`] and are processed strictly in arrival
//! order, one pass at a time. Store listeners and transports hold clones of
//! the inbox and may enqueue while a pass is running; their items wait for
//! the next [`Session::pump`].
//!
//! In the replicated variant the tree is a projection of a [`ReplicaDoc`].
//! Local edits are sent to the replica first and come back as a delivery,
//! so local and remote edits reach the store through the same inbound path.

use crate::doc::input_rules::{InputRules, KeyOutcome};
use crate::doc::step::{Edit, StepError, Transaction};
use crate::doc::Doc;
use crate::reconcile::{EditOrigin, ReconcileConfig, ReconcileError, ReconcileReport, Reconciler};
use crate::store::{self, DocumentRow, Row, RowStore, StoreError, Table};
use crate::sync::{
    Change, Delivery, PatchTranslator, ReplicaConfig, ReplicaDoc, ReplicaError, TranslateError,
};
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub document_id: String,
    /// Title written to the documents table when a session creates the document.
    pub title: String,
    pub reconcile: ReconcileConfig,
    /// Replace the tree from the replica snapshot when patch translation
    /// diverges, instead of failing the edit.
    pub resync_on_divergence: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            document_id: "doc".to_string(),
            title: "Untitled".to_string(),
            reconcile: ReconcileConfig::default(),
            resync_on_divergence: true,
        }
    }
}

impl SessionConfig {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transaction was built against a document that is no longer current")]
    Stale,
    #[error("session is not replicated")]
    NotReplicated,
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error("document row: {0}")]
    Store(#[from] StoreError),
}

/// Builds a transaction against whatever tree is current when it runs.
pub type Command = Box<dyn FnOnce(&Doc) -> Result<Transaction, StepError>>;

pub enum Incoming {
    /// A transaction built against the tree current at enqueue time.
    Local(Transaction),
    Command(Command),
    Remote(Change),
}

impl Incoming {
    fn origin(&self) -> EditOrigin {
        match self {
            Incoming::Local(_) | Incoming::Command(_) => EditOrigin::Local,
            Incoming::Remote(_) => EditOrigin::Remote,
        }
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incoming::Local(tx) => f.debug_tuple("Local").field(&tx.steps().len()).finish(),
            Incoming::Command(_) => f.write_str("Command"),
            Incoming::Remote(change) => f
                .debug_struct("Remote")
                .field("peer", &change.peer)
                .field("seq", &change.seq)
                .finish(),
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    next_seq: u64,
    items: VecDeque<(u64, Incoming)>,
}

/// Shared handle to a session's queue.
#[derive(Debug, Clone, Default)]
pub struct Inbox(Rc<RefCell<Queue>>);

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `item`, returning its dispatch sequence number.
    pub fn push(&self, item: Incoming) -> u64 {
        let mut queue = self.0.borrow_mut();
        queue.next_seq += 1;
        let seq = queue.next_seq;
        queue.items.push_back((seq, item));
        seq
    }

    pub fn len(&self) -> usize {
        self.0.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().items.is_empty()
    }

    // The borrow ends before the item is processed, so listeners can push
    // during a pass.
    fn pop(&self) -> Option<(u64, Incoming)> {
        self.0.borrow_mut().items.pop_front()
    }
}

/// Result of one reconciliation pass run by [`Session::pump`].
#[derive(Debug)]
pub struct Outcome {
    /// Sequence number of the inbox item that caused the pass.
    pub seq: u64,
    pub origin: EditOrigin,
    pub result: Result<ReconcileReport, SessionError>,
}

pub struct Session<S: RowStore> {
    config: SessionConfig,
    doc: Doc,
    store: S,
    reconciler: Reconciler,
    replica: Option<ReplicaDoc>,
    translator: PatchTranslator,
    rules: InputRules,
    inbox: Inbox,
    outbox: Vec<Change>,
}

impl<S: RowStore> Session<S> {
    /// Starts a session for a new document, writing every node of `doc`.
    pub fn create(mut store: S, config: SessionConfig, doc: Doc) -> Result<Self, SessionError> {
        store.add_row(
            Table::Documents,
            Row::Document(DocumentRow {
                document_id: config.document_id.clone(),
                title: config.title.clone(),
            }),
        )?;
        let mut reconciler = Reconciler::new(config.document_id.clone(), config.reconcile.clone());
        reconciler.bootstrap(&mut store, &doc)?;
        Ok(Self::assemble(store, config, reconciler, doc))
    }

    /// Starts a session for a document already in `store`.
    pub fn open(store: S, config: SessionConfig) -> Result<Self, SessionError> {
        let mut reconciler = Reconciler::new(config.document_id.clone(), config.reconcile.clone());
        let doc = reconciler.hydrate(&store)?;
        Ok(Self::assemble(store, config, reconciler, doc))
    }

    fn assemble(store: S, config: SessionConfig, reconciler: Reconciler, doc: Doc) -> Self {
        let translator = PatchTranslator::new(config.resync_on_divergence);
        Self {
            config,
            doc,
            store,
            reconciler,
            replica: None,
            translator,
            rules: InputRules::new(),
            inbox: Inbox::new(),
            outbox: Vec::new(),
        }
    }

    /// Attaches a replica seeded with the current tree. The seeding change
    /// is queued in the outbox.
    pub fn replicated(mut self, replica_config: ReplicaConfig) -> Result<Self, SessionError> {
        let mut replica = ReplicaDoc::new(replica_config);
        let seed = self.translator.seed(&self.doc);
        if !seed.is_empty() {
            let committed = replica.apply_local_change(&seed)?;
            self.outbox.extend(committed.change);
        }
        self.replica = Some(replica);
        Ok(self)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The stored title, or `None` for a document without a documents row.
    pub fn title(&self) -> Result<Option<String>, SessionError> {
        Ok(store::document_row(&self.store, &self.config.document_id)?.map(|(_, row)| row.title))
    }

    pub fn rename(&mut self, title: impl Into<String>) -> Result<(), SessionError> {
        let row = Row::Document(DocumentRow {
            document_id: self.config.document_id.clone(),
            title: title.into(),
        });
        match store::document_row(&self.store, &self.config.document_id)? {
            Some((id, _)) => self.store.set_row(Table::Documents, &id, row)?,
            None => {
                self.store.add_row(Table::Documents, row)?;
            }
        }
        Ok(())
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Direct store access, for registering listeners or injecting faults.
    /// Rows written here are not tracked by the reconciler.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn replica(&self) -> Option<&ReplicaDoc> {
        self.replica.as_ref()
    }

    pub fn is_replicated(&self) -> bool {
        self.replica.is_some()
    }

    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    /// Changes produced by local edits since the last call.
    pub fn take_outbox(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.outbox)
    }

    pub fn dispatch_local(&mut self, tx: Transaction) -> Vec<Outcome> {
        self.inbox.push(Incoming::Local(tx));
        self.pump()
    }

    pub fn dispatch_command(&mut self, command: Command) -> Vec<Outcome> {
        self.inbox.push(Incoming::Command(command));
        self.pump()
    }

    pub fn receive_remote(&mut self, change: Change) -> Vec<Outcome> {
        self.inbox.push(Incoming::Remote(change));
        self.pump()
    }

    /// Dispatches `tx` and returns the result of its own pass.
    pub fn apply_local(&mut self, tx: Transaction) -> Result<ReconcileReport, SessionError> {
        let seq = self.inbox.push(Incoming::Local(tx));
        let mut own = None;
        for outcome in self.pump() {
            if outcome.seq == seq {
                own = Some(outcome.result);
            } else if let Err(err) = &outcome.result {
                warn!(seq = outcome.seq, error = %err, "queued edit failed");
            }
        }
        own.unwrap_or(Ok(ReconcileReport::noop(EditOrigin::Local)))
    }

    /// Feeds a keystroke at `caret`. Shortcut triggers replace the typed
    /// prefix; any other key is inserted as text.
    pub fn handle_key(&mut self, caret: usize, key: char) -> Result<ReconcileReport, SessionError> {
        let tx = match self.rules.handle_key(&self.doc, caret, key) {
            KeyOutcome::Handled(tx) => tx,
            KeyOutcome::PassThrough => {
                let mut tx = Transaction::new(&self.doc);
                tx.insert_text(caret, key.encode_utf8(&mut [0; 4]))?;
                tx
            }
        };
        self.apply_local(tx)
    }

    /// Drains the inbox in arrival order.
    pub fn pump(&mut self) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some((seq, item)) = self.inbox.pop() {
            let origin = item.origin();
            debug!(seq, ?item, "dispatching");
            match self.process(item) {
                Ok(results) => outcomes.extend(results.into_iter().map(|result| Outcome {
                    seq,
                    origin,
                    result,
                })),
                Err(err) => outcomes.push(Outcome {
                    seq,
                    origin,
                    result: Err(err),
                }),
            }
        }
        outcomes
    }

    /// Rewrites rows left behind by failed store writes.
    pub fn retry(&mut self) -> Result<ReconcileReport, SessionError> {
        Ok(self.reconciler.retry_pending(&mut self.store, &self.doc)?)
    }

    fn process(
        &mut self,
        item: Incoming,
    ) -> Result<Vec<Result<ReconcileReport, SessionError>>, SessionError> {
        match item {
            Incoming::Local(tx) => {
                if tx.before().key() != self.doc.key() {
                    return Err(SessionError::Stale);
                }
                Ok(vec![self.local_edit(tx.finish())])
            }
            Incoming::Command(command) => {
                let tx = command(&self.doc)?;
                Ok(vec![self.local_edit(tx.finish())])
            }
            Incoming::Remote(change) => {
                let replica = self.replica.as_mut().ok_or(SessionError::NotReplicated)?;
                let deliveries = replica.apply_remote(change)?;
                Ok(deliveries
                    .iter()
                    .map(|delivery| self.deliver(delivery, EditOrigin::Remote))
                    .collect())
            }
        }
    }

    fn local_edit(&mut self, edit: Edit) -> Result<ReconcileReport, SessionError> {
        let Some(replica) = self.replica.as_mut() else {
            return self.commit(edit, EditOrigin::Local);
        };
        let changes = self.translator.outbound(&edit.before, &edit.steps)?;
        if changes.is_empty() {
            return self.commit(edit, EditOrigin::Local);
        }
        let committed = replica.apply_local_change(&changes)?;
        self.outbox.extend(committed.change);
        self.deliver(&committed.delivery, EditOrigin::Local)
    }

    fn deliver(
        &mut self,
        delivery: &Delivery,
        origin: EditOrigin,
    ) -> Result<ReconcileReport, SessionError> {
        let edit = self.translator.inbound(&self.doc, delivery)?;
        self.commit(edit, origin)
    }

    /// Runs the pass and installs the new tree. A store failure still
    /// installs it; the failed rows are retried later.
    fn commit(&mut self, edit: Edit, origin: EditOrigin) -> Result<ReconcileReport, SessionError> {
        match self.reconciler.reconcile(&mut self.store, &edit, origin) {
            Ok(report) => {
                self.doc = edit.after;
                Ok(report)
            }
            Err(err @ ReconcileError::IdentityViolation { .. }) => Err(err.into()),
            Err(err) => {
                warn!(error = %err, "edit applied with store errors");
                self.doc = edit.after;
                Err(err.into())
            }
        }
    }
}

impl<S: RowStore + fmt::Debug> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("document_id", &self.config.document_id)
            .field("blocks", &self.doc.block_count())
            .field("replicated", &self.replica.is_some())
            .field("queued", &self.inbox.len())
            .field("store", &self.store)
            .finish()
    }
}
