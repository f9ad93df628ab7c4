//! fika-reconcile: keeps a normalized row store in step with an immutable
//! rich-text document tree.
//!
//! Every edit to the tree produces a new version made of fresh node values.
//! The crate carries each logical block and inline run's external row id
//! across versions, and turns the difference between two versions into a
//! minimal batch of row inserts, updates and deletes. It includes:
//!
//! - **Document model** - blocks, inline runs, marks, token positions and edit steps
//! - **Position mapping** - composed interval maps with start/end bias
//! - **Reconciliation** - identity registry, row ledger and the reconciliation pass
//! - **Row store** - the store boundary and an in-memory reference store
//! - **Replication** - a reference CRDT replica and the patch translator
//! - **Session** - single-threaded dispatch of local and remote edits
//!
//! # Quick Start
//!
//! ```rust
//! use fika_reconcile::{Doc, MemoryStore, Session, SessionConfig, Transaction};
//!
//! let doc = Doc::from_paragraphs(&["Hello world", "Goodbye world"]);
//! let mut session =
//!     Session::create(MemoryStore::sequential(), SessionConfig::default(), doc).unwrap();
//!
//! let mut tx = Transaction::new(session.doc());
//! tx.insert_text(12, "!").unwrap();
//! let report = session.apply_local(tx).unwrap();
//! assert_eq!(report.created, 0);
//! ```
//!
//! # Features
//!
//! - `storage` - Enables crash-safe snapshots of the memory store with rkyv
//! - `cli` - Builds the `fika-replay` tool

// CRDT primitives backing the reference replica
pub mod core;

// Document model, edit steps and position mapping
pub mod doc;

// Row store boundary and reference store
pub mod store;

// Reconciliation engine
pub mod reconcile;

// Reference replica and patch translation
pub mod sync;

// Edit dispatch
pub mod session;

// Re-export core types
pub use core::{LwwRegister, OpId, PeerId, Sequence, SequenceError, StateVector};

// Re-export mark types
pub use core::mark::{Mark, MarkKind, MarkSet};

// Re-export doc types
pub use doc::input_rules::{InputRules, KeyOutcome};
pub use doc::mapping::{Bias, EditOp, MapResult, Mapping, OpKind, StepMap};
pub use doc::step::{Edit, Slice, Step, StepError, Token, Transaction};
pub use doc::{Block, BlockKind, Doc, Inline, NodeKey};

// Re-export store types
pub use store::{
    BlockRow, DocumentRow, ExternalId, IdStrategy, InlineRow, MarkRow, MemoryStore, Row,
    RowChange, RowStore, StoreError, Table,
};

// Re-export reconciliation types
pub use reconcile::{
    EditOrigin, IdentityFault, IdentityRegistry, ReconcileConfig, ReconcileError,
    ReconcileReport, Reconciler,
};

// Re-export replication types
pub use sync::{
    Change, Delivery, LocalChange, Patch, PatchTranslator, ReplicaConfig, ReplicaDoc,
    ReplicaError, ReplicaSnapshot, TranslateError,
};

// Re-export session types
pub use session::{Inbox, Incoming, Outcome, Session, SessionConfig, SessionError};

// Re-export snapshot types (feature-gated)
#[cfg(feature = "storage")]
pub use store::snapshot::{SnapshotError, SnapshotStore};
