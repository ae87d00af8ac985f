//! Quadra: a disk-resident, transactional quad store.
//!
//! Statements are kept as fixed-length records of four integer term
//! identifiers plus a flag byte, fanned out to one ordered index per
//! configured field permutation so any binding pattern finds a usable
//! sort order. Transactions are implemented through per-record status
//! bits rather than a write-ahead log: pending adds, removals and
//! explicitness toggles ride on the records themselves and are reconciled
//! at commit or rollback, with a tiny durable status marker for crash
//! detection.
//!
//! ```no_run
//! use quadra::{Store, StoreConfig, Term};
//!
//! let store = Store::open(StoreConfig::new("data"))?;
//! let mut conn = store.connection();
//!
//! conn.begin()?;
//! conn.add_statement(
//!     &Term::iri("http://example.org/alice"),
//!     &Term::iri("http://example.org/knows"),
//!     &Term::iri("http://example.org/bob"),
//!     &[],
//! )?;
//! conn.commit()?;
//!
//! for quad in conn.statements(None, None, None, true, &[])? {
//!     println!("{:?}", quad?);
//! }
//! # Ok::<(), quadra::StoreError>(())
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod model;
pub mod ns;
pub mod query;
pub mod store;
pub mod values;

pub use config::{IsolationLevel, StoreConfig};
pub use error::{Result, StoreError};
pub use model::{Quad, Term, TermId, NO_CONTEXT, UNKNOWN_ID};
pub use store::{ChangeSummary, Connection, QuadStore, ReadMode, StatementCursor, Store};
pub use values::ValueStore;
