//! # wikirag core
//!
//! Pure logic for wikirag: the document data model, error kinds, the
//! identifier normalizer, content fingerprints, the mapping table and the
//! retry state machine.
//!
//! This crate contains no tokio, network or filesystem I/O. Persistence,
//! the remote service clients and the synchronizer live in the `wikirag`
//! application crate.

pub mod error;
pub mod fingerprint;
pub mod mapping;
pub mod models;
pub mod normalize;
pub mod retry;

pub use error::SyncError;
pub use mapping::MappingTable;
pub use models::{DocumentRecord, DocumentState, StoreReference};
