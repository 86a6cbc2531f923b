//! # wikirag
//!
//! Keeps a local corpus of Wikipedia articles mirrored into a Gemini File
//! Search store and answers questions against it with citations that point
//! back at the local files.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │   Corpus    │──▶│ Synchronizer │──▶│ RemoteStoreGateway│──▶ Gemini File Search
//! │ ./data/...  │   │ classify+up  │   │ retry / paginate │
//! └─────────────┘   └──────┬───────┘   └────────┬─────────┘
//!                          │                    │
//!                          ▼                    ▼
//!                   ┌──────────────┐     ┌──────────────┐
//!                   │ MappingStore │◀────│ QueryEngine  │
//!                   │ (JSON file)  │     │ ask / files  │
//!                   └──────────────┘     └──────────────┘
//! ```
//!
//! Local names (which may contain any Unicode) are normalized into ASCII
//! safe ids before upload; the mapping file records
//! `local name ↔ safe id ↔ remote handle` so citations can be resolved back.
//!
//! ## Quick Start
//!
//! ```bash
//! export GOOGLE_API_KEY=...
//! wikirag sync                       # upload new and changed articles
//! wikirag ask "東京の人口は?"          # grounded answer with sources
//! wikirag files                      # mapping table joined with the store
//! wikirag sync --reset               # wipe the store and re-upload
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`corpus`] | Local corpus discovery |
//! | [`mapping_store`] | Crash-safe persistence of the mapping table |
//! | [`service`] | File Search service contract, Gemini and in-memory backends |
//! | [`gateway`] | Retrying, paginating facade over a service |
//! | [`sync`] | Incremental and reset synchronization |
//! | [`query`] | Grounded answers and citation resolution |
//! | [`stores`] | Store administration commands |
//! | [`progress`] | Sync progress reporting |

pub mod config;
pub mod corpus;
pub mod gateway;
pub mod mapping_store;
pub mod progress;
pub mod prompt;
pub mod query;
pub mod service;
pub mod stores;
pub mod sync;

pub use wikirag_core::{models, normalize, SyncError};
