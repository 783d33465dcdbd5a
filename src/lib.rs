//! # Context Loom
//!
//! Token-budgeted context assembly for document-grounded, multi-turn
//! conversations with a generative text backend.
//!
//! Context Loom indexes a local document collection into SQLite FTS5,
//! keeps the index in step with the files on disk, assembles each outgoing
//! request within a fixed token budget (instructions, retrieved material,
//! and history), and streams the backend's answer through a cancellable,
//! deadline-bound session with bounded retry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Documents  │──▶│   Ingest    │──▶│  SQLite   │
//! │ (by source) │   │ Split+Index │   │   FTS5    │
//! └─────────────┘   └─────────────┘   └────┬─────┘
//!                                          │ search
//!                  ┌───────────┐     ┌─────▼──────┐     ┌──────────┐
//!                  │  Budget   │────▶│ Assembler  │────▶│  Stream  │
//!                  │ Allocator │     │ facts+hist │     │  +Retry  │
//!                  └───────────┘     └────────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! loom init
//! loom sync
//! loom search "lighthouse"
//! loom ask "Who keeps the lighthouse?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Library error kinds |
//! | [`models`] | Core data types |
//! | [`tokenizer`] | Token counting, splitting, truncation |
//! | [`chunk`] | Document chunking |
//! | [`collection`] | Document collections (filesystem, in-memory) |
//! | [`index`] | Full-text search index |
//! | [`ingest`] | Incremental sync and full reindex |
//! | [`budget`] | Token budget allocation and chunk selection |
//! | [`history`] | History compression and truncation |
//! | [`facts`] | Canonical facts file |
//! | [`assembler`] | Request assembly |
//! | [`backend`] | Generative backend boundary |
//! | [`stream`] | Streaming sessions |
//! | [`retry`] | Retry policy over streams |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod ask;
pub mod assembler;
pub mod backend;
pub mod budget;
pub mod chunk;
pub mod collection;
pub mod config;
pub mod db;
pub mod error;
pub mod facts;
pub mod history;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retry;
pub mod search;
pub mod sources;
pub mod stats;
pub mod stream;
pub mod tokenizer;
