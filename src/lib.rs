//! # Credence
//!
//! Trust-scored semantic document retrieval.
//!
//! Credence pulls articles from a cursor-paginated feed, splits them into
//! token-budgeted chunks, embeds the chunks, and answers similarity
//! queries whose results carry a per-document trust factor. Marking a
//! document trusted or untrusted adjusts its trust and diffuses a weaker
//! adjustment to its semantic neighbors.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌──────────────┐
//! │   Feed   │──▶│   Coordinator    │──▶│    SQLite    │
//! │  (HTTP)  │   │ Chunk + Embed    │   │ docs + vecs  │
//! └──────────┘   └──────────────────┘   └──────┬───────┘
//!                                              │
//!                        ┌─────────────────────┤
//!                        ▼                     ▼
//!                  ┌──────────┐         ┌─────────────┐
//!                  │  search  │         │    trust    │
//!                  └──────────┘         └─────────────┘
//! ```
//!
//! The algorithms (chunking, similarity index, trust propagation, search)
//! live in `credence-core`; this crate adds configuration, persistence,
//! network collaborators and the `cred` CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! cred init                         # create database
//! cred ingest --limit 500           # pull the feed
//! cred search "interest rates" --classification trusted
//! cred trust 12345 --decrease       # flag a document
//! cred stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite record store and persisted similarity index |
//! | [`app`] | Wiring shared by the commands |
//! | [`feed`] | HTTP feed client |
//! | [`embedding`] | Embedding gateways |
//! | [`tokenizer`] | Token codecs for chunking |
//! | [`ingest`] | Ingestion coordinator and checkpoints |
//! | [`embed_cmd`] | Embedding backfill |
//! | [`search`] | Search command |
//! | [`trust_cmd`] | Trust command |
//! | [`stats`] | Database statistics |

pub mod app;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod feed;
pub mod http;
pub mod ingest;
pub mod migrate;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod tokenizer;
pub mod trust_cmd;
