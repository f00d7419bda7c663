//! # Credence Core
//!
//! Runtime-agnostic logic for Credence: data models, token-budget
//! chunking, the embedding gateway contract, the similarity index, the
//! record store abstraction, trust propagation, and semantic search.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Concrete gateways, persistence and the
//! ingestion coordinator live in the `credence` application crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod feed;
pub mod index;
pub mod models;
pub mod search;
pub mod store;
pub mod trust;

pub use error::{Error, Result};
