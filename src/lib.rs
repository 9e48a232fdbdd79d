//! # local-rag
//!
//! A local retrieval-augmented agent: incrementally indexes documents on
//! disk into a vector store, answers questions from them, and blends in web
//! search results when asked to.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Roots on    │──▶│  Indexer     │──▶│ Vector store │
//! │ disk        │   │ scan/diff/   │   │ + manifest   │
//! └─────────────┘   │ chunk/embed  │   └──────┬───────┘
//!                   └──────────────┘          │
//!                        ┌────────────────────┤
//!                        ▼                    ▼
//!                 ┌─────────────┐      ┌─────────────┐
//!                 │ QueryEngine │◀────▶│ Web search  │
//!                 │ + synthesis │      │ exa/serper  │
//!                 └──────┬──────┘      └─────────────┘
//!                 ┌──────┴──────┐
//!                 ▼             ▼
//!            ┌────────┐   ┌──────────┐
//!            │  CLI   │   │   HTTP   │
//!            │ (lrag) │   │  (axum)  │
//!            └────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Core data types |
//! | [`readers`] | Text extraction for txt/html/pdf/docx/pptx/xlsx |
//! | [`chunk`] | Overlapping chunk windows and stable chunk ids |
//! | [`detect`] | Root scanning and change classification |
//! | [`manifest`] | Per-source fingerprints and chunk counts |
//! | [`store`] | Vector store trait with SQLite and in-memory backends |
//! | [`embedding`] | Embedding providers |
//! | [`completion`] | Answer synthesis providers |
//! | [`compose`] | Context assembly, re-ranking, merging and attribution |
//! | [`web`] | Web search engines with fallback, page scraping |
//! | [`ingest`] | Incremental and full indexing runs |
//! | [`query`] | Local, web, hybrid and unified retrieval |
//! | [`events`] | API event and query log |
//! | [`app`] | Component wiring |
//! | [`server`] | HTTP API |
//! | [`stats`] | Statistics and health |
//! | [`db`] | SQLite connections |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod chunk;
pub mod completion;
pub mod compose;
pub mod config;
pub mod db;
pub mod detect;
pub mod embedding;
pub mod error;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod readers;
pub mod server;
pub mod stats;
pub mod store;
pub mod web;
