//! # Knowledge Base Harness
//!
//! Grounded question answering over a local folder of documents.
//!
//! Files in the watched directory are fingerprinted, extracted, chunked and
//! embedded into a persistent vector index. Questions are answered by
//! retrieving the most similar chunks and handing them, together with the
//! session's conversation history, to a generation service. Answers come
//! back either whole or as a stream of events, always with their sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Tracker  │──▶│ Extract+Chunk│──▶│ Index (SQLite│
//! │ (SHA-256) │   │              │   │  + vectors)  │
//! └───────────┘   └──────────────┘   └──────┬───────┘
//!                                           │
//!              ┌──────────┐   ┌─────────────▼──┐
//!              │ Sessions │◀─▶│ Answer pipeline│──▶ Generator
//!              └──────────┘   └───────┬────────┘
//!                          ┌──────────┴──────────┐
//!                          ▼                     ▼
//!                     ┌─────────┐          ┌──────────┐
//!                     │ CLI (kb)│          │   HTTP   │
//!                     └─────────┘          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb sync                                   # ingest ./knowledge_base
//! kb ask "What is the capital of France?"   # buffered answer with sources
//! kb chat                                   # interactive, streamed
//! kb serve                                  # HTTP API on [server].bind
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types and wire events |
//! | [`tracker`] | Content fingerprint tracking |
//! | [`extract`] | Text extraction per file format |
//! | [`chunk`] | Recursive overlapping chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Generation provider abstraction |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`index`] | Persistent vector index |
//! | [`retriever`] | Fixed-k similarity retrieval |
//! | [`session`] | Bounded conversation history |
//! | [`answer`] | Buffered and streaming answer pipelines |
//! | [`service`] | Orchestration of ingestion and queries |
//! | [`server`] | HTTP server |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod migrate;
pub mod models;
pub mod retriever;
pub mod server;
pub mod service;
pub mod session;
pub mod tracker;
