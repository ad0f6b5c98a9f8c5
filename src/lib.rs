//! # Recall Harness
//!
//! **A per-repository persistent memory engine for AI coding agents.**
//!
//! Recall Harness ingests an agent's session transcripts (Claude Code
//! JSONL, Codex, OpenCode), extracts durable learnings via an LLM
//! extractor, compacts them into three curated tier files (guardrails,
//! style, recent), and serves both a retrieval bundle for the next agent
//! turn and a `ralph` iteration loop that drives an agent through a PRD
//! one item at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Ingesters  │──▶│ Pipeline  │──▶│ Extractor   │──▶│ Compaction   │
//! │ (session   │   │ (checkpt  │   │ (LLM → log  │   │ (3 passes →  │
//! │  sources)  │   │  + store) │   │  entries)   │   │  tier files) │
//! └────────────┘   └───────────┘   └─────────────┘   └──────┬───────┘
//!                                                           │
//!                        ┌──────────────────────────────────┤
//!                        ▼                                  ▼
//!                  ┌───────────┐                     ┌─────────────┐
//!                  │ Retrieval │                     │ Ralph loop  │
//!                  │ (fts5/    │                     │ (PRD-driven │
//!                  │  hybrid)  │                     │  iterations)│
//!                  └───────────┘                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Scope`, `Session`, `LogEntry`, `Chunk`, iteration reports |
//! | [`error`] | `RecallError` taxonomy |
//! | [`db`] / [`migrate`] | SQLite connection pool (WAL mode) and schema migrations |
//! | [`storage`] | `Store` trait plus the local SQLite implementation |
//! | [`storage_remote`] | Shared-backend `Store` implementation (`file://`, `sqlite://`, `http(s)://`) |
//! | [`tier_store`] | Guardrails/style/recent tier file reader/writer |
//! | [`ingest`] | Session ingesters: Claude Code JSONL, Codex/OpenCode-style nested JSON, shared-workspace SQLite |
//! | [`chunk`] | Paragraph-boundary text chunker reused for chunk indexing |
//! | [`llm`] | LLM provider trait plus the Anthropic-compatible HTTP implementation |
//! | [`extract`] | Transcript-to-learnings extractor |
//! | [`pipeline`] | End-to-end sync orchestration (ingest → extract → persist) |
//! | [`compaction`] | Three-pass tier synthesis engine and chunk indexer |
//! | [`retrieval`] | Context bundle assembler (fts5/hybrid retrieval, optional rerank) |
//! | [`ralph`] | PRD-driven iteration loop, report archive, PRD archive, guardrail hooks |
//! | [`progress`] | Terminal progress rendering shared by the CLI |
//!
//! ## Configuration
//!
//! Recall Harness is configured via a YAML file (default: `.agent/config.yaml`).
//! See [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod chunk;
pub mod compaction;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod ralph;
pub mod retrieval;
pub mod storage;
pub mod storage_remote;
pub mod tier_store;
