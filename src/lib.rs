//! # Corpus Ledger
//!
//! Control plane for collecting a text corpus from many independent
//! sources on a schedule: a durable crawl-state ledger, two-tier
//! deduplication, resumable extraction checkpoints and a multi-source
//! orchestrator with cadence, daily quotas and per-source locking.
//!
//! The domain logic (state machine, dedup engine, cadence policy, quota
//! accounting) lives in `corpus-ledger-core`; this crate adds SQLite
//! persistence, file-based checkpoints, the built-in sources and the
//! `corpus` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │   Sources    │──▶│ Orchestrator  │──▶│  JSONL sink  │
//! │ fs/jsonl/http│   │ dedup + quota │   │ <source>.jsonl│
//! └──────────────┘   └───────┬───────┘   └──────────────┘
//!                            │
//!              ┌─────────────┼─────────────┐
//!              ▼             ▼             ▼
//!        ┌──────────┐  ┌──────────┐  ┌──────────┐
//!        │  Ledger  │  │Checkpoint│  │ LSH index│
//!        │ (SQLite) │  │  files   │  │  (JSON)  │
//!        └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! corpus init                   # create the ledger
//! corpus sources                # check configuration
//! corpus run                    # run every source that is due
//! corpus status                 # counts, last runs, locks, checkpoints
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite pool and ledger construction |
//! | [`migrate`] | Ledger schema |
//! | [`sqlite_store`] | `LedgerStore` backed by SQLite |
//! | [`checkpoint`] | Atomic checkpoints and completion markers |
//! | [`index_store`] | Near-duplicate index persistence |
//! | [`traits`] | `Source` / `RecordSink` traits and the source registry |
//! | [`source_fs`] | Local directory source |
//! | [`source_jsonl`] | JSON Lines file source |
//! | [`source_http`] | HTTP dump source with conditional probing |
//! | [`writer`] | JSONL output sink |
//! | [`orchestrator`] | Multi-source run loop |
//! | [`report`] | Run outcome and metrics |
//! | [`sources`] | `corpus sources` |
//! | [`stats`] | `corpus status` |

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod index_store;
pub mod migrate;
pub mod orchestrator;
pub mod report;
pub mod source_fs;
pub mod source_http;
pub mod source_jsonl;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
pub mod traits;
pub mod writer;
