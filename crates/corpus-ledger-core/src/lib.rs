//! # Corpus Ledger Core
//!
//! Control-plane logic for incremental corpus ingestion: the crawl-state
//! model and ledger service, two-tier deduplication (exact LRU + MinHash
//! LSH), orchestration policy, quotas and typed record filters.
//!
//! This crate contains no tokio runtime, sqlx, filesystem I/O, or other
//! host-specific dependencies. Persistence is reached through the
//! [`store::LedgerStore`] trait; time through [`clock::Clock`].

pub mod clock;
pub mod dedup;
pub mod filters;
pub mod ledger;
pub mod models;
pub mod policy;
pub mod quota;
pub mod store;
