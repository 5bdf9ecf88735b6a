//! # Content Sync
//!
//! Versioning ledger and search-index synchronization for learning content.
//!
//! Every committed mutation of a content item appends an immutable
//! [`models::VersionEvent`] to a per-item ledger and, in the same transaction,
//! an outbox row. The outbox is relayed into a task queue; extraction workers
//! turn raw sources into text, and the indexer applies the result to the
//! search index only if it is newer than what the index already holds. A
//! reconciler periodically compares ledger heads with the index and re-drives
//! anything that drifted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  tx   ┌────────┐      ┌───────┐      ┌────────────┐      ┌─────────┐
//! │ Change   │──────▶│ Ledger │      │ Relay │─────▶│ Task Queue │─────▶│ Workers │
//! │ Capture  │       │+Outbox │─────▶│       │      │ (leases)   │      │         │
//! └──────────┘       └────────┘      └───────┘      └─────▲──────┘      └────┬────┘
//!                         │                               │                  │
//!                         │          ┌────────────┐       │        extract   │ index / retract
//!                         └─────────▶│ Reconciler │───────┘        ┌─────────┴──────┐
//!                          heads     └─────┬──────┘                ▼                ▼
//!                                          │ versions      ┌────────────┐    ┌─────────┐
//!                                          └──────────────▶│ Extraction │───▶│ Indexer │──▶ Search Index
//!                                                          └────────────┘    └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! csync init
//! csync content create --kind document --source object://notes/cells.pdf --title "Cells"
//! csync work --drain
//! csync search "mitochondria"
//! csync reconcile
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy and classification |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`locks`] | Per-identifier async locks |
//! | [`capture`] | Change Capture: mutation + ledger + outbox in one transaction |
//! | [`ledger`] | Read side of the version ledger |
//! | [`relay`] | Outbox relay into the task queue |
//! | [`queue`] | Task queue contract and backends |
//! | [`resolve`] | Raw-source resolution |
//! | [`extract`] | Kind-specific extractors |
//! | [`extraction`] | Extraction worker and result store |
//! | [`index`] | Search index contract and backends |
//! | [`indexer`] | Version-guarded index writes |
//! | [`reconciler`] | Ledger vs index drift repair |
//! | [`workers`] | Worker runtime |
//! | [`context`] | Explicit wiring of collaborators |

pub mod capture;
pub mod config;
pub mod content_cmd;
pub mod context;
pub mod db;
pub mod error;
pub mod extract;
pub mod extraction;
pub mod index;
pub mod indexer;
pub mod ledger;
pub mod locks;
pub mod migrate;
pub mod models;
pub mod pipeline_cmd;
pub mod queue;
pub mod reconciler;
pub mod relay;
pub mod resolve;
pub mod search;
pub mod stats;
pub mod workers;
