//! Batchgate
//!
//! Gatekeeper service for customer batch uploads. Customers drop sets of CSV
//! files into per-customer blob containers; the files of one upload run
//! share a batch prefix and arrive asynchronously in any order. This service
//! consumes blob-created notifications, waits until every expected file type
//! of a batch has arrived, structurally validates each file, and relocates
//! the whole batch to a `valid-set/` or `invalid-set/` partition.
//!
//! ## Architecture
//!
//! ```text
//! Notification API            Per-batch instances          Blob storage
//! ┌──────────────┐           ┌──────────────────┐         ┌──────────────┐
//! │ POST         │  signals  │ Tracker          │  list/  │ {container}/ │
//! │ /api/        │──────────▶│  accumulate      │  open   │   inbound/   │
//! │ notifications│           │  validate        │────────▶│   valid-set/ │
//! └──────────────┘           │  relocate        │  copy/  │   invalid-set│
//!        │                   └──────────────────┘  delete └──────────────┘
//!        ▼                            │
//! ┌──────────────┐                    ▼
//! │ Dispatcher   │           ┌──────────────────┐
//! │ one instance │           │ Batch state      │
//! │ per batch key│           │ store (Postgres) │
//! └──────────────┘           └──────────────────┘
//! ```
//!
//! The batch state store guards the validate-once property: a batch record
//! moves `waiting -> in_progress -> done` and only the single winner of the
//! `waiting -> in_progress` transition runs validation. Received file types
//! are journaled per batch, so a restarted process replays the journal and
//! resumes exactly where it left off.

pub mod api;
pub mod batch_store;
pub mod blob_store;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod expected;
pub mod notification;
pub mod relocator;
pub mod tracker;
pub mod validator;

pub use batch_store::{BatchRecord, BatchState, BatchStateStore, PgBatchStore};
pub use blob_store::{BlobRef, BlobStore, CopyStatus, S3BlobStore};
pub use config::Config;
pub use descriptor::FileDescriptor;
pub use dispatcher::Dispatcher;
pub use error::{GateError, Result};
pub use expected::{ExpectedFileSetResolver, StaticResolver};
pub use relocator::Relocator;
pub use tracker::{Outcome, Phase, Tracker};
pub use validator::{FileSetValidator, ValidationError};
