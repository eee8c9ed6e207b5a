//! objsync - Resumable Object Migration
//!
//! Copies objects from a source storage to a target storage through a chain
//! of filters, optionally verifying each copy and deleting the source, while
//! recording every object's progress in a SQLite status table. A migration
//! that is interrupted can be run again and picks up where it left off.
//!
//! # Features
//!
//! - **Pluggable storage**: sources, targets and filters are trait objects
//!   resolved by URI prefix or name from an explicit registry.
//!
//! - **Parallel sync**: independent pools for listing directories and for
//!   syncing objects, with a bounded sync queue that blocks producers.
//!   Both pools can be resized mid-run.
//!
//! - **Throttling**: optional objects-per-second and bytes-per-second
//!   limits, plus a side count of the source's total objects and bytes.
//!
//! - **Resumable status**: one row per object, created on the first status
//!   write and updated afterwards, with retry counts and the first error kept.
//!
//! - **Streaming queries**: error and retry-queue listings are streamed one
//!   row at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Source Storage                             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ all_objects / children
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SyncEngine                              │
//! │  ┌────────────┐      ┌────────────┐      ┌────────────┐         │
//! │  │ query pool │ ───► │ sync pool  │ ◄─── │ retry pool │         │
//! │  │            │ ◄─── │ (bounded)  │ ───► │ (1 thread) │         │
//! │  └────────────┘      └─────┬──────┘      └────────────┘         │
//! │                            │                                    │
//! │               filters ──► target ──► verifier                   │
//! └────────────────────────────┬────────────────────────────────────┘
//!                              │ one row per object
//!                              ▼
//!                   ┌─────────────────────┐
//!                   │    StatusStore      │
//!                   │ (SQLite, pooled)    │
//!                   └─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Generate 500 random objects and copy them, verifying each one
//! objsync run --source 'test:?objects=500' --target test: --verify
//!
//! # What state is everything in?
//! objsync report --db objsync.db
//!
//! # Which objects failed?
//! objsync errors --db objsync.db
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod object;
pub mod plugin;
pub mod progress;

pub use config::{CliArgs, SyncConfig, SyncOptions};
pub use db::{StatusStore, StoreConfig, SyncRecord};
pub use engine::{SyncEngine, SyncSummary, TerminateHandle};
pub use error::{Result, SyncError};
pub use object::{ObjectContext, ObjectStatus, ObjectSummary, SyncObject};
