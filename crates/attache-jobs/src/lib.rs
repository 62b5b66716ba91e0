//! # attache-jobs
//!
//! Deferred execution for attache.
//!
//! This crate provides:
//! - The [`PurgeHandler`], which re-checks eligibility before deleting a blob
//! - A polling [`JobWorker`] with bounded concurrency and per-task timeouts
//! - Worker events on a broadcast channel
//!
//! ## Example
//!
//! ```ignore
//! use attache_jobs::{PurgeHandler, WorkerBuilder, WorkerConfig};
//!
//! let worker = WorkerBuilder::new(db.tasks.clone())
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(PurgeHandler::new(registry, db.slots.clone()))
//!     .build();
//!
//! let handle = worker.start();
//! handle.shutdown().await?;
//! ```

pub mod handler;
pub mod purge;
pub mod worker;

pub use attache_core::*;

pub use handler::{JobContext, JobHandler, JobResult};
pub use purge::PurgeHandler;
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
