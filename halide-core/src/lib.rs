//! # Halide Core
//!
//! Catalog analysis and parallel job execution core for the Halide photo
//! library manager.
//!
//! ## Overview
//!
//! Long-running catalog analyses (scanning, perceptual hashing, burst
//! detection, thumbnailing, quality scoring, tagging) all run through one
//! pipeline: discover a finite work set, partition it into durable batches,
//! process batches on a bounded worker pool, and optionally finalize the
//! aggregated results. Batches live in the catalog store, so progress is
//! observable in real time, jobs survive process restarts, and workers can
//! be cancelled from outside.
//!
//! ## Architecture
//!
//! - [`analysis`]: pure primitives (hashes, grouping, bursts, quality)
//! - [`media`]: filesystem discovery, checksums, EXIF, thumbnails
//! - [`database`]: storage ports with Postgres and in-memory backends
//! - [`jobs`]: the framework (definitions, registry, executor, controller,
//!   progress publication)

pub mod analysis;
pub mod config;
pub mod database;
pub mod error;
pub mod jobs;
pub mod media;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use config::RuntimeConfig;
pub use error::{HalideError, Result};

/// Shared domain types.
pub use halide_model as model;
