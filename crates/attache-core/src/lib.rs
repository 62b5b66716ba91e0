//! # attache-core
//!
//! Core types, traits, and abstractions for attache, the single-slot
//! attachment lifecycle library.
//!
//! This crate provides the data model (blobs, slots, deferred tasks), the
//! backend traits other crates implement, the signed-ID codec, and shared
//! configuration.

pub mod config;
pub mod defaults;
pub mod digest;
pub mod error;
pub mod models;
pub mod signed_id;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use config::AttacheConfig;
pub use digest::{compute_checksum, generate_storage_key, identify_content_type, is_valid_storage_key};
pub use error::{Error, Result};
pub use models::*;
pub use signed_id::SignedIdCodec;
pub use traits::*;
pub use uuid_utils::new_v7;
