//! Tiered model routing.
//!
//! The router owns the tier ladder (canned intents, local cache, cloud) and
//! consults the safety monitor before any of it. The rest of the crate only
//! sees `ModelRouter::process` and the `CloudModel` trait.

mod cache;
mod client;
mod router;
mod types;

pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use client::{CloudClientConfig, CloudModel, HttpCloudModel};
pub use router::ModelRouter;
pub use types::{CloudCompletion, LlmResponse, ResponseSource};
