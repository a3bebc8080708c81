//! Undertow Web - Subsonic-style streaming endpoint
//!
//! Exposes `stream` over HTTP. Untranscoded files and completed cache
//! artifacts are served with range and conditional request support; live
//! transcodes are streamed as they are produced.

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::ApiError;
pub use server::{AppState, router, run_server};
