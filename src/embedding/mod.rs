//! Asynchronous vector generation for indexed resources.

pub mod provider;
pub mod text;
pub mod worker;

pub use provider::{EmbeddingProvider, HttpEmbeddingProvider};
pub use worker::{EmbeddingStatus, EmbeddingWorker};
