pub mod config;
pub mod db;
pub mod editing;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod index;
pub mod lifecycle;
pub mod queue;
pub mod remote_data;
pub mod runtime;
pub mod signal;
pub mod state;
pub mod sweeper;
pub mod triggers;
pub mod variables;

pub use error::{Error, ErrorKind, Result};
pub use runtime::Runtime;
