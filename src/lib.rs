pub mod config;
pub mod error;
pub mod corpus;
pub mod search;
pub mod embeddings;
pub mod cache;
pub mod llm;
pub mod generation;
pub mod eval;
pub mod runs;
pub mod pipeline;

pub use config::Config;
pub use corpus::{Chunk, ChunkStore, Example};
pub use error::{RagevalError, Result};
pub use pipeline::Pipeline;
pub use runs::{RunRecord, RunStore};
