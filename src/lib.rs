//! Executes the chunks of a parsed literate document against a stateful
//! backend, caching results per chunk position.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;

pub use config::settings::{DocumentPaths, WeaveSettings};
pub use engine::backend::{Backend, Session};
pub use engine::cache_store::{CacheStore, FileCacheStore, MemoryCacheStore};
pub use engine::comparison::{ComparisonStrategy, ContentWithOptions, NormalizedWhitespace, RawContent};
pub use engine::engine::Engine;
pub use error::{BackendError, CacheStoreError, EngineError};
pub use model::chunk::{Chunk, CodeChunk, DocChunk};
pub use model::options::ChunkOptions;
pub use model::output::Output;
