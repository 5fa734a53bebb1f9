//! Response storage for offline support.
//!
//! This module provides the store side of the interception layer:
//! - Named stores mapping a request identity to a stored response
//! - Generation-tagged store names with pruning of older generations
//! - A background writer so cache population never delays a response

mod generations;
mod storage;
mod traits;
mod writer;

pub use generations::{GenerationManager, StorePurpose};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, RequestKey, StoredResponse};
pub use writer::CacheWriter;
