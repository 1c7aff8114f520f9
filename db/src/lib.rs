//! Database-backed checkpoint overlay.
//!
//! Same public surface as [`rewind_checkpoint::Checkpointer`], but only a
//! recent window of checkpoints stays in RAM. Closed windows (a snapshot
//! plus the deltas up to the next snapshot) are cloned out of the cache
//! by a background pipeline, serialized, zlib-compressed, and inserted
//! into SQLite, after which their cache entries are evicted (head and
//! current stay pinned). Queries fall back from the cache to the database
//! and rehydrate whole windows on demand.
//!
//! Explicit checkpoint deletion is the one API the overlay does not
//! support; rolling back with `load` instead truncates everything newer
//! than the target, in memory and on disk.

mod checkpointer;
mod codec;
mod error;
mod pipeline;
mod store;

#[cfg(test)]
mod tests;

pub use crate::checkpointer::{DbCheckpointer, DbCheckpointerOptions};
pub use crate::error::DbError;
