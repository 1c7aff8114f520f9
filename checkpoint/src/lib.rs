//! Delta-checkpoint trees over [`rewind_archdata`] regions.
//!
//! A [`Checkpointer`] captures the full mutable state of a simulator (the
//! archdata regions reachable from its root nodes) as a tree of
//! checkpoints. Most checkpoints are deltas holding only the lines dirtied
//! since their parent; every `snapshot_threshold`-th checkpoint (and the
//! head) is a full snapshot, so loading any checkpoint replays a short
//! restore chain: the nearest snapshot ancestor followed by the deltas up
//! to the target. Deletion tombstones a checkpoint; the chain-cleanup pass
//! frees tombstones once no live descendant depends on them.

mod chain;
mod checkpoint;
mod checkpointer;
mod error;
mod node;


pub use crate::chain::{history_chain, restore_chain};
pub use crate::checkpoint::{ChainLink, Checkpoint};
pub use crate::checkpointer::{Checkpointer, TraceStep};
pub use crate::error::CheckpointError;
pub use crate::node::{collect_archdatas, Scheduler, SharedArchData, SimNode};

/// Simulation tick number checkpoints refer to.
pub type Tick = u64;

/// Checkpoint identifier, unique within one checkpointer.
pub type ChkptId = u64;

/// Smallest valid checkpoint id.
pub const MIN_CHECKPOINT: ChkptId = 0;

/// Id of a tombstoned (or otherwise invalid) checkpoint.
pub const UNIDENTIFIED: ChkptId = ChkptId::MAX;

/// Default distance between automatic snapshots.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u32 = 20;
