use crate::{ChkptId, Tick};
use rewind_archdata::{LayoutError, StorageError};
use thiserror::Error;

/// Checkpointer failures. All are surfaced to the caller; the checkpointer
/// never retries internally.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("cannot checkpoint before the simulator tree is finalized (node {0})")]
    UnfinalizedTree(String),

    #[error("archdata reachable through two tree nodes: {first} and {second}")]
    DuplicateArchData { first: String, second: String },

    #[error("a head checkpoint already exists")]
    HeadExists,

    #[error("tick {tick} is behind the {what} checkpoint tick {bound}")]
    TickRegression {
        tick: Tick,
        bound: Tick,
        what: &'static str,
    },

    #[error("exhausted all checkpoint ids")]
    IdExhausted,

    #[error("no checkpoint with id {0}")]
    UnknownCheckpoint(ChkptId),

    #[error("checkpoint {id} cannot be deleted: it is the {what}")]
    CannotDelete { id: ChkptId, what: &'static str },

    #[error("corrupt checkpoint data: {0}")]
    CorruptRestore(#[from] StorageError),

    #[error("archdata layout: {0}")]
    Layout(#[from] LayoutError),
}
