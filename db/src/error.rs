use rewind_checkpoint::CheckpointError;
use thiserror::Error;

/// Failures of the database-backed checkpointer.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("window encoding: {0}")]
    Encode(#[from] bincode::Error),

    #[error("window compression: {0}")]
    Io(#[from] std::io::Error),

    #[error("explicit checkpoint deletion is not supported by the database checkpointer")]
    DeleteUnsupported,

    #[error("the database checkpointer keeps a single branch; load an older checkpoint to fork")]
    MultipleBranches,

    #[error("the checkpoint pipeline has failed; no further checkpoints are accepted")]
    PipelineFailed,
}
