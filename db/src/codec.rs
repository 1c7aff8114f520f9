use crate::error::DbError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rewind_archdata::storage::VectorStorage;
use rewind_checkpoint::{Checkpoint, ChkptId, Tick};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Portable rendering of one checkpoint inside a persisted window.
#[derive(Serialize, Deserialize)]
struct StoredCheckpoint {
    id: ChkptId,
    tick: Tick,
    is_snapshot: bool,
    prev: Option<ChkptId>,
    nexts: Vec<ChkptId>,
    payload: VectorStorage,
}

/// One window ready for insertion: compressed bytes plus the index data.
pub(crate) struct EncodedWindow {
    pub bytes: Vec<u8>,
    pub ids: Vec<ChkptId>,
    pub start_tick: Tick,
    pub end_tick: Tick,
}

/// Serializes and zlib-compresses a window of checkpoints.
pub(crate) fn encode_window(chkpts: &[Checkpoint]) -> Result<EncodedWindow, DbError> {
    let stored: Vec<StoredCheckpoint> = chkpts
        .iter()
        .map(|c| StoredCheckpoint {
            id: c.id(),
            tick: c.tick(),
            is_snapshot: c.is_snapshot(),
            prev: c.prev(),
            nexts: c.nexts().to_vec(),
            payload: c.payload().clone(),
        })
        .collect();
    let raw = bincode::serialize(&stored)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let bytes = encoder.finish()?;

    let ids = chkpts.iter().map(|c| c.id()).collect();
    let start_tick = chkpts.iter().map(|c| c.tick()).min().unwrap_or(0);
    let end_tick = chkpts.iter().map(|c| c.tick()).max().unwrap_or(0);
    Ok(EncodedWindow {
        bytes,
        ids,
        start_tick,
        end_tick,
    })
}

/// Decompresses and rebuilds a persisted window.
pub(crate) fn decode_window(bytes: &[u8]) -> Result<Vec<Checkpoint>, DbError> {
    let mut raw = Vec::new();
    ZlibDecoder::new(bytes).read_to_end(&mut raw)?;
    let stored: Vec<StoredCheckpoint> = bincode::deserialize(&raw)?;
    Ok(stored
        .into_iter()
        .map(|s| {
            Checkpoint::rebuild(s.id, None, s.tick, s.is_snapshot, s.prev, s.nexts, s.payload)
        })
        .collect())
}
