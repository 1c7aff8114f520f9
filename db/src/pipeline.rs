//! Background persist pipeline: clone closed windows out of the cache,
//! serialize, compress, insert, evict.

use crate::codec::encode_window;
use crate::store;
use parking_lot::Mutex;
use rewind_channel::RecvTimeoutError;
use rewind_checkpoint::{Checkpoint, ChkptId};
use rewind_logger::{debug, error, trace};
use rewind_stop_handler::StopHandler;
use rusqlite::Connection;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Complete windows kept in the cache besides the newest (possibly
/// partial) one, so recent-checkpoint APIs stay O(1).
const CACHED_WINDOWS: usize = 2;

/// Cache shared between the simulator-facing checkpointer and the
/// pipeline thread. The pipeline only touches this state and its own
/// database connection, never simulator state.
#[derive(Default)]
pub(crate) struct CacheState {
    pub chkpts: HashMap<ChkptId, Checkpoint>,
    /// FIFO of windows: each entry is a snapshot id followed by its delta
    /// ids, in creation order.
    pub windows: VecDeque<Vec<ChkptId>>,
    pub head_id: Option<ChkptId>,
    pub current_id: Option<ChkptId>,
    /// Persisted ids that could not be evicted because they were current
    /// at the time; drained whenever current moves.
    pub pending_eviction: VecDeque<ChkptId>,
    /// A database write failed; the checkpointer stops accepting work.
    pub failed: bool,
}

pub(crate) type SharedCache = Arc<Mutex<CacheState>>;

impl CacheState {
    /// Caches a checkpoint and, when `enqueue` is set, appends it to the
    /// window FIFO (snapshots open a fresh window). Checkpoints already
    /// persisted are cached for fast access only and scheduled for
    /// eviction once they stop being current.
    pub fn add_to_cache(&mut self, chkpt: Checkpoint, enqueue: bool) {
        let id = chkpt.id();
        let is_snapshot = chkpt.is_snapshot();
        self.chkpts.insert(id, chkpt);
        if !enqueue {
            self.pending_eviction.push_back(id);
            return;
        }
        if self
            .windows
            .back()
            .and_then(|window| window.last())
            .copied()
            == Some(id)
        {
            return;
        }
        if is_snapshot || self.windows.is_empty() {
            self.windows.push_back(Vec::new());
        }
        let window = self.windows.back_mut().expect("window pushed above");
        window.push(id);
    }

    /// Evicts persisted ids, keeping the head pinned and deferring the
    /// current checkpoint until it moves on.
    fn evict(&mut self, ids: &[ChkptId]) {
        for &id in ids {
            if Some(id) == self.head_id {
                continue;
            }
            if Some(id) == self.current_id {
                self.pending_eviction.push_back(id);
                continue;
            }
            self.chkpts.remove(&id);
        }
    }

    /// Drops cache entries whose windows are already durable and which are
    /// no longer current.
    pub fn drain_pending_evictions(&mut self) {
        let mut keep = VecDeque::new();
        while let Some(id) = self.pending_eviction.pop_front() {
            if Some(id) == self.current_id || Some(id) == self.head_id {
                keep.push_back(id);
            } else {
                self.chkpts.remove(&id);
            }
        }
        self.pending_eviction = keep;
    }
}

/// The background stage chain, driven by one dedicated thread with its own
/// database connection.
pub(crate) struct PipelineService {
    cache: SharedCache,
    conn: Connection,
    flush_interval: Duration,
}

impl PipelineService {
    pub fn new(cache: SharedCache, conn: Connection, flush_interval: Duration) -> PipelineService {
        PipelineService {
            cache,
            conn,
            flush_interval,
        }
    }

    pub fn start(mut self) -> StopHandler<()> {
        let (stop_tx, stop_rx) = rewind_channel::bounded::<()>(rewind_channel::SIGNAL_CHANNEL_SIZE);
        let thread = thread::Builder::new()
            .name("chkpt-pipeline".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(self.flush_interval) {
                    Err(RecvTimeoutError::Timeout) => self.flush(false),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("checkpoint pipeline closing, flushing pending windows");
                        self.flush(true);
                        break;
                    }
                }
            })
            .expect("failed to spawn the checkpoint pipeline");
        StopHandler::new("chkpt-pipeline".to_string(), stop_tx, thread)
    }

    /// Stage 1: clone complete closed windows out of the cache. On
    /// shutdown every pending window goes, the partial newest included.
    fn clone_windows(&self, terminating: bool) -> Option<Vec<Vec<Checkpoint>>> {
        let mut state = self.cache.lock();
        if state.failed {
            return None;
        }
        let mut cloned = Vec::new();
        while state.windows.len() > CACHED_WINDOWS
            || (terminating && !state.windows.is_empty())
        {
            let window = state.windows.pop_front().expect("window FIFO not empty");
            let mut chkpts = Vec::with_capacity(window.len());
            for id in window {
                let Some(chkpt) = state.chkpts.get(&id) else {
                    error!("checkpoint {} vanished from the cache before persist", id);
                    state.failed = true;
                    return None;
                };
                if chkpts.is_empty() && !chkpt.is_snapshot() {
                    error!("window does not start with a snapshot (id {})", id);
                    state.failed = true;
                    return None;
                }
                if !chkpts.is_empty() && chkpt.is_snapshot() {
                    error!("window holds a second snapshot (id {})", id);
                    state.failed = true;
                    return None;
                }
                chkpts.push(chkpt.clone());
            }
            if !chkpts.is_empty() {
                cloned.push(chkpts);
            }
        }
        Some(cloned)
    }

    /// Stages 2-6 for every window stage 1 produced: attach ids and tick
    /// bounds, serialize, compress, insert, evict. A write failure is
    /// fatal to the run: the failed window and everything behind it go
    /// back onto the FIFO (still cached, nothing dropped) and the
    /// checkpointer stops accepting work.
    fn flush(&mut self, terminating: bool) {
        let Some(windows) = self.clone_windows(terminating) else {
            return;
        };
        let mut queue = windows.into_iter();
        while let Some(window) = queue.next() {
            let ids: Vec<ChkptId> = window.iter().map(|c| c.id()).collect();
            let written = encode_window(&window)
                .map_err(|err| err.to_string())
                .and_then(|encoded| {
                    store::insert_window(&mut self.conn, &encoded)
                        .map(|()| encoded.bytes.len())
                        .map_err(|err| err.to_string())
                });
            match written {
                Ok(compressed_len) => {
                    trace!(
                        "persisted checkpoint window {:?} ({} B compressed)",
                        ids,
                        compressed_len
                    );
                    self.cache.lock().evict(&ids);
                }
                Err(err) => {
                    error!("failed to persist checkpoint window {:?}: {}", ids, err);
                    let mut state = self.cache.lock();
                    state.failed = true;
                    let mut unwritten: Vec<Vec<ChkptId>> = vec![ids];
                    unwritten
                        .extend(queue.map(|w| w.iter().map(|c| c.id()).collect::<Vec<_>>()));
                    for window_ids in unwritten.into_iter().rev() {
                        state.windows.push_front(window_ids);
                    }
                    return;
                }
            }
        }
    }
}
