use crate::codec::{decode_window, encode_window};
use crate::error::DbError;
use crate::pipeline::{CacheState, PipelineService, SharedCache};
use crate::store;
use parking_lot::Mutex;
use rewind_checkpoint::{
    collect_archdatas, ChainLink, Checkpoint, CheckpointError, ChkptId, Scheduler, SharedArchData,
    SimNode, Tick, DEFAULT_SNAPSHOT_THRESHOLD, MIN_CHECKPOINT, UNIDENTIFIED,
};
use rewind_logger::debug;
use rewind_stop_handler::StopHandler;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Tuning for the database overlay.
#[derive(Clone, Debug)]
pub struct DbCheckpointerOptions {
    /// SQLite database file. Two connections are opened on it: one for
    /// foreground queries, one for the pipeline.
    pub path: PathBuf,
    /// How often the pipeline looks for closed windows to persist.
    pub flush_interval: Duration,
}

impl DbCheckpointerOptions {
    pub fn new<P: AsRef<Path>>(path: P) -> DbCheckpointerOptions {
        DbCheckpointerOptions {
            path: path.as_ref().to_path_buf(),
            flush_interval: Duration::from_millis(50),
        }
    }
}

/// Checkpoint manager holding only a recent window of checkpoints in RAM,
/// with SQLite as the backing store for everything older.
///
/// The overlay keeps a single branch: loading an older checkpoint
/// truncates all strictly newer ones from the cache, the window FIFO and
/// the database, then continues from there.
pub struct DbCheckpointer {
    roots: Vec<Arc<dyn SimNode>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    archdatas: Vec<SharedArchData>,
    cache: SharedCache,
    conn: Connection,
    pipeline: Option<StopHandler<()>>,
    next_id: ChkptId,
    snapshot_threshold: u32,
    num_alive: u32,
    num_alive_snapshots: u32,
}

impl DbCheckpointer {
    /// Opens (or creates) the backing database and starts the pipeline.
    pub fn open(
        options: DbCheckpointerOptions,
        roots: Vec<Arc<dyn SimNode>>,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<DbCheckpointer, DbError> {
        let conn = Connection::open(&options.path)?;
        store::create_tables(&conn)?;
        let pipeline_conn = Connection::open(&options.path)?;
        let cache: SharedCache = Arc::new(Mutex::new(CacheState::default()));
        let pipeline =
            PipelineService::new(cache.clone(), pipeline_conn, options.flush_interval).start();
        Ok(DbCheckpointer {
            roots,
            scheduler,
            archdatas: Vec::new(),
            cache,
            conn,
            pipeline: Some(pipeline),
            next_id: MIN_CHECKPOINT,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            num_alive: 0,
            num_alive_snapshots: 0,
        })
    }

    /// Stops the pipeline, flushing every pending window (the partial
    /// newest one included). Further checkpoint creation is refused.
    /// Called from `drop` if not called explicitly.
    pub fn close(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.stop(());
            self.cache.lock().failed = true;
        }
    }

    pub fn snapshot_threshold(&self) -> u32 {
        self.snapshot_threshold
    }

    pub fn set_snapshot_threshold(&mut self, threshold: u32) {
        self.snapshot_threshold = threshold;
    }

    pub fn head_id(&self) -> Option<ChkptId> {
        self.cache.lock().head_id
    }

    pub fn current_id(&self) -> Option<ChkptId> {
        self.cache.lock().current_id
    }

    pub fn current_tick(&self) -> Tick {
        let state = self.cache.lock();
        state
            .current_id
            .and_then(|id| state.chkpts.get(&id).map(|c| c.tick()))
            .unwrap_or(0)
    }

    pub fn num_checkpoints(&self) -> u32 {
        self.num_alive
    }

    pub fn num_snapshots(&self) -> u32 {
        self.num_alive_snapshots
    }

    pub fn num_deltas(&self) -> u32 {
        self.num_alive - self.num_alive_snapshots
    }

    /// Bytes held for checkpoint content in the cache (the database side
    /// is compressed and not counted here).
    pub fn content_memory_use(&self) -> u64 {
        let state = self.cache.lock();
        state.chkpts.values().map(|c| c.content_bytes()).sum()
    }

    /// Ids currently resident in the cache. Diagnostics and tests.
    pub fn cached_checkpoints(&self) -> Vec<ChkptId> {
        let mut ids: Vec<ChkptId> = self.cache.lock().chkpts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn tick_now(&self) -> Tick {
        self.scheduler
            .as_ref()
            .map(|sched| sched.current_tick())
            .unwrap_or(0)
    }

    fn check_pipeline(&self) -> Result<(), DbError> {
        if self.cache.lock().failed {
            return Err(DbError::PipelineFailed);
        }
        Ok(())
    }

    /// Creates the head snapshot; same preconditions as the core
    /// checkpointer.
    pub fn create_head(&mut self) -> Result<ChkptId, DbError> {
        self.check_pipeline()?;
        if self.cache.lock().head_id.is_some() {
            return Err(CheckpointError::HeadExists.into());
        }
        for root in &self.roots {
            if !root.is_finalized() {
                return Err(CheckpointError::UnfinalizedTree(root.location()).into());
            }
        }
        let archdatas = collect_archdatas(&self.roots)?;
        for archdata in &archdatas {
            if !archdata.read().is_laid_out() {
                return Err(
                    CheckpointError::UnfinalizedTree("archdata not laid out".to_string()).into(),
                );
            }
        }
        self.archdatas = archdatas;

        let tick = self.tick_now();
        let id = self.allocate_id()?;
        let head = Checkpoint::capture(id, tick, None, true, &self.archdatas)
            .map_err(DbError::Checkpoint)?;
        {
            let mut state = self.cache.lock();
            state.head_id = Some(id);
            state.current_id = Some(id);
            state.add_to_cache(head, true);
        }
        self.num_alive += 1;
        self.num_alive_snapshots += 1;
        debug!("created head checkpoint {} at tick {}", id, tick);
        Ok(id)
    }

    /// Creates a checkpoint after the current one. Deltas fill the open
    /// window; the snapshot threshold (or `force_snapshot`) closes it and
    /// opens the next. If the current checkpoint's window is already
    /// durable (after a rollback into evicted history), the next
    /// checkpoint is forced to a snapshot so a fresh window starts.
    pub fn create_checkpoint(&mut self, force_snapshot: bool) -> Result<ChkptId, DbError> {
        self.check_pipeline()?;
        if self.cache.lock().head_id.is_none() {
            self.create_head()?;
        }

        let tick = self.tick_now();
        let (head_tick, current_tick, current_id, open_window) = {
            let state = self.cache.lock();
            let head_id = state.head_id.expect("head created above");
            let current_id = state.current_id.expect("current set with the head");
            let head_tick = state.chkpts[&head_id].tick();
            let current_tick = state.chkpts[&current_id].tick();
            (head_tick, current_tick, current_id, !state.windows.is_empty())
        };
        if tick < head_tick {
            return Err(CheckpointError::TickRegression {
                tick,
                bound: head_tick,
                what: "head",
            }
            .into());
        }
        if tick < current_tick {
            return Err(CheckpointError::TickRegression {
                tick,
                bound: current_tick,
                what: "current",
            }
            .into());
        }

        let depth = self.distance_to_prev_snapshot(current_id)? + 1;
        let is_snapshot =
            force_snapshot || !open_window || depth >= self.snapshot_threshold.max(1);

        let id = self.allocate_id()?;
        let chkpt = Checkpoint::capture(id, tick, Some(current_id), is_snapshot, &self.archdatas)
            .map_err(DbError::Checkpoint)?;
        {
            let mut state = self.cache.lock();
            state
                .chkpts
                .get_mut(&current_id)
                .expect("current checkpoint is pinned in the cache")
                .add_next(id);
            state.add_to_cache(chkpt, true);
            state.current_id = Some(id);
            state.drain_pending_evictions();
        }
        self.num_alive += 1;
        if is_snapshot {
            self.num_alive_snapshots += 1;
        }
        debug!(
            "created {} {} at tick {}",
            if is_snapshot { "snapshot" } else { "delta" },
            id,
            tick
        );
        Ok(id)
    }

    /// Loads checkpoint `id`, rehydrating its window from the database if
    /// it was evicted, then truncates every strictly newer checkpoint.
    pub fn load(&mut self, id: ChkptId) -> Result<(), DbError> {
        self.check_pipeline()?;
        {
            let state = self.cache.lock();
            if state.current_id == Some(id) {
                return Ok(());
            }
        }

        let mut chain = self.restore_chain_checkpoints(id)?;
        for chkpt in &mut chain {
            chkpt
                .load_state(&self.archdatas)
                .map_err(DbError::Checkpoint)?;
        }
        let target = chain.last().expect("restore chains are never empty");
        debug_assert_eq!(target.id(), id);

        let next_ids = target.nexts().to_vec();
        if let Some(&first_next) = next_ids.first() {
            if next_ids.len() != 1 {
                return Err(DbError::MultipleBranches);
            }
            self.truncate_from(first_next)?;
        }

        // Re-cache the target, detached from its (now truncated) future.
        let kept = Checkpoint::rebuild(
            id,
            None,
            target.tick(),
            target.is_snapshot(),
            target.prev(),
            Vec::new(),
            target.payload().clone(),
        );
        {
            let mut state = self.cache.lock();
            state.current_id = Some(id);
            if state.head_id != Some(id) {
                // Only re-enter the window FIFO if the truncated FIFO still
                // ends at this checkpoint; anything else is already durable
                // and is cached for fast access only.
                let in_fifo = state.windows.back().and_then(|w| w.last()) == Some(&id);
                state.add_to_cache(kept, in_fifo);
            }
            state.drain_pending_evictions();
        }

        // Increasing-by-one ids make the live count trivial after a
        // rollback.
        self.next_id = id + 1;
        self.num_alive = (id + 1) as u32;

        if let Some(sched) = &self.scheduler {
            sched.restart_at(self.current_tick());
        }
        Ok(())
    }

    /// The overlay keeps every checkpoint reachable; rollback via `load`
    /// is the only way to discard history.
    pub fn delete(&mut self, _id: ChkptId) -> Result<(), DbError> {
        Err(DbError::DeleteUnsupported)
    }

    /// Whether `id` exists in the cache or the database.
    pub fn has(&self, id: ChkptId) -> Result<bool, DbError> {
        if self.cache.lock().chkpts.contains_key(&id) {
            return Ok(true);
        }
        Ok(store::has_checkpoint(&self.conn, id)?)
    }

    /// Live checkpoints taken at tick `t`, cache and database combined.
    pub fn checkpoints_at(&self, t: Tick) -> Result<Vec<ChkptId>, DbError> {
        let mut ids: Vec<ChkptId> = {
            let state = self.cache.lock();
            state
                .chkpts
                .values()
                .filter(|c| c.tick() == t)
                .map(|c| c.id())
                .collect()
        };
        for bytes in store::window_bytes_at_tick(&self.conn, t)? {
            for chkpt in decode_window(&bytes)? {
                if chkpt.tick() == t {
                    ids.push(chkpt.id());
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// All checkpoint ids, ascending.
    pub fn all_checkpoints(&self) -> Result<Vec<ChkptId>, DbError> {
        let mut ids = store::all_chkpt_ids(&self.conn)?;
        ids.extend(self.cache.lock().chkpts.keys().copied());
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn next_ids(&self, id: ChkptId) -> Result<Vec<ChkptId>, DbError> {
        let chkpt = self.fetch_required(id)?;
        Ok(chkpt.nexts().to_vec())
    }

    pub fn prev_id(&self, id: ChkptId) -> Result<Option<ChkptId>, DbError> {
        let chkpt = self.fetch_required(id)?;
        Ok(chkpt.prev())
    }

    /// Ancestry of `id` from the head down. The overlay has no
    /// tombstones, so every link is live.
    pub fn chain(&self, id: ChkptId) -> Result<Vec<ChainLink>, DbError> {
        let mut chain = Vec::new();
        let mut at = Some(id);
        while let Some(k) = at {
            let chkpt = self.fetch_required(k)?;
            chain.push(ChainLink::Live(k));
            at = chkpt.prev();
        }
        chain.reverse();
        Ok(chain)
    }

    pub fn find_latest_at_or_before(
        &self,
        tick: Tick,
        from: ChkptId,
    ) -> Result<Option<ChkptId>, DbError> {
        let mut at = Some(from);
        while let Some(k) = at {
            let chkpt = self.fetch_required(k)?;
            if chkpt.tick() <= tick {
                return Ok(Some(k));
            }
            at = chkpt.prev();
        }
        Ok(None)
    }

    /// Distance from `id` back to its nearest snapshot. Whole windows are
    /// evicted together, so the walk stays within either the cache or one
    /// persisted window.
    pub fn distance_to_prev_snapshot(&self, id: ChkptId) -> Result<u32, DbError> {
        let mut dist = 0;
        let mut at = id;
        loop {
            let chkpt = self.fetch_required(at)?;
            if chkpt.is_snapshot() {
                return Ok(dist);
            }
            dist += 1;
            at = chkpt
                .prev()
                .expect("every chain is rooted in a snapshot head");
        }
    }

    fn allocate_id(&mut self) -> Result<ChkptId, DbError> {
        if self.next_id == UNIDENTIFIED {
            return Err(CheckpointError::IdExhausted.into());
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Cache-first checkpoint fetch; falls back to rehydrating the
    /// containing window from the database.
    fn fetch(&self, id: ChkptId) -> Result<Option<Checkpoint>, DbError> {
        if let Some(chkpt) = self.cache.lock().chkpts.get(&id) {
            return Ok(Some(chkpt.clone()));
        }
        match store::window_bytes_by_chkpt(&self.conn, id)? {
            Some(bytes) => Ok(decode_window(&bytes)?.into_iter().find(|c| c.id() == id)),
            None => Ok(None),
        }
    }

    fn fetch_required(&self, id: ChkptId) -> Result<Checkpoint, DbError> {
        self.fetch(id)?
            .ok_or(DbError::Checkpoint(CheckpointError::UnknownCheckpoint(id)))
    }

    /// The restore chain of `id` as owned checkpoints, oldest first.
    fn restore_chain_checkpoints(&self, id: ChkptId) -> Result<Vec<Checkpoint>, DbError> {
        let mut chain = Vec::new();
        let mut at = id;
        loop {
            let chkpt = self.fetch_required(at)?;
            let is_snapshot = chkpt.is_snapshot();
            let prev = chkpt.prev();
            chain.push(chkpt);
            if is_snapshot {
                break;
            }
            at = prev.expect("a delta checkpoint always has a predecessor");
        }
        chain.reverse();
        Ok(chain)
    }

    /// Removes every checkpoint with id >= `from` from the cache, the
    /// window FIFO and the database. Windows straddling the boundary are
    /// rewritten in place.
    fn truncate_from(&mut self, from: ChkptId) -> Result<(), DbError> {
        let mut removed_snapshots = 0u32;
        {
            let mut state = self.cache.lock();
            // Window FIFO: ids are monotonic, so cut at the boundary and
            // drop everything behind it.
            let mut cut_at = None;
            for (pos, window) in state.windows.iter_mut().enumerate() {
                if window.first().map_or(true, |&first| first >= from) {
                    cut_at = Some(pos);
                    break;
                }
                if window.last().map_or(false, |&last| last >= from) {
                    window.retain(|&id| id < from);
                    cut_at = Some(pos + 1);
                    break;
                }
            }
            if let Some(pos) = cut_at {
                state.windows.truncate(pos);
            }
            let doomed: Vec<ChkptId> = state
                .chkpts
                .keys()
                .copied()
                .filter(|&id| id >= from)
                .collect();
            for id in doomed {
                if let Some(chkpt) = state.chkpts.remove(&id) {
                    if chkpt.is_snapshot() {
                        removed_snapshots += 1;
                    }
                }
            }
            // Survivors must not keep successor links into the cut.
            for chkpt in state.chkpts.values_mut() {
                for next in chkpt.nexts().to_vec() {
                    if next >= from {
                        chkpt.remove_next(next);
                    }
                }
            }
            state.pending_eviction.retain(|&id| id < from);
        }

        for (rowid, min_id, _max_id) in store::windows_reaching(&self.conn, from)? {
            if min_id >= from {
                store::delete_window(&mut self.conn, rowid)?;
                continue;
            }
            // Boundary window: rebuild it with only the surviving prefix.
            let bytes = store::window_bytes_by_rowid(&self.conn, rowid)?;
            let mut window = decode_window(&bytes)?;
            for chkpt in &window {
                if chkpt.id() >= from && chkpt.is_snapshot() {
                    removed_snapshots += 1;
                }
            }
            window.retain(|c| c.id() < from);
            if let Some(last) = window.last_mut() {
                for next in last.nexts().to_vec() {
                    if next >= from {
                        last.remove_next(next);
                    }
                }
            }
            let encoded = encode_window(&window)?;
            store::replace_window(&mut self.conn, rowid, &encoded)?;
        }

        self.num_alive_snapshots = self.num_alive_snapshots.saturating_sub(removed_snapshots);
        debug!("truncated checkpoints at and beyond {}", from);
        Ok(())
    }
}

impl Drop for DbCheckpointer {
    fn drop(&mut self) {
        self.close();
    }
}
