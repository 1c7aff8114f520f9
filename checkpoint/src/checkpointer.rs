use crate::chain::{history_chain, restore_chain};
use crate::checkpoint::{ChainLink, Checkpoint};
use crate::error::CheckpointError;
use crate::node::{collect_archdatas, Scheduler, SharedArchData, SimNode};
use crate::{ChkptId, Tick, DEFAULT_SNAPSHOT_THRESHOLD, MIN_CHECKPOINT, UNIDENTIFIED};
use rewind_archdata::storage::{LineSource, VectorStorage};
use rewind_archdata::Offset;
use rewind_logger::{debug, trace};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

/// One step of a [`Checkpointer::trace_value`] walk: the value of the
/// traced bytes after applying this chain member, with `None` for bytes the
/// chain has not defined yet.
#[derive(Clone, Debug)]
pub struct TraceStep {
    pub link: ChainLink,
    pub is_snapshot: bool,
    /// Whether this chain member stored the traced line.
    pub changed: bool,
    pub bytes: Vec<Option<u8>>,
}

/// Checkpoint manager for a set of simulator tree roots.
///
/// The archdata set is enumerated once, at head creation, and is fixed for
/// the checkpointer's lifetime. All operations run on the simulator thread;
/// nothing here is reentrant.
pub struct Checkpointer {
    roots: Vec<Arc<dyn SimNode>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    archdatas: Vec<SharedArchData>,
    chkpts: BTreeMap<ChkptId, Checkpoint>,
    head: Option<ChkptId>,
    current: Option<ChkptId>,
    next_id: ChkptId,
    snapshot_threshold: u32,
    num_alive: u32,
    num_alive_snapshots: u32,
    num_dead: u32,
    total_created: u64,
}

impl Checkpointer {
    pub fn new(roots: Vec<Arc<dyn SimNode>>, scheduler: Option<Arc<dyn Scheduler>>) -> Checkpointer {
        Checkpointer {
            roots,
            scheduler,
            archdatas: Vec::new(),
            chkpts: BTreeMap::new(),
            head: None,
            current: None,
            next_id: MIN_CHECKPOINT,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            num_alive: 0,
            num_alive_snapshots: 0,
            num_dead: 0,
            total_created: 0,
        }
    }

    /// Adds another root to checkpoint from. Only allowed before the head
    /// exists; the archdata set must stay fixed afterwards.
    pub fn add_root(&mut self, root: Arc<dyn SimNode>) -> Result<(), CheckpointError> {
        if self.head.is_some() {
            return Err(CheckpointError::HeadExists);
        }
        self.roots.push(root);
        Ok(())
    }

    /// Distance between automatic snapshots. 0 or 1 makes every checkpoint
    /// a snapshot; n makes every n-th checkpoint in a chain a snapshot.
    /// A space/time trade-off knob.
    pub fn snapshot_threshold(&self) -> u32 {
        self.snapshot_threshold
    }

    pub fn set_snapshot_threshold(&mut self, threshold: u32) {
        self.snapshot_threshold = threshold;
    }

    pub fn scheduler(&self) -> Option<&Arc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }

    /// The archdata set enumerated at head creation. Empty before then.
    pub fn archdatas(&self) -> &[SharedArchData] {
        &self.archdatas
    }

    fn tick_now(&self) -> Tick {
        self.scheduler
            .as_ref()
            .map(|sched| sched.current_tick())
            .unwrap_or(0)
    }

    /// Creates the head: a snapshot of the fully initialized simulator at
    /// the current tick. Walks the root trees exactly once to enumerate
    /// archdatas, rejecting one reachable through two nodes. Later
    /// checkpoints can never be created at ticks before the head's.
    pub fn create_head(&mut self) -> Result<ChkptId, CheckpointError> {
        if self.head.is_some() {
            return Err(CheckpointError::HeadExists);
        }
        for root in &self.roots {
            if !root.is_finalized() {
                return Err(CheckpointError::UnfinalizedTree(root.location()));
            }
        }
        let archdatas = collect_archdatas(&self.roots)?;
        for archdata in &archdatas {
            if !archdata.read().is_laid_out() {
                return Err(CheckpointError::UnfinalizedTree(
                    "archdata not laid out".to_string(),
                ));
            }
        }
        self.archdatas = archdatas;

        let tick = self.tick_now();
        let id = self.allocate_id()?;
        let head = Checkpoint::capture(id, tick, None, true, &self.archdatas)?;
        self.chkpts.insert(id, head);
        self.head = Some(id);
        self.current = Some(id);
        self.num_alive += 1;
        self.num_alive_snapshots += 1;
        self.total_created += 1;
        debug!("created head checkpoint {} at tick {}", id, tick);
        Ok(id)
    }

    /// Creates a checkpoint after the current one, auto-creating the head
    /// first if none exists. The checkpoint is a delta unless
    /// `force_snapshot` is set or the snapshot threshold is reached.
    pub fn create_checkpoint(&mut self, force_snapshot: bool) -> Result<ChkptId, CheckpointError> {
        if self.head.is_none() {
            self.create_head()?;
        }
        let head_key = self.head.expect("head created above");
        let current_key = self.current.expect("current always set once a head exists");

        let tick = self.tick_now();
        let head_tick = self.chkpts[&head_key].tick();
        if tick < head_tick {
            return Err(CheckpointError::TickRegression {
                tick,
                bound: head_tick,
                what: "head",
            });
        }
        let current_tick = self.chkpts[&current_key].tick();
        if tick < current_tick {
            return Err(CheckpointError::TickRegression {
                tick,
                bound: current_tick,
                what: "current",
            });
        }

        let depth = self.distance_to_prev_snapshot_key(current_key) + 1;
        let is_snapshot = force_snapshot || depth >= self.snapshot_threshold.max(1);

        let id = self.allocate_id()?;
        let chkpt = Checkpoint::capture(id, tick, Some(current_key), is_snapshot, &self.archdatas)?;
        self.chkpts
            .get_mut(&current_key)
            .expect("current checkpoint exists")
            .add_next(id);
        self.chkpts.insert(id, chkpt);
        self.current = Some(id);
        self.num_alive += 1;
        if is_snapshot {
            self.num_alive_snapshots += 1;
        }
        self.total_created += 1;
        debug!(
            "created {} {} at tick {}",
            if is_snapshot { "snapshot" } else { "delta" },
            id,
            tick
        );

        if is_snapshot {
            // A fresh snapshot may release older tombstoned deltas that
            // only existed to feed this branch.
            self.cleanup_chain(id);
        }
        Ok(id)
    }

    /// Loads checkpoint `id`: replays its restore chain onto the archdatas
    /// (snapshot ancestor first, then each delta), makes it current, and
    /// restarts the scheduler at its tick.
    pub fn load(&mut self, id: ChkptId) -> Result<(), CheckpointError> {
        let key = self.live_key(id)?;
        let chain = restore_chain(&self.chkpts, key);
        trace!("loading checkpoint {} via chain {:?}", id, chain);
        for link in chain {
            let archdatas = &self.archdatas;
            self.chkpts
                .get_mut(&link)
                .expect("restore chain members exist")
                .load_state(archdatas)?;
        }

        let old_current = self.current.expect("current always set once a head exists");
        self.current = Some(key);
        if let Some(sched) = &self.scheduler {
            sched.restart_at(self.chkpts[&key].tick());
        }

        // Tombstones between the head and the superseded current may have
        // just lost their last dependant.
        self.cleanup_chain(old_current);
        Ok(())
    }

    /// Tombstones checkpoint `id` and collects whatever the tombstone chain
    /// no longer needs. The head and the current checkpoint cannot be
    /// deleted.
    pub fn delete(&mut self, id: ChkptId) -> Result<(), CheckpointError> {
        let key = self.live_key(id)?;
        if Some(key) == self.head {
            return Err(CheckpointError::CannotDelete { id, what: "head" });
        }
        if Some(key) == self.current {
            return Err(CheckpointError::CannotDelete { id, what: "current" });
        }
        let chkpt = self.chkpts.get_mut(&key).expect("live key exists");
        let was_snapshot = chkpt.is_snapshot();
        chkpt.flag_deleted();
        self.num_dead += 1;
        self.num_alive -= 1;
        if was_snapshot {
            self.num_alive_snapshots -= 1;
        }
        debug!("tombstoned checkpoint {}", id);

        self.cleanup_chain(key);
        Ok(())
    }

    /// Forgets the current checkpoint, resetting it to the head, so the
    /// next checkpoint does not assume state continuity with the last one.
    /// Only for simulators that restore state through some other mechanism.
    pub fn forget_current(&mut self) {
        if self.head.is_some() {
            self.current = self.head;
        }
    }

    /// Whether a live checkpoint with this id exists.
    pub fn has(&self, id: ChkptId) -> bool {
        self.live_key(id).is_ok()
    }

    pub fn head_id(&self) -> Option<ChkptId> {
        self.head
    }

    pub fn current_id(&self) -> Option<ChkptId> {
        self.current
    }

    /// Tick of the current checkpoint; 0 before the head exists.
    pub fn current_tick(&self) -> Tick {
        self.current.map(|key| self.chkpts[&key].tick()).unwrap_or(0)
    }

    /// Live checkpoints taken at tick `t`, on any branch.
    pub fn checkpoints_at(&self, t: Tick) -> Vec<ChkptId> {
        self.chkpts
            .values()
            .filter(|c| !c.is_tombstoned() && c.tick() == t)
            .map(|c| c.id())
            .collect()
    }

    /// All live checkpoint ids, ascending (equivalently, tick-sorted).
    pub fn all_checkpoints(&self) -> Vec<ChkptId> {
        self.chkpts
            .values()
            .filter(|c| !c.is_tombstoned())
            .map(|c| c.id())
            .collect()
    }

    /// Live successors of `id`.
    pub fn next_ids(&self, id: ChkptId) -> Result<Vec<ChkptId>, CheckpointError> {
        let key = self.live_key(id)?;
        Ok(self.chkpts[&key]
            .nexts()
            .iter()
            .filter(|next| !self.chkpts[*next].is_tombstoned())
            .copied()
            .collect())
    }

    /// Nearest live ancestor of `id`, `None` for the head.
    pub fn prev_id(&self, id: ChkptId) -> Result<Option<ChkptId>, CheckpointError> {
        let key = self.live_key(id)?;
        let mut at = self.chkpts[&key].prev();
        while let Some(k) = at {
            let node = &self.chkpts[&k];
            if !node.is_tombstoned() {
                return Ok(Some(node.id()));
            }
            at = node.prev();
        }
        Ok(None)
    }

    /// Ancestry of `id` from the head down, tombstones rendered as
    /// placeholders.
    pub fn chain(&self, id: ChkptId) -> Result<Vec<ChainLink>, CheckpointError> {
        let key = self.live_key(id)?;
        Ok(history_chain(&self.chkpts, key)
            .into_iter()
            .map(|k| {
                let node = &self.chkpts[&k];
                match node.deleted_id() {
                    Some(old) if node.is_tombstoned() => ChainLink::Tombstone(old),
                    _ => ChainLink::Live(node.id()),
                }
            })
            .collect())
    }

    /// The restore chain that loading `id` would replay, oldest first.
    pub fn restore_chain_of(&self, id: ChkptId) -> Result<Vec<ChkptId>, CheckpointError> {
        let key = self.live_key(id)?;
        Ok(restore_chain(&self.chkpts, key))
    }

    /// Latest live checkpoint at or before `tick`, searching backward from
    /// `from`.
    pub fn find_latest_at_or_before(
        &self,
        tick: Tick,
        from: ChkptId,
    ) -> Result<Option<ChkptId>, CheckpointError> {
        let key = self.live_key(from)?;
        let mut at = Some(key);
        while let Some(k) = at {
            let node = &self.chkpts[&k];
            if node.tick() <= tick && !node.is_tombstoned() {
                return Ok(Some(node.id()));
            }
            at = node.prev();
        }
        Ok(None)
    }

    /// Checkpoints between `id` and its nearest earlier snapshot: 0 when
    /// `id` is itself a snapshot.
    pub fn distance_to_prev_snapshot(&self, id: ChkptId) -> Result<u32, CheckpointError> {
        let key = self.live_key(id)?;
        Ok(self.distance_to_prev_snapshot_key(key))
    }

    /// Read access to a live checkpoint.
    pub fn checkpoint(&self, id: ChkptId) -> Result<&Checkpoint, CheckpointError> {
        let key = self.live_key(id)?;
        Ok(&self.chkpts[&key])
    }

    /// Live checkpoints with valid ids.
    pub fn num_checkpoints(&self) -> u32 {
        self.num_alive
    }

    pub fn num_snapshots(&self) -> u32 {
        self.num_alive_snapshots
    }

    pub fn num_deltas(&self) -> u32 {
        self.num_alive - self.num_alive_snapshots
    }

    /// Tombstoned checkpoints still held for chain integrity.
    pub fn num_dead_checkpoints(&self) -> u32 {
        self.num_dead
    }

    /// Checkpoints ever created, head included. Monotonic.
    pub fn total_checkpoints_created(&self) -> u64 {
        self.total_created
    }

    /// Bytes held for checkpoint line content across the whole tree,
    /// tombstones included.
    pub fn content_memory_use(&self) -> u64 {
        self.chkpts.values().map(|c| c.content_bytes()).sum()
    }

    /// Debugging utility: follows the traced bytes through every ancestor
    /// of `id`, oldest first, showing the value each chain member would
    /// leave behind on a restore. `archdata_index` selects the region
    /// within the enumerated archdata set; the span must sit in one line.
    pub fn trace_value(
        &self,
        id: ChkptId,
        archdata_index: usize,
        offset: Offset,
        size: u32,
    ) -> Result<Vec<TraceStep>, CheckpointError> {
        let key = self.live_key(id)?;
        let line_sizes: Vec<usize> = self
            .archdatas
            .iter()
            .map(|archdata| {
                let guard = archdata.read();
                if guard.line_size() == 0 {
                    guard.size() as usize
                } else {
                    guard.line_size() as usize
                }
            })
            .collect();
        let line_size = *line_sizes
            .get(archdata_index)
            .expect("archdata index within the enumerated set");

        let mut steps = Vec::new();
        let mut bytes: Vec<Option<u8>> = vec![None; size as usize];
        for member in history_chain(&self.chkpts, key) {
            let node = &self.chkpts[&member];
            if node.is_snapshot() {
                // A snapshot restore clears everything first.
                bytes.fill(None);
            }
            let mut changed = false;
            let mut payload: VectorStorage = node.payload().clone();
            payload.prepare_for_load();
            for (section, &section_line_size) in line_sizes.iter().enumerate() {
                let mut buf = vec![0u8; section_line_size];
                while let Some(idx) = payload.next_restore_line()? {
                    payload.copy_line_bytes(&mut buf)?;
                    if section != archdata_index {
                        continue;
                    }
                    let line_offset = idx * line_size as Offset;
                    let span_end = line_offset + line_size as Offset;
                    if offset >= line_offset && offset + Offset::from(size) <= span_end {
                        let at = (offset - line_offset) as usize;
                        for (i, byte) in bytes.iter_mut().enumerate() {
                            *byte = Some(buf[at + i]);
                        }
                        changed = true;
                    }
                }
            }
            steps.push(TraceStep {
                link: match node.deleted_id() {
                    Some(old) if node.is_tombstoned() => ChainLink::Tombstone(old),
                    _ => ChainLink::Live(node.id()),
                },
                is_snapshot: node.is_snapshot(),
                changed,
                bytes: bytes.clone(),
            });
        }
        Ok(steps)
    }

    /// Renders the checkpoint tree, one line per branch, the current
    /// checkpoint boxed and snapshots flagged `(s)`.
    pub fn dump_tree(&self) -> String {
        let mut out = String::new();
        if let Some(head) = self.head {
            let mut continues = Vec::new();
            self.dump_branch(head, 0, 0, &mut continues, &mut out);
        }
        out.push('\n');
        out
    }

    fn dump_branch(
        &self,
        key: ChkptId,
        indent: usize,
        pos: usize,
        continues: &mut Vec<usize>,
        out: &mut String,
    ) {
        for column in pos..indent {
            if continues.contains(&column) {
                out.push('|');
            } else {
                out.push(' ');
            }
        }

        let node = &self.chkpts[&key];
        let mut cell = String::new();
        if continues.contains(&indent) && indent != pos {
            cell.push_str("`> ");
        } else {
            cell.push_str("-> ");
        }
        let boxed = self.current == Some(key);
        if boxed {
            cell.push_str("[ ");
        }
        let _ = write!(cell, "{}", node.deleted_repr());
        if node.is_snapshot() {
            cell.push_str(" (s)");
        }
        cell.push(' ');
        if boxed {
            cell.push(']');
        }
        out.push_str(&cell);
        let column = indent + cell.len();

        let nexts = node.nexts().to_vec();
        if let Some((&first, rest)) = nexts.split_first() {
            if !rest.is_empty() {
                continues.push(column);
            }
            self.dump_branch(first, column, column, continues, out);
            for (i, &next) in rest.iter().enumerate() {
                if i + 1 == rest.len() {
                    continues.pop();
                }
                out.push('\n');
                self.dump_branch(next, column, 0, continues, out);
            }
        }
    }

    fn allocate_id(&mut self) -> Result<ChkptId, CheckpointError> {
        if self.next_id == UNIDENTIFIED {
            return Err(CheckpointError::IdExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Resolves a public id to its arena key, refusing tombstones.
    fn live_key(&self, id: ChkptId) -> Result<ChkptId, CheckpointError> {
        match self.chkpts.get(&id) {
            Some(chkpt) if !chkpt.is_tombstoned() => Ok(id),
            _ => Err(CheckpointError::UnknownCheckpoint(id)),
        }
    }

    fn distance_to_prev_snapshot_key(&self, key: ChkptId) -> u32 {
        let mut dist = 0;
        let mut at = key;
        loop {
            let node = &self.chkpts[&at];
            if node.is_snapshot() {
                return dist;
            }
            dist += 1;
            at = node
                .prev()
                .expect("every chain is rooted in a snapshot head");
        }
    }

    /// Whether any live checkpoint (or the current one) depends on the
    /// delta data of `key`. Each branch of the search ends at a snapshot,
    /// which restores from its own data.
    fn forward_find_alive(&self, key: ChkptId) -> bool {
        for &next in self.chkpts[&key].nexts() {
            let node = &self.chkpts[&next];
            if node.is_snapshot() {
                continue;
            }
            if Some(next) == self.current {
                return true;
            }
            if !node.is_tombstoned() {
                return true;
            }
            if self.forward_find_alive(next) {
                return true;
            }
        }
        false
    }

    /// Whether `key` is tombstoned and no chain through its successors
    /// still needs its data.
    fn can_delete(&self, key: ChkptId) -> bool {
        let node = &self.chkpts[&key];
        if !node.is_tombstoned() {
            return false;
        }
        node.nexts()
            .iter()
            .all(|&next| self.chkpts[&next].is_snapshot() || self.can_delete(next))
    }

    /// Physically frees tombstones along the chain ending at `start`.
    ///
    /// This is the only place checkpoints are freed; every other delete is
    /// a tombstone flag. Walks backward from `start` toward the head,
    /// removing each tombstone that no live descendant depends on and
    /// re-linking the tree around it. Stops at the head, the current
    /// checkpoint, or the first live node.
    fn cleanup_chain(&mut self, start: ChkptId) {
        if Some(start) == self.head || !self.chkpts.contains_key(&start) {
            return;
        }

        let mut at = start;
        let needed_later = Some(at) == self.current || self.forward_find_alive(at);
        if needed_later {
            if self.chkpts[&at].is_snapshot() {
                // A snapshot needed as a restore root for later deltas can
                // never be freed here; try its ancestors instead.
                match self.chkpts[&at].prev() {
                    Some(prev) => at = prev,
                    None => return,
                }
            } else {
                // A needed delta implies every preceding delta is needed.
                return;
            }
        }

        loop {
            if Some(at) == self.head {
                return;
            }
            let Some(node) = self.chkpts.get(&at) else {
                return;
            };
            if !node.is_tombstoned() {
                return;
            }
            if Some(at) == self.current {
                // Current may sit on a tombstone after a branch was
                // abandoned; it pins the chain until it moves.
                return;
            }
            let prev = node.prev();
            if self.can_delete(at) {
                self.free(at);
            }
            match prev {
                Some(p) => at = p,
                None => return,
            }
        }
    }

    fn free(&mut self, key: ChkptId) {
        let node = self.chkpts.remove(&key).expect("freeing an existing node");
        trace!(
            "freed checkpoint {} (was id {:?})",
            key,
            node.deleted_id()
        );
        if let Some(prev) = node.prev() {
            if let Some(prev_node) = self.chkpts.get_mut(&prev) {
                prev_node.remove_next(key);
            }
        }
        // Splice the orphaned successors onto the predecessor.
        for &next in node.nexts() {
            if let Some(next_node) = self.chkpts.get_mut(&next) {
                next_node.set_prev(node.prev());
            }
            if let Some(prev) = node.prev() {
                if let Some(prev_node) = self.chkpts.get_mut(&prev) {
                    prev_node.add_next(next);
                }
            }
        }
        self.num_dead -= 1;
    }
}
