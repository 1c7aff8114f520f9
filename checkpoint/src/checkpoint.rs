use crate::error::CheckpointError;
use crate::node::SharedArchData;
use crate::{ChkptId, Tick, UNIDENTIFIED};
use rewind_archdata::storage::{LineSource, VectorStorage};
use std::fmt;

/// One node of the checkpoint tree.
///
/// The tree is an arena keyed by creation id; `prev` and `nexts` hold arena
/// keys, never pointers, so tombstoning is a flag flip and physical freeing
/// is a map removal. A tombstoned checkpoint keeps its payload (a live
/// delta may still restore through it) and remembers its pre-deletion id
/// for diagnostics.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    id: ChkptId,
    deleted_id: Option<ChkptId>,
    tick: Tick,
    is_snapshot: bool,
    prev: Option<ChkptId>,
    nexts: Vec<ChkptId>,
    payload: VectorStorage,
}

impl Checkpoint {
    /// Captures the state of `archdatas` into a new checkpoint: all
    /// allocated lines for a snapshot, dirty lines only for a delta.
    pub fn capture(
        id: ChkptId,
        tick: Tick,
        prev: Option<ChkptId>,
        is_snapshot: bool,
        archdatas: &[SharedArchData],
    ) -> Result<Checkpoint, CheckpointError> {
        let mut payload = VectorStorage::new();
        for archdata in archdatas {
            let mut guard = archdata.write();
            if is_snapshot {
                guard.save_all(&mut payload)?;
            } else {
                guard.save(&mut payload)?;
            }
        }
        Ok(Checkpoint {
            id,
            deleted_id: None,
            tick,
            is_snapshot,
            prev,
            nexts: Vec::new(),
            payload,
        })
    }

    /// Reassembles a checkpoint from previously stored fields. Used by the
    /// database overlay when rehydrating persisted windows.
    pub fn rebuild(
        id: ChkptId,
        deleted_id: Option<ChkptId>,
        tick: Tick,
        is_snapshot: bool,
        prev: Option<ChkptId>,
        nexts: Vec<ChkptId>,
        payload: VectorStorage,
    ) -> Checkpoint {
        Checkpoint {
            id,
            deleted_id,
            tick,
            is_snapshot,
            prev,
            nexts,
            payload,
        }
    }

    /// Current id; [`UNIDENTIFIED`] once tombstoned.
    pub fn id(&self) -> ChkptId {
        self.id
    }

    /// Pre-deletion id of a tombstone, `None` while live.
    pub fn deleted_id(&self) -> Option<ChkptId> {
        self.deleted_id
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    pub fn is_tombstoned(&self) -> bool {
        self.id == UNIDENTIFIED
    }

    /// Arena key of the predecessor. `None` only for the head.
    pub fn prev(&self) -> Option<ChkptId> {
        self.prev
    }

    /// Re-points the predecessor link. Tree surgery belongs to the owning
    /// checkpointer.
    pub fn set_prev(&mut self, prev: Option<ChkptId>) {
        self.prev = prev;
    }

    /// Arena keys of the successors, in creation order.
    pub fn nexts(&self) -> &[ChkptId] {
        &self.nexts
    }

    /// Appends a successor link. Tree surgery belongs to the owning
    /// checkpointer.
    pub fn add_next(&mut self, key: ChkptId) {
        debug_assert!(!self.nexts.contains(&key));
        self.nexts.push(key);
    }

    /// Drops a successor link.
    pub fn remove_next(&mut self, key: ChkptId) {
        self.nexts.retain(|&n| n != key);
    }

    /// Flags this checkpoint deleted: the id becomes [`UNIDENTIFIED`] and
    /// the old id is kept for chain rendering. Flagging twice is a logic
    /// error.
    pub(crate) fn flag_deleted(&mut self) {
        debug_assert!(!self.is_tombstoned());
        self.deleted_id = Some(self.id);
        self.id = UNIDENTIFIED;
    }

    pub fn payload(&self) -> &VectorStorage {
        &self.payload
    }

    /// Bytes held for line content.
    pub fn content_bytes(&self) -> u64 {
        self.payload.content_bytes()
    }

    /// Applies this checkpoint's stored lines to `archdatas`: a snapshot
    /// clears each region first, a delta overlays the current state. Only
    /// touches this checkpoint; walking the restore chain is the caller's
    /// job.
    pub fn load_state(&mut self, archdatas: &[SharedArchData]) -> Result<(), CheckpointError> {
        self.payload.prepare_for_load();
        for archdata in archdatas {
            let mut guard = archdata.write();
            if self.is_snapshot {
                guard.restore_all(&mut self.payload)?;
            } else {
                guard.restore(&mut self.payload)?;
            }
        }
        Ok(())
    }

    /// Chain rendering: the id, or `*old_id` for a tombstone.
    pub fn deleted_repr(&self) -> String {
        match self.deleted_id {
            Some(old) if self.is_tombstoned() => format!("*{}", old),
            _ => format!("{}", self.id),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Checkpoint id={}", self.deleted_repr())?;
        write!(f, " at t={}", self.tick)?;
        if self.is_snapshot {
            write!(f, " (snapshot)")?;
        }
        write!(f, " {} B>", self.content_bytes())
    }
}

/// One element of a head-to-target chain rendering. Tombstones stay
/// visible so gaps in a chain can be diagnosed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainLink {
    Live(ChkptId),
    /// Pre-deletion id of a tombstoned chain member.
    Tombstone(ChkptId),
}

impl fmt::Display for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainLink::Live(id) => write!(f, "{}", id),
            ChainLink::Tombstone(id) => write!(f, "*{}", id),
        }
    }
}
