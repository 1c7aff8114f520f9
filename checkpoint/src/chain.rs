use crate::checkpoint::Checkpoint;
use crate::ChkptId;
use std::collections::BTreeMap;

/// The restore chain of `key`: the nearest snapshot ancestor (or `key`
/// itself when it is a snapshot) followed by the deltas down to `key`, in
/// the order they must be replayed.
pub fn restore_chain(chkpts: &BTreeMap<ChkptId, Checkpoint>, key: ChkptId) -> Vec<ChkptId> {
    let mut chain = Vec::new();
    let mut at = key;
    loop {
        chain.push(at);
        let node = &chkpts[&at];
        if node.is_snapshot() {
            break;
        }
        at = node
            .prev()
            .expect("a delta checkpoint always has a predecessor");
    }
    chain.reverse();
    chain
}

/// The full ancestry of `key` back to the head, oldest first. A superset of
/// the restore chain, used for diagnostics and value tracing.
pub fn history_chain(chkpts: &BTreeMap<ChkptId, Checkpoint>, key: ChkptId) -> Vec<ChkptId> {
    let mut chain = Vec::new();
    let mut at = Some(key);
    while let Some(k) = at {
        chain.push(k);
        at = chkpts[&k].prev();
    }
    chain.reverse();
    chain
}
