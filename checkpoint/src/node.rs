use crate::error::CheckpointError;
use crate::Tick;
use parking_lot::RwLock;
use rewind_archdata::ArchData;
use std::collections::HashMap;
use std::sync::Arc;

/// An archdata region shared between the simulator model and the
/// checkpointer.
pub type SharedArchData = Arc<RwLock<ArchData>>;

/// One node of the simulator's tree-of-nodes façade. The checkpointer only
/// needs the archdatas hanging off each node and the child edges; it walks
/// the tree exactly once, at head creation.
pub trait SimNode {
    /// Dotted path of this node, used in diagnostics.
    fn location(&self) -> String;

    /// Whether the subtree is finalized and its archdatas laid out.
    fn is_finalized(&self) -> bool;

    /// Archdata regions owned directly by this node.
    fn associated_archdatas(&self) -> Vec<SharedArchData>;

    fn children(&self) -> Vec<&dyn SimNode>;
}

/// Tick source restored on checkpoint load. When absent the checkpointer
/// pins every checkpoint at tick 0 and leaves scheduling alone.
pub trait Scheduler {
    fn current_tick(&self) -> Tick;
    fn restart_at(&self, tick: Tick);
}

/// Enumerates every archdata reachable from `roots`, in traversal order.
///
/// The same archdata reachable through two different nodes is a wiring
/// error in the simulator tree and is rejected.
pub fn collect_archdatas(
    roots: &[Arc<dyn SimNode>],
) -> Result<Vec<SharedArchData>, CheckpointError> {
    let mut found: Vec<SharedArchData> = Vec::new();
    let mut owners: HashMap<*const RwLock<ArchData>, String> = HashMap::new();
    for root in roots {
        collect_from(root.as_ref(), &mut found, &mut owners)?;
    }
    Ok(found)
}

fn collect_from(
    node: &dyn SimNode,
    found: &mut Vec<SharedArchData>,
    owners: &mut HashMap<*const RwLock<ArchData>, String>,
) -> Result<(), CheckpointError> {
    for archdata in node.associated_archdatas() {
        let key = Arc::as_ptr(&archdata);
        if let Some(first) = owners.get(&key) {
            return Err(CheckpointError::DuplicateArchData {
                first: first.clone(),
                second: node.location(),
            });
        }
        owners.insert(key, node.location());
        found.push(archdata);
    }
    for child in node.children() {
        collect_from(child, found, owners)?;
    }
    Ok(())
}
