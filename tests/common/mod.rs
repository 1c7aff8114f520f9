use parking_lot::RwLock;
use rewind::checkpoint::{Scheduler, SharedArchData, SimNode, Tick};
use rewind_archdata::ArchData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct TestNode {
    pub location: String,
    pub archdatas: Vec<SharedArchData>,
    pub children: Vec<TestNode>,
}

impl SimNode for TestNode {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn is_finalized(&self) -> bool {
        true
    }

    fn associated_archdatas(&self) -> Vec<SharedArchData> {
        self.archdatas.clone()
    }

    fn children(&self) -> Vec<&dyn SimNode> {
        self.children.iter().map(|c| c as &dyn SimNode).collect()
    }
}

#[derive(Default)]
pub struct TestScheduler {
    tick: AtomicU64,
}

impl TestScheduler {
    pub fn advance_to(&self, tick: Tick) {
        self.tick.store(tick, Ordering::SeqCst);
    }
}

impl Scheduler for TestScheduler {
    fn current_tick(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    fn restart_at(&self, tick: Tick) {
        self.tick.store(tick, Ordering::SeqCst);
    }
}

/// A 4 KiB region with 64-byte lines and the default 0xcc fill.
pub fn shared_region() -> SharedArchData {
    let mut region = ArchData::new(64, 0xcc, 1, true).unwrap();
    region.layout_range(4096).unwrap();
    Arc::new(RwLock::new(region))
}

pub fn write(archdata: &SharedArchData, offset: u64, bytes: &[u8]) {
    archdata.write().write_bytes_at(offset, bytes).unwrap();
}

pub fn read(archdata: &SharedArchData, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    archdata.write().read_bytes_at(offset, &mut buf).unwrap();
    buf
}
