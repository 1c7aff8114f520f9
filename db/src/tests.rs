use crate::{DbCheckpointer, DbCheckpointerOptions, DbError};
use parking_lot::RwLock;
use rewind_archdata::ArchData;
use rewind_checkpoint::{ChainLink, Scheduler, SharedArchData, SimNode, Tick};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct TestNode {
    archdatas: Vec<SharedArchData>,
}

impl SimNode for TestNode {
    fn location(&self) -> String {
        "top.core0".to_string()
    }

    fn is_finalized(&self) -> bool {
        true
    }

    fn associated_archdatas(&self) -> Vec<SharedArchData> {
        self.archdatas.clone()
    }

    fn children(&self) -> Vec<&dyn SimNode> {
        Vec::new()
    }
}

#[derive(Default)]
struct TestScheduler {
    tick: AtomicU64,
}

impl Scheduler for TestScheduler {
    fn current_tick(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    fn restart_at(&self, tick: Tick) {
        self.tick.store(tick, Ordering::SeqCst);
    }
}

struct Fixture {
    archdata: SharedArchData,
    sched: Arc<TestScheduler>,
    cp: DbCheckpointer,
    _dir: tempfile::TempDir,
}

fn fixture(flush_interval: Duration) -> Fixture {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    let mut region = ArchData::new(64, 0xcc, 1, true).unwrap();
    region.layout_range(4096).unwrap();
    let archdata: SharedArchData = Arc::new(RwLock::new(region));
    let node: Arc<dyn SimNode> = Arc::new(TestNode {
        archdatas: vec![archdata.clone()],
    });
    let sched = Arc::new(TestScheduler::default());
    let mut options = DbCheckpointerOptions::new(dir.path().join("chkpts.db"));
    options.flush_interval = flush_interval;
    let mut cp = DbCheckpointer::open(options, vec![node], Some(sched.clone())).unwrap();
    cp.set_snapshot_threshold(3);
    Fixture {
        archdata,
        sched,
        cp,
        _dir: dir,
    }
}

/// Head plus ten checkpoints, writing byte `k` at offset `k * 8` before
/// checkpoint `k`, each at tick `k * 10`.
fn build_history(fx: &mut Fixture) {
    fx.cp.create_head().unwrap();
    for k in 1u64..=10 {
        fx.archdata
            .write()
            .write_bytes_at(k * 8, &[k as u8])
            .unwrap();
        fx.sched.tick.store(k * 10, Ordering::SeqCst);
        fx.cp.create_checkpoint(false).unwrap();
    }
}

fn wait_for_flush() {
    thread::sleep(Duration::from_millis(300));
}

#[test]
fn closed_windows_are_persisted_and_evicted() {
    let mut fx = fixture(Duration::from_millis(5));
    build_history(&mut fx);
    wait_for_flush();

    // Windows [0,1,2] and [3,4,5] are durable; their deltas left the
    // cache. The head stays pinned.
    let cached = fx.cp.cached_checkpoints();
    assert!(cached.contains(&0));
    for id in 1..=5 {
        assert!(!cached.contains(&id), "id {} should be evicted", id);
        assert!(fx.cp.has(id).unwrap(), "id {} should be in the database", id);
    }
    for id in 6..=10 {
        assert!(cached.contains(&id), "id {} should stay cached", id);
    }

    assert_eq!(fx.cp.all_checkpoints().unwrap(), (0..=10).collect::<Vec<_>>());
    assert_eq!(fx.cp.checkpoints_at(40).unwrap(), vec![4]);
    assert_eq!(fx.cp.num_checkpoints(), 11);
}

#[test]
fn loading_an_evicted_checkpoint_rehydrates_and_truncates() {
    let mut fx = fixture(Duration::from_millis(5));
    build_history(&mut fx);
    wait_for_flush();

    fx.cp.load(4).unwrap();
    assert_eq!(fx.cp.current_id(), Some(4));
    assert_eq!(fx.sched.current_tick(), 40);

    // State is exactly what checkpoint 4 captured.
    let mut buf = [0u8; 1];
    for k in 1u64..=4 {
        fx.archdata.write().read_bytes_at(k * 8, &mut buf).unwrap();
        assert_eq!(buf, [k as u8]);
    }
    for k in 5u64..=10 {
        fx.archdata.write().read_bytes_at(k * 8, &mut buf).unwrap();
        assert_eq!(buf, [0xcc], "offset {} should be back at the fill", k * 8);
    }

    // Everything newer was truncated, in memory and on disk.
    assert_eq!(fx.cp.all_checkpoints().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(!fx.cp.has(5).unwrap());
    assert_eq!(fx.cp.next_ids(4).unwrap(), Vec::<u64>::new());

    // History continues from the rollback point; the reopened stream
    // starts a fresh window with a snapshot.
    fx.sched.tick.store(41, Ordering::SeqCst);
    let id = fx.cp.create_checkpoint(false).unwrap();
    assert_eq!(id, 5);
    assert_eq!(fx.cp.all_checkpoints().unwrap(), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn queries_span_cache_and_database() {
    let mut fx = fixture(Duration::from_millis(5));
    build_history(&mut fx);
    wait_for_flush();

    let chain = fx.cp.chain(10).unwrap();
    assert_eq!(chain.len(), 11);
    assert_eq!(chain[0], ChainLink::Live(0));
    assert_eq!(chain[10], ChainLink::Live(10));

    // Snapshots land at 0, 3, 6, 9 with threshold 3.
    assert_eq!(fx.cp.distance_to_prev_snapshot(5).unwrap(), 2);
    assert_eq!(fx.cp.distance_to_prev_snapshot(9).unwrap(), 0);
    assert_eq!(fx.cp.prev_id(6).unwrap(), Some(5));
    assert_eq!(fx.cp.next_ids(5).unwrap(), vec![6]);
    assert_eq!(fx.cp.find_latest_at_or_before(45, 10).unwrap(), Some(4));
}

#[test]
fn delete_is_not_supported() {
    let mut fx = fixture(Duration::from_millis(50));
    fx.cp.create_head().unwrap();
    assert!(matches!(fx.cp.delete(0), Err(DbError::DeleteUnsupported)));
}

#[test]
fn shutdown_flushes_pending_windows() {
    let dir = tempfile::Builder::new().tempdir().unwrap();
    let db_path = dir.path().join("chkpts.db");
    {
        let mut region = ArchData::new(64, 0xcc, 1, true).unwrap();
        region.layout_range(256).unwrap();
        let archdata: SharedArchData = Arc::new(RwLock::new(region));
        let node: Arc<dyn SimNode> = Arc::new(TestNode {
            archdatas: vec![archdata.clone()],
        });
        // A long flush interval: nothing persists until shutdown.
        let mut options = DbCheckpointerOptions::new(&db_path);
        options.flush_interval = Duration::from_secs(60);
        let mut cp = DbCheckpointer::open(options, vec![node], None).unwrap();
        cp.set_snapshot_threshold(3);
        cp.create_head().unwrap();
        for _ in 0..3 {
            archdata.write().write_bytes_at(0, &[1]).unwrap();
            cp.create_checkpoint(false).unwrap();
        }
        cp.close();
    }

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    let windows: i64 = conn
        .query_row("SELECT COUNT(*) FROM window_bytes", [], |row| row.get(0))
        .unwrap();
    let ids: i64 = conn
        .query_row("SELECT COUNT(*) FROM window_ids", [], |row| row.get(0))
        .unwrap();
    assert_eq!(windows, 2);
    assert_eq!(ids, 4);
}

#[test]
fn current_checkpoint_is_never_evicted() {
    let mut fx = fixture(Duration::from_millis(5));
    fx.cp.create_head().unwrap();
    // Force snapshots so every checkpoint closes its own window; the
    // current one must survive eviction anyway.
    for _ in 0..6 {
        fx.cp.create_checkpoint(true).unwrap();
    }
    wait_for_flush();
    let cached = fx.cp.cached_checkpoints();
    assert!(cached.contains(&0));
    assert!(cached.contains(&fx.cp.current_id().unwrap()));
}
