//! Facade-level smoke test for the event interval store: skip list plus
//! windowed queries against a synthetic record stream.

use rewind::interval::{Interval, IntervalSkipList};
use rewind::window::{
    IntervalWindowService, RecordReader, TransactionInterval, WindowConfig,
};
use std::time::Duration;

struct Bursts;

impl RecordReader for Bursts {
    fn cycle_first(&self) -> u64 {
        0
    }

    fn cycle_last(&self) -> u64 {
        10_000
    }

    fn replay_ending_in(&mut self, lo: u64, hi: u64, emit: &mut dyn FnMut(TransactionInterval)) {
        // One transaction ending on every multiple of 10, lasting 30 ticks.
        let mut end = (lo / 10) * 10;
        while end <= lo {
            end += 10;
        }
        while end <= hi && end <= 10_000 {
            emit(TransactionInterval {
                start: end - 30,
                end,
                transaction_id: end / 10,
                parent_id: 0,
                display_id: 0,
                location_id: 1,
                flags: 0x3,
            });
            end += 10;
        }
    }
}

#[test]
fn skip_list_and_window_agree() {
    let config = WindowConfig {
        offset_left: 200,
        offset_right: 200,
        load_left: 150,
        load_right: 150,
        long_event_check: 50,
        poll_interval: Duration::from_millis(1),
    };
    let (window, mut stop) = IntervalWindowService::new(Bursts, config).start();

    let mut hits = Vec::new();
    window.stabbing_query(5_000, &mut hits);

    // Brute-force the same answer through a plain skip list.
    let mut isl = IntervalSkipList::with_rng_seed(1);
    let mut reader = Bursts;
    let mut n = 0usize;
    let mut expected = 0usize;
    reader.replay_ending_in(4_800, 5_200, &mut |record| {
        if record.contains(5_000) {
            expected += 1;
        }
        isl.insert(n, Interval::new(record.start, record.end));
        n += 1;
    });
    let mut handles = Vec::new();
    isl.find_intervals(5_000, &mut handles);

    assert_eq!(hits.len(), expected);
    assert_eq!(handles.len(), expected);
    for hit in &hits {
        assert!(hit.contains(5_000));
    }
    stop.stop(());
}
