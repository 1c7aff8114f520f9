use crate::{Interval, IntervalSkipList};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

fn collect(isl: &IntervalSkipList<u64>, q: u64) -> Vec<usize> {
    let mut out = Vec::new();
    isl.find_intervals(q, &mut out);
    out.sort_unstable();
    out
}

#[test]
fn stabbing_basics() {
    let mut isl = IntervalSkipList::with_rng_seed(7);
    isl.insert(0, Interval::new(0, 5));
    isl.insert(1, Interval::new(3, 10));
    isl.insert(2, Interval::new(8, 12));

    assert_eq!(collect(&isl, 4), vec![0, 1]);
    assert_eq!(collect(&isl, 10), vec![2]);
    assert_eq!(collect(&isl, 12), Vec::<usize>::new());
    assert_eq!(collect(&isl, 0), vec![0]);
    assert_eq!(collect(&isl, 5), vec![1]);
    assert_eq!(collect(&isl, 100), Vec::<usize>::new());
}

#[test]
fn out_of_range_queries_are_empty_not_errors() {
    let mut isl = IntervalSkipList::with_rng_seed(3);
    isl.insert(9, Interval::new(50, 60));
    assert_eq!(collect(&isl, 0), Vec::<usize>::new());
    assert_eq!(collect(&isl, 49), Vec::<usize>::new());
    assert_eq!(collect(&isl, 60), Vec::<usize>::new());
    assert_eq!(collect(&isl, u64::MAX), Vec::<usize>::new());
}

#[test]
fn shared_endpoints_are_reference_counted() {
    let mut isl = IntervalSkipList::with_rng_seed(11);
    isl.insert(0, Interval::new(5, 10));
    isl.insert(1, Interval::new(5, 10));
    isl.insert(2, Interval::new(10, 15));

    assert_eq!(collect(&isl, 7), vec![0, 1]);
    isl.remove(0);
    assert_eq!(collect(&isl, 7), vec![1]);
    assert_eq!(collect(&isl, 12), vec![2]);
    isl.remove(1);
    isl.remove(2);
    assert!(isl.is_empty());
}

#[test]
fn empty_interval_is_tolerated() {
    let mut isl = IntervalSkipList::with_rng_seed(5);
    isl.insert(0, Interval::new(4, 4));
    assert_eq!(collect(&isl, 4), Vec::<usize>::new());
    isl.remove(0);
    assert!(isl.is_empty());
}

#[test]
#[should_panic(expected = "not in the index")]
fn removing_an_unknown_interval_is_fatal() {
    let mut isl: IntervalSkipList<u64> = IntervalSkipList::with_rng_seed(1);
    isl.insert(0, Interval::new(1, 2));
    isl.remove(42);
}

#[test]
#[should_panic(expected = "inserted twice")]
fn reusing_a_live_handle_is_fatal() {
    let mut isl: IntervalSkipList<u64> = IntervalSkipList::with_rng_seed(1);
    isl.insert(0, Interval::new(1, 2));
    isl.insert(0, Interval::new(3, 4));
}

#[test]
fn insert_then_remove_restores_the_structure() {
    let mut isl = IntervalSkipList::with_rng_seed(23);
    isl.insert(0, Interval::new(2, 20));
    isl.insert(1, Interval::new(5, 9));
    isl.insert(2, Interval::new(12, 30));

    let before = isl.fingerprint();
    isl.insert(3, Interval::new(4, 25));
    isl.remove(3);
    assert_eq!(isl.fingerprint(), before);

    // Same check when the inserted interval shares endpoints.
    let before = isl.fingerprint();
    isl.insert(4, Interval::new(5, 20));
    isl.remove(4);
    assert_eq!(isl.fingerprint(), before);
}

/// Randomized insert/remove/query fuzzing against a brute-force oracle.
/// Seeds are fixed so failures reproduce.
#[test]
fn fuzz_against_brute_force_oracle() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut isl = IntervalSkipList::with_rng_seed(seed ^ 0xdead_beef);
        let mut oracle: HashMap<usize, Interval<u64>> = HashMap::new();
        let mut next_handle = 0usize;

        for step in 0..400 {
            let remove = !oracle.is_empty() && rng.gen_bool(0.45);
            if remove {
                let victim = *oracle
                    .keys()
                    .nth(rng.gen_range(0..oracle.len()))
                    .expect("oracle not empty");
                let removed = isl.remove(victim);
                let expected = oracle.remove(&victim).expect("victim tracked");
                assert_eq!(removed, expected);
            } else {
                let left = rng.gen_range(0..60u64);
                let right = left + rng.gen_range(0..25u64);
                isl.insert(next_handle, Interval::new(left, right));
                oracle.insert(next_handle, Interval::new(left, right));
                next_handle += 1;
            }

            // Exhaustive stabbing check over the key space.
            for q in 0..90u64 {
                let got = collect(&isl, q);
                let mut want: Vec<usize> = oracle
                    .iter()
                    .filter(|(_, iv)| iv.contains(q))
                    .map(|(&h, _)| h)
                    .collect();
                want.sort_unstable();
                assert_eq!(
                    got, want,
                    "seed {} step {} query {} diverged from oracle",
                    seed, step, q
                );
            }
        }

        // Drain everything; the list must come back empty.
        let handles: Vec<usize> = oracle.keys().copied().collect();
        for h in handles {
            isl.remove(h);
        }
        assert!(isl.is_empty());
        for q in 0..90u64 {
            assert_eq!(collect(&isl, q), Vec::<usize>::new());
        }
    }
}

#[test]
fn dense_overlaps_stay_exact() {
    let mut isl = IntervalSkipList::with_rng_seed(77);
    // Nested intervals sharing a midpoint.
    for i in 0..20u64 {
        isl.insert(i as usize, Interval::new(50 - i, 50 + i + 1));
    }
    let all: Vec<usize> = (0..20).collect();
    assert_eq!(collect(&isl, 50), all);
    // Key 40 is covered by intervals with i >= 10.
    assert_eq!(collect(&isl, 40), (10..20).collect::<Vec<_>>());

    // Remove the widest and narrowest, re-check.
    isl.remove(19);
    isl.remove(0);
    assert_eq!(collect(&isl, 50), (1..19).collect::<Vec<_>>());
    assert_eq!(collect(&isl, 40), (10..19).collect::<Vec<_>>());
}
