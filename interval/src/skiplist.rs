use crate::interval::Interval;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use std::collections::HashMap;

/// Maximum number of forward-pointer levels.
pub const MAX_FORWARD: usize = 48;

/// Promotion probability for the geometric level distribution.
const P: f64 = 0.5;

/// Caller-chosen identifier of an inserted interval.
pub type IntervalHandle = usize;

/// One endpoint node. `forward`, `markers` and the node itself are owned by
/// the list; marker sets hold interval handles, not interval data.
struct Node<K> {
    key: K,
    forward: Vec<Option<usize>>,
    markers: Vec<Vec<IntervalHandle>>,
    eq_markers: Vec<IntervalHandle>,
    owner_count: u32,
}

impl<K> Node<K> {
    fn new(key: K, levels: usize) -> Node<K> {
        Node {
            key,
            forward: vec![None; levels + 1],
            markers: vec![Vec::new(); levels + 1],
            eq_markers: Vec::new(),
            owner_count: 0,
        }
    }

    fn top(&self) -> usize {
        self.forward.len() - 1
    }
}

/// Probabilistic skip list over interval endpoints with level-wise edge
/// markers.
///
/// The marker invariant: for every inserted interval `I` and every query
/// key `q` with `I.contains(q)`, the top-down stabbing search encounters
/// `I` on exactly the edges and nodes it traverses, and never through a
/// marker on an edge whose key span `I` does not contain. Inserting or
/// removing an endpoint node re-establishes the invariant by promoting or
/// demoting markers across the affected levels.
pub struct IntervalSkipList<K> {
    nodes: Slab<Node<K>>,
    header: usize,
    max_level: usize,
    intervals: HashMap<IntervalHandle, Interval<K>>,
    rng: StdRng,
}

impl<K: Copy + Ord + Default> Default for IntervalSkipList<K> {
    fn default() -> IntervalSkipList<K> {
        IntervalSkipList::new()
    }
}

impl<K: Copy + Ord + Default> IntervalSkipList<K> {
    pub fn new() -> IntervalSkipList<K> {
        Self::with_rng_seed(rand::thread_rng().gen())
    }

    /// Deterministic level generation, for reproducible tests.
    pub fn with_rng_seed(seed: u64) -> IntervalSkipList<K> {
        let mut nodes = Slab::new();
        let header = nodes.insert(Node::new(K::default(), MAX_FORWARD));
        IntervalSkipList {
            nodes,
            header,
            max_level: 0,
            intervals: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Number of intervals currently indexed.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Bounds of an indexed interval.
    pub fn interval(&self, handle: IntervalHandle) -> Option<&Interval<K>> {
        self.intervals.get(&handle)
    }

    /// Indexes `interval` under `handle`: one endpoint node per bound
    /// (shared with other intervals on the same key) plus markers along
    /// the span. The handle must be fresh.
    pub fn insert(&mut self, handle: IntervalHandle, interval: Interval<K>) {
        let prior = self.intervals.insert(handle, interval);
        assert!(prior.is_none(), "interval handle {handle} inserted twice");
        let left = self.insert_key(interval.left());
        let right = self.insert_key(interval.right());
        self.nodes[left].owner_count += 1;
        self.nodes[right].owner_count += 1;
        self.place_markers(left, right, handle);
    }

    /// Removes the interval behind `handle`, dropping endpoint nodes that
    /// own no other interval. Removing a handle that was never inserted is
    /// a caller bug and panics.
    pub fn remove(&mut self, handle: IntervalHandle) -> Interval<K> {
        let interval = match self.intervals.get(&handle) {
            Some(interval) => *interval,
            None => panic!("attempt to remove interval {handle} not in the index"),
        };

        let mut update = [self.header; MAX_FORWARD + 1];
        let left = self
            .search(interval.left(), &mut update)
            .unwrap_or_else(|| panic!("left endpoint of interval {handle} not in the index"));
        assert!(self.nodes[left].owner_count > 0);
        self.remove_markers(left, handle);
        self.nodes[left].owner_count -= 1;
        if self.nodes[left].owner_count == 0 {
            self.remove_node(left, &update);
        }

        let mut update = [self.header; MAX_FORWARD + 1];
        let right = self
            .search(interval.right(), &mut update)
            .unwrap_or_else(|| panic!("right endpoint of interval {handle} not in the index"));
        assert!(self.nodes[right].owner_count > 0);
        self.nodes[right].owner_count -= 1;
        if self.nodes[right].owner_count == 0 {
            self.remove_node(right, &update);
        }

        self.intervals.remove(&handle);
        interval
    }

    /// Stabbing query: appends the handles of every interval containing
    /// `q`, without duplicates. Keys outside all intervals yield nothing.
    pub fn find_intervals(&self, q: K, out: &mut Vec<IntervalHandle>) {
        let mut x = self.header;
        let mut level = self.max_level;
        loop {
            while let Some(next) = self.fwd(x, level) {
                if self.nodes[next].key <= q {
                    x = next;
                } else {
                    break;
                }
            }
            if x != self.header {
                if self.nodes[x].key == q {
                    for &m in &self.nodes[x].eq_markers {
                        if !out.contains(&m) {
                            out.push(m);
                        }
                    }
                    break;
                }
                if let Some(markers) = self.nodes[x].markers.get(level) {
                    for &m in markers {
                        if !out.contains(&m) {
                            out.push(m);
                        }
                    }
                }
            }
            if level == 0 {
                break;
            }
            level -= 1;
        }
    }

    // ---- internals ----------------------------------------------------

    fn fwd(&self, node: usize, level: usize) -> Option<usize> {
        let n = &self.nodes[node];
        if level < n.forward.len() {
            n.forward[level]
        } else {
            None
        }
    }

    fn key(&self, node: usize) -> K {
        self.nodes[node].key
    }

    /// Whether interval `m` contains the closed span `[key(a), key(b)]`.
    fn covers(&self, m: IntervalHandle, a: usize, b: usize) -> bool {
        self.intervals[&m].contains_interval(self.key(a), self.key(b))
    }

    fn contains_key(&self, m: IntervalHandle, node: usize) -> bool {
        self.intervals[&m].contains(self.key(node))
    }

    fn marker_insert(&mut self, node: usize, level: usize, m: IntervalHandle) {
        let markers = &mut self.nodes[node].markers[level];
        if !markers.contains(&m) {
            markers.push(m);
        }
    }

    fn marker_remove(&mut self, node: usize, level: usize, m: IntervalHandle) {
        self.nodes[node].markers[level].retain(|&h| h != m);
    }

    fn eq_insert(&mut self, node: usize, m: IntervalHandle) {
        let eq = &mut self.nodes[node].eq_markers;
        if !eq.contains(&m) {
            eq.push(m);
        }
    }

    fn eq_remove(&mut self, node: usize, m: IntervalHandle) {
        self.nodes[node].eq_markers.retain(|&h| h != m);
    }

    fn random_level(&mut self) -> usize {
        let mut level = 0;
        while self.rng.gen::<f64>() < P {
            level += 1;
        }
        level.min(self.max_level + 1).min(MAX_FORWARD)
    }

    /// Finds the node with `key` (if any) and fills `update` with the
    /// rightmost node left of `key` at every level.
    fn search(&self, key: K, update: &mut [usize; MAX_FORWARD + 1]) -> Option<usize> {
        let mut x = self.header;
        for level in (0..=self.max_level).rev() {
            while let Some(next) = self.fwd(x, level) {
                if self.nodes[next].key < key {
                    x = next;
                } else {
                    break;
                }
            }
            update[level] = x;
        }
        self.fwd(x, 0).filter(|&n| self.nodes[n].key == key)
    }

    /// Get-or-create the endpoint node for `key`, adjusting markers when a
    /// node is created.
    fn insert_key(&mut self, key: K) -> usize {
        let mut update = [self.header; MAX_FORWARD + 1];
        if let Some(found) = self.search(key, &mut update) {
            return found;
        }
        let new_level = self.random_level();
        if new_level > self.max_level {
            // update[] already points at the header for the new levels.
            self.max_level = new_level;
        }
        let x = self.nodes.insert(Node::new(key, new_level));
        for level in 0..=new_level {
            let next = self.fwd(update[level], level);
            self.nodes[x].forward[level] = next;
            self.nodes[update[level]].forward[level] = Some(x);
        }
        self.adjust_markers_on_insert(x, &update);
        x
    }

    /// Marks the span of interval `m` from its `left` endpoint node to its
    /// `right` one: climb to the highest edge still contained by the
    /// interval, then descend toward the right endpoint, marking each edge
    /// taken and eq-marking each node whose key the interval contains.
    fn place_markers(&mut self, left: usize, right: usize, m: IntervalHandle) {
        let mut x = left;
        if self.contains_key(m, x) {
            self.eq_insert(x, m);
        }
        let mut level = 0;
        // Ascending path.
        loop {
            match self.fwd(x, level) {
                Some(next) if self.covers(m, x, next) => {
                    while level != self.nodes[x].top() {
                        match self.fwd(x, level + 1) {
                            Some(above) if self.covers(m, x, above) => level += 1,
                            _ => break,
                        }
                    }
                    let next = self.fwd(x, level).expect("climb keeps a forward edge");
                    self.marker_insert(x, level, m);
                    x = next;
                    if self.contains_key(m, x) {
                        self.eq_insert(x, m);
                    }
                }
                _ => break,
            }
        }
        // Descending path.
        while x != right {
            while level != 0
                && !matches!(self.fwd(x, level), Some(next) if self.covers(m, x, next))
            {
                level -= 1;
            }
            self.marker_insert(x, level, m);
            x = self
                .fwd(x, level)
                .expect("the descending path stays inside the interval");
            if self.contains_key(m, x) {
                self.eq_insert(x, m);
            }
        }
    }

    /// Unmarks the span of `m`, walking the same ascending/descending path
    /// as `place_markers`.
    fn remove_markers(&mut self, left: usize, m: IntervalHandle) {
        let right_key = self.intervals[&m].right();
        let mut x = left;
        if self.contains_key(m, x) {
            self.eq_remove(x, m);
        }
        let mut level = 0;
        loop {
            match self.fwd(x, level) {
                Some(next) if self.covers(m, x, next) => {
                    while level != self.nodes[x].top() {
                        match self.fwd(x, level + 1) {
                            Some(above) if self.covers(m, x, above) => level += 1,
                            _ => break,
                        }
                    }
                    let next = self.fwd(x, level).expect("climb keeps a forward edge");
                    self.marker_remove(x, level, m);
                    x = next;
                    if self.contains_key(m, x) {
                        self.eq_remove(x, m);
                    }
                }
                _ => break,
            }
        }
        while self.nodes[x].key != right_key {
            while level != 0
                && !matches!(self.fwd(x, level), Some(next) if self.covers(m, x, next))
            {
                level -= 1;
            }
            self.marker_remove(x, level, m);
            x = self
                .fwd(x, level)
                .expect("the descending path stays inside the interval");
            if self.contains_key(m, x) {
                self.eq_remove(x, m);
            }
        }
    }

    /// Strips interval `m` from the level-`level` edges and nodes on the
    /// path from `l` to `r` inclusive of `r`'s eq markers.
    fn remove_mark_from_level(&mut self, m: IntervalHandle, level: usize, l: usize, r: usize) {
        let mut y = l;
        loop {
            if y == r {
                break;
            }
            self.marker_remove(y, level, m);
            self.eq_remove(y, m);
            match self.fwd(y, level) {
                Some(next) => y = next,
                None => return,
            }
        }
        self.eq_remove(r, m);
    }

    /// Re-establishes the marker invariant after splicing in node `x`.
    ///
    /// Phase 1 rewrites the outgoing-edge markers level by level from the
    /// bottom, promoting markers whose interval now covers the taller span
    /// exposed by `x`'s higher edges; phase 2 does the same for incoming
    /// edges, promoting no higher than the top edge into `x`. Finally the
    /// eq-marker set of `x` is the union of its outgoing-edge markers.
    fn adjust_markers_on_insert(&mut self, x: usize, update: &[usize; MAX_FORWARD + 1]) {
        let top = self.nodes[x].top();
        let mut promoted: Vec<IntervalHandle> = Vec::new();
        let mut level = 0;

        // Phase 1: edges leading out of x.
        while level + 1 <= top {
            let Some(above) = self.fwd(x, level + 1) else {
                break;
            };
            let here = self
                .fwd(x, level)
                .expect("a level edge exists below a taller one");
            let mut new_promoted = Vec::new();
            for m in self.nodes[update[level]].markers[level].clone() {
                if self.covers(m, x, above) {
                    // The marker belongs on a taller edge now; strip it
                    // from the level path it used to cover.
                    self.remove_mark_from_level(m, level, here, above);
                    new_promoted.push(m);
                } else {
                    // The split edge still carries it; x's outgoing half
                    // needs it too.
                    self.marker_insert(x, level, m);
                }
            }
            let mut still = Vec::new();
            for m in promoted {
                if !self.covers(m, x, above) {
                    self.marker_insert(x, level, m);
                    if self.contains_key(m, here) {
                        self.eq_insert(here, m);
                    }
                } else {
                    self.remove_mark_from_level(m, level, here, above);
                    still.push(m);
                }
            }
            promoted = still;
            promoted.extend(new_promoted);
            level += 1;
        }
        for m in promoted.drain(..) {
            self.marker_insert(x, level, m);
            if let Some(next) = self.fwd(x, level) {
                if self.contains_key(m, next) {
                    self.eq_insert(next, m);
                }
            }
        }
        for m in self.nodes[update[level]].markers[level].clone() {
            self.marker_insert(x, level, m);
        }

        // Phase 2: edges leading into x. Markers may be promoted as high
        // as the top edge into x, never higher.
        let mut promoted: Vec<IntervalHandle> = Vec::new();
        let mut level = 0;
        while level + 1 <= top && update[level + 1] != self.header {
            let mut new_promoted = Vec::new();
            for m in self.nodes[update[level]].markers[level].clone() {
                if self.covers(m, update[level + 1], x) {
                    new_promoted.push(m);
                    self.remove_mark_from_level(m, level, update[level + 1], x);
                }
            }
            let mut still = Vec::new();
            for m in promoted {
                let stops_here = update[level] != self.header
                    && self.covers(m, update[level], x)
                    && !self.covers(m, update[level + 1], x);
                if stops_here {
                    self.marker_insert(update[level], level, m);
                    if self.contains_key(m, update[level]) {
                        self.eq_insert(update[level], m);
                    }
                } else {
                    self.remove_mark_from_level(m, level, update[level + 1], x);
                    still.push(m);
                }
            }
            promoted = still;
            promoted.extend(new_promoted);
            level += 1;
        }
        for m in promoted.drain(..) {
            self.marker_insert(update[level], level, m);
            if update[level] != self.header && self.contains_key(m, update[level]) {
                self.eq_insert(update[level], m);
            }
        }

        // Intervals crossing x are exactly those marked on its outgoing
        // edges.
        let mut eq: Vec<IntervalHandle> = Vec::new();
        for lvl in 0..=top {
            for &m in &self.nodes[x].markers[lvl] {
                if !eq.contains(&m) {
                    eq.push(m);
                }
            }
        }
        self.nodes[x].eq_markers = eq;
    }

    /// Re-establishes the marker invariant before splicing out node `x`:
    /// markers on edges adjacent to `x` whose interval no longer covers
    /// the merged edge are demoted level by level onto the paths the
    /// merged edge replaces. Markers demoted at one level and not placed
    /// there carry down to the next.
    fn adjust_markers_on_delete(&mut self, x: usize, update: &[usize; MAX_FORWARD + 1]) {
        let top = self.nodes[x].top();
        let mut demoted: Vec<IntervalHandle> = Vec::new();

        // Phase 1: edges to the left of x.
        for level in (0..=top).rev() {
            let merged_next = self.fwd(x, level);
            let mut new_demoted = Vec::new();
            for m in self.nodes[update[level]].markers[level].clone() {
                let fits_merged = match merged_next {
                    Some(next) => self.covers(m, update[level], next),
                    None => false,
                };
                if !fits_merged {
                    new_demoted.push(m);
                    self.marker_remove(update[level], level, m);
                }
            }
            let mut still = Vec::new();
            for m in demoted {
                // Lay the marker along the level path between the two
                // predecessors; interior nodes pick up eq markers.
                let mut y = update[level + 1];
                while y != update[level] {
                    if y != update[level + 1] && self.contains_key(m, y) {
                        self.eq_insert(y, m);
                    }
                    self.marker_insert(y, level, m);
                    match self.fwd(y, level) {
                        Some(next) => y = next,
                        None => break,
                    }
                }
                if y == update[level] && y != update[level + 1] && self.contains_key(m, y) {
                    self.eq_insert(y, m);
                }
                let fits_merged = match merged_next {
                    Some(next) => self.covers(m, update[level], next),
                    None => false,
                };
                if fits_merged {
                    self.marker_insert(update[level], level, m);
                } else {
                    still.push(m);
                }
            }
            demoted = still;
            demoted.extend(new_demoted);
        }

        // Phase 2: edges to the right of x.
        let mut demoted: Vec<IntervalHandle> = Vec::new();
        for level in (0..=top).rev() {
            let merged_next = self.fwd(x, level);
            let mut new_demoted = Vec::new();
            for m in self.nodes[x].markers[level].clone() {
                if let Some(next) = merged_next {
                    let fits_merged =
                        update[level] != self.header && self.covers(m, update[level], next);
                    if !fits_merged {
                        new_demoted.push(m);
                    }
                }
            }
            let mut still = Vec::new();
            for m in demoted {
                // Lay the marker along the level path from the merged
                // target to the taller edge's target.
                let stop = self.fwd(x, level + 1);
                let mut y = merged_next;
                while let Some(node) = y {
                    if Some(node) == stop {
                        break;
                    }
                    self.eq_insert(node, m);
                    self.marker_insert(node, level, m);
                    y = self.fwd(node, level);
                }
                let fits_merged = match merged_next {
                    Some(next) => {
                        update[level] != self.header && self.covers(m, update[level], next)
                    }
                    None => false,
                };
                if !fits_merged {
                    still.push(m);
                }
            }
            demoted = still;
            demoted.extend(new_demoted);
        }
    }

    /// Splices out endpoint node `x` after demoting the markers that
    /// depended on its edges.
    fn remove_node(&mut self, x: usize, update: &[usize; MAX_FORWARD + 1]) {
        self.adjust_markers_on_delete(x, update);
        for level in 0..=self.nodes[x].top() {
            let next = self.fwd(x, level);
            self.nodes[update[level]].forward[level] = next;
        }
        self.nodes.remove(x);
    }

    /// Observable structure for tests: per key, the owner count, sorted
    /// marker sets per level, and sorted eq markers.
    #[cfg(test)]
    pub(crate) fn fingerprint(&self) -> Vec<(K, u32, Vec<Vec<IntervalHandle>>, Vec<IntervalHandle>)>
    where
        K: std::fmt::Debug,
    {
        let mut out = Vec::new();
        let mut at = self.fwd(self.header, 0);
        while let Some(node) = at {
            let n = &self.nodes[node];
            let mut markers: Vec<Vec<IntervalHandle>> =
                n.markers.iter().cloned().collect();
            for m in &mut markers {
                m.sort_unstable();
            }
            let mut eq = n.eq_markers.clone();
            eq.sort_unstable();
            out.push((n.key, n.owner_count, markers, eq));
            at = self.fwd(node, 0);
        }
        out
    }
}
