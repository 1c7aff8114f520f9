use crate::record::TransactionInterval;
use crate::Tick;
use parking_lot::{Condvar, Mutex};
use rewind_channel::RecvTimeoutError;
use rewind_interval::{Interval, IntervalSkipList};
use rewind_logger::{debug, trace};
use rewind_stop_handler::StopHandler;
use slab::Slab;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Source of transaction records, indexed by end tick.
///
/// Implementations sit on the record/index file pair and use the index's
/// heartbeat stride to seek; how they do that is their business. The
/// window only asks for replays of end-tick ranges. A reader that hits
/// end-of-file before the range is exhausted simply emits fewer records.
pub trait RecordReader: Send {
    /// Lowest start tick in the stream.
    fn cycle_first(&self) -> Tick;

    /// Highest end tick in the stream.
    fn cycle_last(&self) -> Tick;

    /// Emits every record whose end tick lies in `(lo, hi]`.
    fn replay_ending_in(&mut self, lo: Tick, hi: Tick, emit: &mut dyn FnMut(TransactionInterval));
}

/// Window geometry around the active cycle.
///
/// ```text
///  window_l                active                    window_r
///     |   slide-left band   |   |   dead center  |   slide-right band   |
///     |_____________________|___|________________|_____________________|
///              (window_l + load_left)      (window_r - load_right)
/// ```
#[derive(Clone, Debug)]
pub struct WindowConfig {
    /// Ticks buffered left of the active cycle.
    pub offset_left: Tick,
    /// Ticks buffered right of the active cycle.
    pub offset_right: Tick,
    /// Width of the left band that triggers a leftward slide.
    pub load_left: Tick,
    /// Width of the right band that triggers a rightward slide.
    pub load_right: Tick,
    /// Extra ticks read past the window end on full loads, to catch
    /// long-lived transactions that end shortly after it.
    pub long_event_check: Tick,
    /// Worker tick period.
    pub poll_interval: Duration,
}

impl Default for WindowConfig {
    fn default() -> WindowConfig {
        WindowConfig {
            offset_left: 5_000_000,
            offset_right: 5_000_000,
            load_left: 4_000_000,
            load_right: 4_000_000,
            long_event_check: 1_000,
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl WindowConfig {
    /// Load bands wider than the buffer offsets would slide on every tick;
    /// clamp them just inside.
    fn clamped(mut self) -> WindowConfig {
        if self.load_left > self.offset_left {
            self.load_left = self.offset_left.saturating_sub(10);
        }
        if self.load_right > self.offset_right {
            self.load_right = self.offset_right.saturating_sub(10);
        }
        self
    }
}

/// Worker-owned view of the window plus the structures queries read.
/// Everything behind one mutex; the worker finishes a refresh before
/// clearing `loading_hold`, so queries never observe a half-built window.
struct WindowState {
    active_cycle: Tick,
    window_left: Tick,
    window_right: Tick,
    loading_hold: bool,
    shutdown: bool,
    intervals: Slab<TransactionInterval>,
    isl: IntervalSkipList<Tick>,
}

impl WindowState {
    fn new() -> WindowState {
        WindowState {
            active_cycle: 0,
            window_left: 0,
            window_right: 0,
            loading_hold: false,
            shutdown: false,
            intervals: Slab::new(),
            isl: IntervalSkipList::new(),
        }
    }

    /// Inserts every replayed record ending in `(lo, hi]` into the live
    /// array and the skip list.
    fn load<R: RecordReader>(&mut self, reader: &mut R, lo: Tick, hi: Tick) {
        if lo >= hi {
            return;
        }
        trace!("window load ({}, {}]", lo, hi);
        let WindowState { intervals, isl, .. } = self;
        reader.replay_ending_in(lo, hi, &mut |record| {
            if record.end > lo && record.end <= hi {
                let span = Interval::new(record.start, record.end);
                let handle = intervals.insert(record);
                isl.insert(handle, span);
            }
        });
    }

    /// Drops intervals that ended at or before the window start or begin
    /// after its end; what remains is exactly the transactions ending in
    /// `(window_l, window_r]` plus long events straddling the right edge.
    /// Skip-list markers go first; the live array owns the payloads.
    fn trim(&mut self) {
        let (wl, wr) = (self.window_left, self.window_right);
        let doomed: Vec<usize> = self
            .intervals
            .iter()
            .filter(|(_, r)| r.end <= wl || r.start > wr)
            .map(|(handle, _)| handle)
            .collect();
        for handle in doomed {
            self.isl.remove(handle);
            self.intervals.remove(handle);
        }
    }

    /// Drops intervals ending past `bound` so the range above it can be
    /// reloaded without duplication.
    fn drop_ending_after(&mut self, bound: Tick) {
        let doomed: Vec<usize> = self
            .intervals
            .iter()
            .filter(|(_, r)| r.end > bound)
            .map(|(handle, _)| handle)
            .collect();
        for handle in doomed {
            self.isl.remove(handle);
            self.intervals.remove(handle);
        }
    }

    fn clear(&mut self) {
        let all: Vec<usize> = self.intervals.iter().map(|(handle, _)| handle).collect();
        for handle in all {
            self.isl.remove(handle);
            self.intervals.remove(handle);
        }
    }
}

type Shared = Arc<(Mutex<WindowState>, Condvar)>;

/// Foreground handle: stabbing queries against the maintained window.
#[derive(Clone)]
pub struct IntervalWindow {
    shared: Shared,
    file_start: Tick,
    file_end: Tick,
}

impl IntervalWindow {
    /// All transactions in flight at `tick`, in window insertion order.
    ///
    /// Updates the active cycle. When `tick` lies outside the buffered
    /// window the call blocks until the worker has re-centered the window
    /// around it.
    pub fn stabbing_query(&self, tick: Tick, out: &mut Vec<TransactionInterval>) {
        let (lock, condvar) = &*self.shared;
        let mut state = lock.lock();
        state.active_cycle = tick;
        while !state.shutdown && (tick < state.window_left || tick > state.window_right) {
            state.active_cycle = tick;
            state.loading_hold = true;
            debug!("active cycle {} outside window, waiting for reload", tick);
            condvar.wait(&mut state);
        }
        let mut handles = Vec::new();
        state.isl.find_intervals(tick, &mut handles);
        out.extend(handles.into_iter().map(|h| state.intervals[h].clone()));
    }

    /// Current `[window_l, window_r]` bounds.
    pub fn window_bounds(&self) -> (Tick, Tick) {
        let state = self.shared.0.lock();
        (state.window_left, state.window_right)
    }

    /// Number of intervals currently buffered.
    pub fn live_intervals(&self) -> usize {
        self.shared.0.lock().intervals.len()
    }

    /// Lowest start tick in the backing stream.
    pub fn file_start(&self) -> Tick {
        self.file_start
    }

    /// Highest end tick in the backing stream.
    pub fn file_end(&self) -> Tick {
        self.file_end
    }
}

/// Owns the reader and the worker loop maintaining the window.
pub struct IntervalWindowService<R> {
    reader: R,
    config: WindowConfig,
}

impl<R: RecordReader + 'static> IntervalWindowService<R> {
    pub fn new(reader: R, config: WindowConfig) -> IntervalWindowService<R> {
        IntervalWindowService {
            reader,
            config: config.clamped(),
        }
    }

    /// Performs the initial load synchronously, then starts the worker.
    /// Dropping (or stopping) the handler shuts the worker down and clears
    /// the window.
    pub fn start(mut self) -> (IntervalWindow, StopHandler<()>) {
        let file_start = self.reader.cycle_first();
        let file_end = self.reader.cycle_last();
        let shared: Shared = Arc::new((Mutex::new(WindowState::new()), Condvar::new()));

        {
            let mut state = shared.0.lock();
            state.window_left = 0;
            state.window_right = self.config.offset_right;
            let hi = state.window_right + self.config.long_event_check;
            state.load(&mut self.reader, 0, hi);
            state.trim();
        }

        let (stop_tx, stop_rx) = rewind_channel::bounded::<()>(rewind_channel::SIGNAL_CHANNEL_SIZE);
        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("interval-window".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(self.config.poll_interval) {
                        Err(RecvTimeoutError::Timeout) => self.maintain(&worker_shared),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("interval-window worker closing");
                let mut state = worker_shared.0.lock();
                state.clear();
                // Unblock any query still waiting on a reload.
                state.shutdown = true;
                state.loading_hold = false;
                worker_shared.1.notify_all();
            })
            .expect("failed to spawn the interval-window worker");

        let window = IntervalWindow {
            shared,
            file_start,
            file_end,
        };
        let stop = StopHandler::new("interval-window".to_string(), stop_tx, thread);
        (window, stop)
    }

    /// One maintenance pass: recompute the window around the active cycle,
    /// reload or slide as needed, trim, release any held query.
    fn maintain(&mut self, shared: &Shared) {
        let (lock, condvar) = &**shared;
        let mut state = lock.lock();
        let active = state.active_cycle;
        let (wl, wr) = (state.window_left, state.window_right);
        let new_wl = active.saturating_sub(self.config.offset_left);
        let new_wr = active + self.config.offset_right;

        if wl > 0 && active <= wl {
            // Jumped left of the window: rebuild from scratch.
            state.clear();
            state.window_left = new_wl;
            state.window_right = new_wr;
            let hi = new_wr + self.config.long_event_check;
            state.load(&mut self.reader, new_wl, hi);
        } else if wl > 0 && active <= wl + self.config.load_left {
            // Entered the left band: grow leftward. If the recentered
            // window also pokes past the old right edge, cover that too.
            state.window_left = new_wl;
            state.window_right = new_wr;
            state.load(&mut self.reader, new_wl, wl);
            if new_wr > wr {
                state.drop_ending_after(wr);
                state.load(&mut self.reader, wr, new_wr);
            }
        } else if active >= wr {
            // Jumped right of the window: rebuild from scratch.
            state.clear();
            state.window_left = new_wl;
            state.window_right = new_wr;
            let hi = new_wr + self.config.long_event_check;
            state.load(&mut self.reader, new_wl, hi);
        } else if active + self.config.load_right >= wr {
            // Entered the right band: grow rightward. Long events loaded
            // past the old end are re-read, so drop them first. If the
            // recentered window also pokes past the old left edge, cover
            // that too.
            state.drop_ending_after(wr);
            state.window_left = new_wl;
            state.window_right = new_wr;
            state.load(&mut self.reader, wr, new_wr);
            if new_wl < wl {
                state.load(&mut self.reader, new_wl, wl);
            }
        } else {
            // Dead center: nothing to do.
        }

        state.trim();
        if state.loading_hold {
            state.loading_hold = false;
            condvar.notify_all();
        }
    }
}
