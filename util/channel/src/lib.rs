//! Reexports `crossbeam_channel` to uniform the dependency version.

pub use crossbeam_channel::{
    after, bounded, never, select, tick, unbounded, Receiver, RecvError, RecvTimeoutError,
    SendError, Sender, TryRecvError, TrySendError,
};

/// Conventional capacity for service stop/signal channels.
pub const SIGNAL_CHANNEL_SIZE: usize = 1;
