//! Stop/join handle for background services.
//!
//! A service spawns its worker thread, keeps the sending half of a bounded
//! signal channel, and hands the caller a [`StopHandler`]. Dropping or
//! explicitly stopping the handler signals the worker and joins it.

use rewind_channel::Sender;
use std::thread::JoinHandle;

/// Owns the stop signal and join handle of one background thread.
///
/// `stop()` is idempotent; the `Drop` impl stops the service if the caller
/// never did.
pub struct StopHandler<T> {
    name: String,
    signal: Option<Sender<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T> StopHandler<T> {
    pub fn new(name: String, signal: Sender<T>, thread: JoinHandle<()>) -> StopHandler<T> {
        StopHandler {
            name,
            signal: Some(signal),
            thread: Some(thread),
        }
    }

    /// Service name this handler controls.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends the stop signal and joins the worker thread.
    pub fn stop(&mut self, msg: T) {
        if let Some(signal) = self.signal.take() {
            if signal.send(msg).is_err() {
                rewind_logger::debug!("service {} already exited", self.name);
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                rewind_logger::error!("service {} worker panicked", self.name);
            }
        }
    }
}

impl<T> Drop for StopHandler<T> {
    fn drop(&mut self) {
        // Without a message to send, dropping the sender is the signal: the
        // worker's recv sees a disconnect.
        self.signal.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                rewind_logger::error!("service {} worker panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn stop_joins_worker() {
        let (tx, rx) = rewind_channel::bounded::<()>(1);
        let thread = thread::spawn(move || {
            let _ = rx.recv();
        });
        let mut handler = StopHandler::new("test".to_string(), tx, thread);
        handler.stop(());
    }

    #[test]
    fn drop_signals_by_disconnect() {
        let (tx, rx) = rewind_channel::bounded::<()>(1);
        let thread = thread::spawn(move || {
            let _ = rx.recv();
        });
        drop(StopHandler::new("test".to_string(), tx, thread));
    }
}
