use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::thread::{join_bounded, spawn_worker};
use crate::MidiError;

/// Background timer that calls `tick` every `interval` until dropped.
///
/// Used by the controller to rescan for interfaces being plugged in or
/// removed.
pub struct RescanTimer {
    stop_tx: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
    join_timeout: Duration,
}

impl RescanTimer {
    pub fn spawn<F>(
        interval: Duration,
        priority: i32,
        join_timeout: Duration,
        mut tick: F,
    ) -> Result<Self, MidiError>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = spawn_worker("beatmaker-midi-rescan", priority, move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => tick(),
                _ => break,
            }
        })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(handle),
            join_timeout,
        })
    }

    /// Stops the timer and waits for the thread to exit.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.thread.take() {
            join_bounded(handle, self.join_timeout, "beatmaker-midi-rescan");
        }
    }
}

impl Drop for RescanTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
