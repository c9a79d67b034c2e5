//! Worker thread helpers: naming, priority and bounded joins.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::MidiError;

/// Spawns a named worker that first applies `priority` to itself.
///
/// Positive priorities request `SCHED_FIFO` with that priority, negative
/// ones lower the nice value, zero leaves the thread untouched.
pub fn spawn_worker<F>(name: &str, priority: i32, body: F) -> Result<JoinHandle<()>, MidiError>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            apply_priority(priority);
            body();
        })?;
    Ok(handle)
}

/// Waits up to `timeout` for `handle` to finish.
///
/// A thread still running after the timeout is reported as leaked and left
/// detached. Returns whether the thread was joined.
pub fn join_bounded(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(thread = name, ?timeout, "worker did not stop in time, leaking it");
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    if let Err(err) = handle.join() {
        tracing::error!(thread = name, ?err, "worker panicked");
    }
    true
}

/// Applies a scheduling priority to the calling thread. Failures are logged
/// and otherwise ignored.
#[cfg(target_os = "linux")]
pub fn apply_priority(priority: i32) {
    use std::cmp::Ordering;

    let result = match priority.cmp(&0) {
        Ordering::Equal => return,
        Ordering::Greater => {
            let param = libc::sched_param {
                sched_priority: priority,
            };
            let code =
                unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
            match code {
                0 => Ok(()),
                code => Err(std::io::Error::from_raw_os_error(code)),
            }
        }
        // With PRIO_PROCESS and id 0 Linux changes the calling thread only.
        Ordering::Less => match unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) } {
            0 => Ok(()),
            _ => Err(std::io::Error::last_os_error()),
        },
    };
    if let Err(err) = result {
        tracing::debug!(priority, ?err, "could not change thread priority");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn apply_priority(priority: i32) {
    if priority != 0 {
        tracing::debug!(priority, "thread priorities are not supported on this platform");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn joins_finished_worker() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = spawn_worker("test-worker", 0, move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(join_bounded(handle, Duration::from_secs(5), "test-worker"));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn reports_leaked_worker() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let handle = spawn_worker("stuck-worker", 0, move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        assert!(!join_bounded(handle, Duration::from_millis(20), "stuck-worker"));
        release.store(true, Ordering::SeqCst);
    }
}
