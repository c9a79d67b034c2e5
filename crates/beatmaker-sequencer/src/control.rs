//! Transport state machine: play mode, tick counter and the rewind protocol.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::{PatternLayout, RewindPolicy};
use crate::position::Position;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransportMode {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Result of asking the transport for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAdvance {
    /// Metrics are invalid; nothing moved.
    Invalid,
    /// A pending rewind was applied instead of advancing.
    Rewound,
    /// The position was just reset and its tick has not been played yet.
    Fresh,
    /// The tick counter moved forward by one.
    Advanced,
}

#[derive(Debug, Default)]
struct State {
    mode: TransportMode,
    tick: u64,
    fresh: bool,
    rewind_requested: bool,
    rewind_done: bool,
    overrun: bool,
    generation: u64,
    shutdown: bool,
}

impl State {
    fn reset_position(&mut self) {
        self.tick = 0;
        self.fresh = true;
        self.rewind_requested = false;
        self.overrun = false;
    }

    fn changed(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Play state and tick counter shared between the control surface and the
/// engine thread.
///
/// Only the engine advances the tick. A rewind issued while playing is
/// recorded and applied on the next tick boundary.
pub struct TransportControl {
    layout: PatternLayout,
    total_ticks: u64,
    policy: RewindPolicy,
    state: Mutex<State>,
    changed: Condvar,
}

impl TransportControl {
    pub fn new(layout: PatternLayout, policy: RewindPolicy) -> Self {
        Self {
            layout,
            total_ticks: layout.total_ticks().max(1),
            policy,
            state: Mutex::new(State {
                fresh: true,
                ..State::default()
            }),
            changed: Condvar::new(),
        }
    }

    pub fn layout(&self) -> &PatternLayout {
        &self.layout
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn rewind_policy(&self) -> RewindPolicy {
        self.policy
    }

    pub fn mode(&self) -> TransportMode {
        self.state.lock().mode
    }

    pub fn is_playing(&self) -> bool {
        self.mode() == TransportMode::Playing
    }

    pub fn tick(&self) -> u64 {
        self.state.lock().tick
    }

    pub fn position(&self) -> Position {
        Position::at(self.tick(), &self.layout)
    }

    pub fn is_overrun(&self) -> bool {
        self.state.lock().overrun
    }

    pub fn is_rewind_done(&self) -> bool {
        self.state.lock().rewind_done
    }

    pub fn is_rewind_pending(&self) -> bool {
        self.state.lock().rewind_requested
    }

    fn update<R>(&self, change: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock();
        let result = change(&mut state);
        state.changed();
        self.changed.notify_all();
        result
    }

    /// Resets the position to the first tick and starts playing.
    pub fn start(&self) {
        self.update(|state| {
            state.reset_position();
            state.mode = TransportMode::Playing;
        });
    }

    /// Stops playback. The position is kept until the next start.
    pub fn stop(&self) {
        self.update(|state| state.mode = TransportMode::Stopped);
    }

    pub fn pause(&self) -> bool {
        self.update(|state| {
            let playing = state.mode == TransportMode::Playing;
            if playing {
                state.mode = TransportMode::Paused;
            }
            playing
        })
    }

    pub fn resume(&self) -> bool {
        self.update(|state| {
            let paused = state.mode == TransportMode::Paused;
            if paused {
                state.mode = TransportMode::Playing;
            }
            paused
        })
    }

    /// Rewinds to the first tick. Returns whether the position was reset
    /// right away rather than on a later tick.
    pub fn rewind(&self) -> bool {
        let policy = self.policy;
        self.update(|state| {
            let deferred = match state.mode {
                TransportMode::Playing => true,
                TransportMode::Paused => policy == RewindPolicy::OnResume,
                TransportMode::Stopped => false,
            };
            if deferred {
                state.rewind_requested = true;
            } else {
                state.reset_position();
            }
            !deferred
        })
    }

    /// Moves to `tick`, wrapped into the pattern. Ignored while playing.
    pub fn seek(&self, tick: u64) -> bool {
        let total = self.total_ticks;
        self.update(|state| {
            if state.mode == TransportMode::Playing {
                return false;
            }
            state.tick = tick % total;
            state.fresh = true;
            state.overrun = false;
            true
        })
    }

    /// Moves the transport to the next tick. Called by the engine only.
    ///
    /// The first call after the position was reset plays the current tick
    /// without incrementing. Wrapping past the last tick raises the overrun
    /// flag for that tick only.
    pub fn advance(&self, metrics_valid: bool) -> TickAdvance {
        if !metrics_valid {
            return TickAdvance::Invalid;
        }
        let mut state = self.state.lock();

        if state.rewind_requested {
            state.reset_position();
            state.rewind_done = true;
            state.overrun = true;
            return TickAdvance::Rewound;
        }
        state.rewind_done = false;

        if state.fresh {
            state.fresh = false;
            state.overrun = false;
            return TickAdvance::Fresh;
        }

        state.tick += 1;
        if state.tick >= self.total_ticks {
            state.tick %= self.total_ticks;
            state.overrun = true;
        } else {
            state.overrun = false;
        }
        TickAdvance::Advanced
    }

    /// Blocks until the transport state changes or `timeout` elapses.
    /// Returns whether a change was observed.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let generation = state.generation;
        if state.shutdown {
            return true;
        }
        !self
            .changed
            .wait_while_for(&mut state, |state| state.generation == generation && !state.shutdown, timeout)
            .timed_out()
    }

    /// Sleeps until `deadline`. Returns `false` when woken early by a state
    /// change.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        let generation = state.generation;
        self.changed
            .wait_while_until(&mut state, |state| state.generation == generation && !state.shutdown, deadline)
            .timed_out()
    }

    /// Asks the engine loop to exit.
    pub fn shutdown(&self) {
        self.update(|state| {
            state.shutdown = true;
            state.mode = TransportMode::Stopped;
        });
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub(crate) fn clear_shutdown(&self) {
        self.state.lock().shutdown = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn small() -> TransportControl {
        let layout = PatternLayout {
            measures: 1,
            quarters_per_measure: 1,
            steps_per_quarter: 2,
            ticks_per_step: 2,
            ..PatternLayout::default()
        };
        TransportControl::new(layout, RewindPolicy::Immediate)
    }

    #[test]
    fn first_tick_after_start_is_fresh() {
        let control = small();
        control.start();
        assert_eq!(control.advance(true), TickAdvance::Fresh);
        assert_eq!(control.tick(), 0);
        assert_eq!(control.advance(true), TickAdvance::Advanced);
        assert_eq!(control.tick(), 1);
    }

    #[test]
    fn wraps_with_single_overrun() {
        let control = small();
        control.start();
        control.advance(true);
        for _ in 0..3 {
            control.advance(true);
            assert!(!control.is_overrun());
        }
        assert_eq!(control.tick(), 3);
        assert_eq!(control.advance(true), TickAdvance::Advanced);
        assert_eq!(control.tick(), 0);
        assert!(control.is_overrun());
        control.advance(true);
        assert!(!control.is_overrun());
    }

    #[test]
    fn invalid_metrics_freeze_the_transport() {
        let control = small();
        control.start();
        control.advance(true);
        assert_eq!(control.advance(false), TickAdvance::Invalid);
        assert_eq!(control.tick(), 0);
    }

    #[test]
    fn rewind_while_playing_is_deferred_to_next_tick() {
        let control = small();
        control.start();
        control.advance(true);
        control.advance(true);
        assert!(!control.rewind());
        assert_eq!(control.tick(), 1);
        assert_eq!(control.advance(true), TickAdvance::Rewound);
        assert_eq!(control.tick(), 0);
        assert!(control.is_rewind_done());
        assert_eq!(control.advance(true), TickAdvance::Fresh);
        assert!(!control.is_rewind_done());
    }

    #[test]
    fn rewind_while_paused_follows_policy() {
        let control = small();
        control.start();
        control.advance(true);
        control.advance(true);
        control.pause();
        assert!(control.rewind());
        assert_eq!(control.tick(), 0);

        let deferred = TransportControl::new(*control.layout(), RewindPolicy::OnResume);
        deferred.start();
        deferred.advance(true);
        deferred.advance(true);
        deferred.pause();
        assert!(!deferred.rewind());
        assert_eq!(deferred.tick(), 1);
        deferred.resume();
        assert_eq!(deferred.advance(true), TickAdvance::Rewound);
    }

    #[test]
    fn pause_and_resume_keep_position() {
        let control = small();
        control.start();
        control.advance(true);
        control.advance(true);
        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.resume());
        assert_eq!(control.tick(), 1);
        assert_eq!(control.advance(true), TickAdvance::Advanced);
        assert_eq!(control.tick(), 2);
    }

    #[test]
    fn stop_then_start_returns_to_zero() {
        let control = small();
        control.start();
        control.advance(true);
        control.advance(true);
        control.stop();
        assert_eq!(control.tick(), 1);
        control.start();
        assert_eq!(control.tick(), 0);
        assert_eq!(control.advance(true), TickAdvance::Fresh);
    }

    #[test]
    fn seek_wraps_and_is_refused_while_playing() {
        let control = small();
        assert!(control.seek(6));
        assert_eq!(control.tick(), 2);
        control.start();
        assert!(!control.seek(1));
    }

    #[test]
    fn state_changes_wake_waiters() {
        let control = Arc::new(small());
        let waiter = Arc::clone(&control);
        let handle = thread::spawn(move || waiter.wait_for_change(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        control.start();
        assert!(handle.join().unwrap());
        assert!(!control.wait_for_change(Duration::from_millis(5)));
    }

    #[test]
    fn sleep_until_is_interrupted_by_shutdown() {
        let control = Arc::new(small());
        let sleeper = Arc::clone(&control);
        let handle = thread::spawn(move || sleeper.sleep_until(Instant::now() + Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        control.shutdown();
        assert!(!handle.join().unwrap());
        assert!(control.is_shutdown());
    }
}
