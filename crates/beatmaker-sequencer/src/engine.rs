//! The scheduler: one cycle per tick, driven by a deadline clock.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use beatmaker_midi::thread::{join_bounded, spawn_worker};

use crate::config::JitterSettings;
use crate::control::TickAdvance;
use crate::position::Position;
use crate::sequencer::Core;
use crate::SequencerError;

const ENGINE_THREAD_NAME: &str = "beatmaker-sequencer";
/// Longest wait for a state change while stopped or paused.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// What one scheduling cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Not playing, or the tempo is invalid.
    Idle,
    /// A pending rewind moved the position back to the start.
    Rewound(Position),
    Tick {
        position: Position,
        step_changed: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct MovingAverage {
    window: u64,
    sum: u64,
    count: u64,
    average: u64,
}

impl MovingAverage {
    fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            sum: 0,
            count: 0,
            average: 0,
        }
    }

    fn add(&mut self, sample: u64) -> u64 {
        self.sum += sample;
        if self.count < self.window {
            self.count += 1;
        } else {
            self.sum -= self.average;
        }
        self.average = self.sum / self.count;
        self.average
    }
}

/// Deviation of observed tick and step periods from the ideal ones.
///
/// Purely diagnostic: averages are reported at `debug` periodically and
/// single deviations over the configured limits are logged at `warn`.
#[derive(Debug, Clone)]
pub struct JitterStats {
    settings: JitterSettings,
    tick: MovingAverage,
    step: MovingAverage,
    last_report: Option<Instant>,
}

impl JitterStats {
    pub fn new(settings: JitterSettings) -> Self {
        Self {
            settings,
            tick: MovingAverage::new(settings.window),
            step: MovingAverage::new(settings.window),
            last_report: None,
        }
    }

    pub fn add_tick(&mut self, ideal: Duration, observed: Duration) {
        let deviation = abs_diff(ideal, observed);
        if deviation > self.settings.tick_limit() {
            tracing::warn!(
                deviation_us = deviation.as_micros() as u64,
                limit_ms = self.settings.tick_limit_ms,
                "tick jitter over limit"
            );
        }
        self.tick.add(deviation.as_micros() as u64);
        self.maybe_report();
    }

    pub fn add_step(&mut self, ideal: Duration, observed: Duration) {
        let deviation = abs_diff(ideal, observed);
        if deviation > self.settings.step_limit() {
            tracing::warn!(
                deviation_us = deviation.as_micros() as u64,
                limit_ms = self.settings.step_limit_ms,
                "step jitter over limit"
            );
        }
        self.step.add(deviation.as_micros() as u64);
        self.maybe_report();
    }

    pub fn average_tick_jitter(&self) -> Duration {
        Duration::from_micros(self.tick.average)
    }

    pub fn average_step_jitter(&self) -> Duration {
        Duration::from_micros(self.step.average)
    }

    fn maybe_report(&mut self) {
        let now = Instant::now();
        let Some(last) = self.last_report else {
            self.last_report = Some(now);
            return;
        };
        if now.duration_since(last) >= self.settings.report_interval() {
            tracing::debug!(
                tick_jitter_us = self.tick.average,
                step_jitter_us = self.step.average,
                "scheduling jitter"
            );
            self.last_report = Some(now);
        }
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Runs sequencer cycles: advances the transport, counts down sounding
/// notes, triggers steps and publishes the position.
///
/// The engine thread owns one; [`crate::Sequencer::offline`] hands one out
/// for driving playback by hand.
pub struct Scheduler {
    core: Arc<Core>,
    current_step: Option<usize>,
    jitter: JitterStats,
    last_tick_at: Option<Instant>,
    last_step_at: Option<Instant>,
}

impl Scheduler {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        let jitter = JitterStats::new(core.jitter);
        Self {
            core,
            current_step: None,
            jitter,
            last_tick_at: None,
            last_step_at: None,
        }
    }

    pub fn jitter(&self) -> &JitterStats {
        &self.jitter
    }

    /// Runs one cycle.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        let core = Arc::clone(&self.core);
        let control = &core.control;
        if !control.is_playing() {
            return CycleOutcome::Idle;
        }
        let metrics = core.metrics.get();

        match control.advance(metrics.is_valid()) {
            TickAdvance::Invalid => CycleOutcome::Idle,
            TickAdvance::Rewound => {
                self.reset();
                let position = control.position();
                core.notify_position(position, true);
                CycleOutcome::Rewound(position)
            }
            TickAdvance::Fresh => {
                self.reset();
                self.play(false)
            }
            TickAdvance::Advanced => self.play(control.is_overrun()),
        }
    }

    fn reset(&mut self) {
        self.current_step = None;
        self.last_tick_at = None;
        self.last_step_at = None;
    }

    fn play(&mut self, overrun: bool) -> CycleOutcome {
        let core = Arc::clone(&self.core);
        let sink = core.sink.as_ref();
        let position = core.control.position();

        for track in &core.tracks {
            track.update_tick(sink);
        }

        let step_changed = match self.current_step {
            None => true,
            Some(current) => position.step > current || overrun,
        };
        if step_changed {
            self.current_step = Some(position.step);
            for track in &core.tracks {
                track.update_step(position.step, sink);
            }
        }

        sink.flush();
        self.measure(step_changed);
        core.notify_position(position, step_changed);

        CycleOutcome::Tick {
            position,
            step_changed,
        }
    }

    fn measure(&mut self, step_changed: bool) {
        if !self.core.jitter.enabled {
            return;
        }
        let metrics = self.core.metrics.get();
        let now = Instant::now();
        if let Some(last) = self.last_tick_at.replace(now) {
            self.jitter.add_tick(metrics.tick_duration(), now - last);
        }
        if step_changed {
            if let Some(last) = self.last_step_at.replace(now) {
                self.jitter.add_step(metrics.step_duration(), now - last);
            }
        }
    }

    /// Releases every sounding note and flushes the sink.
    pub fn all_tracks_off(&self) {
        self.core.all_tracks_off();
    }

    /// Engine thread body: waits for each tick deadline and runs a cycle,
    /// or idles until the transport changes.
    ///
    /// Deadlines come from [`next_deadline`].
    fn run(mut self) {
        tracing::debug!("sequencer engine started");
        let mut deadline: Option<Instant> = None;

        while !self.core.control.is_shutdown() {
            if !self.core.control.is_playing() {
                if deadline.is_some() {
                    self.all_tracks_off();
                }
                self.core.control.wait_for_change(IDLE_WAIT);
                self.last_tick_at = None;
                self.last_step_at = None;
                deadline = None;
                continue;
            }

            let tick = self.core.metrics.get().tick_duration();
            if tick.is_zero() {
                self.core.control.wait_for_change(IDLE_WAIT);
                deadline = None;
                continue;
            }

            if let Some(at) = deadline {
                if Instant::now() < at && !self.core.control.sleep_until(at) {
                    continue;
                }
            }
            deadline = Some(next_deadline(deadline, tick, Instant::now()));

            if !self.core.control.is_playing() {
                continue;
            }
            self.run_cycle();
        }

        self.all_tracks_off();
        tracing::debug!("sequencer engine finished");
    }
}

/// Deadline of the tick after the one due at `previous`.
///
/// Advances by one tick and clamps to `now`, so a late loop runs one cycle
/// immediately instead of replaying every missed tick. Without a previous
/// deadline the next tick is a full tick away.
pub(crate) fn next_deadline(previous: Option<Instant>, tick: Duration, now: Instant) -> Instant {
    match previous {
        Some(at) => (at + tick).max(now),
        None => now + tick,
    }
}

/// Named, priority-raised thread running a [`Scheduler`].
pub struct EngineThread {
    core: Arc<Core>,
    handle: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl EngineThread {
    pub(crate) fn spawn(
        scheduler: Scheduler,
        priority: i32,
        join_timeout: Duration,
    ) -> Result<Self, SequencerError> {
        let core = Arc::clone(&scheduler.core);
        core.control.clear_shutdown();
        let handle = spawn_worker(ENGINE_THREAD_NAME, priority, move || scheduler.run())?;
        Ok(Self {
            core,
            handle: Some(handle),
            join_timeout,
        })
    }

    /// Stops playback, asks the thread to exit and waits for it.
    pub fn stop(&mut self) {
        self.core.control.shutdown();
        if let Some(handle) = self.handle.take() {
            join_bounded(handle, self.join_timeout, ENGINE_THREAD_NAME);
        }
    }
}

impl Drop for EngineThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use beatmaker_midi::{MemorySink, MidiNote, MidiPacket};

    use super::*;
    use crate::config::{PatternLayout, SequencerSettings};
    use crate::metrics::MetricsHandle;
    use crate::model::ElementId;
    use crate::Sequencer;

    fn setup(layout: PatternLayout, duration: u32) -> (Sequencer, Arc<MemorySink>) {
        let settings = SequencerSettings {
            layout,
            note_duration_ticks: duration,
            jitter: JitterSettings {
                enabled: false,
                ..JitterSettings::default()
            },
            ..SequencerSettings::default()
        };
        let sink = Arc::new(MemorySink::new());
        let metrics = MetricsHandle::new(settings.bpm, layout);
        (Sequencer::new(&settings, metrics, sink.clone()).unwrap(), sink)
    }

    fn tiny() -> PatternLayout {
        PatternLayout {
            tracks: 1,
            measures: 1,
            quarters_per_measure: 1,
            steps_per_quarter: 2,
            ticks_per_step: 2,
        }
    }

    #[test]
    fn idle_until_started() {
        let (sequencer, sink) = setup(tiny(), 1);
        let mut scheduler = sequencer.offline().unwrap();
        assert_eq!(scheduler.run_cycle(), CycleOutcome::Idle);
        assert!(sink.frames().is_empty());
    }

    #[test]
    fn step_boundaries_trigger_including_wrap() {
        let (sequencer, sink) = setup(tiny(), 1);
        sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
        sequencer.set_active(ElementId::Step { track: 0, step: 1 }, true);
        sequencer.start();
        let mut scheduler = sequencer.offline().unwrap();

        let changes: Vec<_> = (0..6)
            .map(|_| match scheduler.run_cycle() {
                CycleOutcome::Tick { position, step_changed } => (position.tick, step_changed),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            changes,
            vec![(0, true), (1, false), (2, true), (3, false), (0, true), (1, false)]
        );

        let note = MidiNote::new(0, 36, 72);
        let frames = sink.frames();
        assert_eq!(frames[0], vec![MidiPacket::note_on(note)]);
        assert_eq!(frames[1], vec![MidiPacket::note_off(note)]);
        assert_eq!(frames[2], vec![MidiPacket::note_on(note)]);
    }

    #[test]
    fn single_step_pattern_retriggers_on_every_wrap() {
        let layout = PatternLayout {
            tracks: 1,
            measures: 1,
            quarters_per_measure: 1,
            steps_per_quarter: 1,
            ticks_per_step: 2,
        };
        let (sequencer, sink) = setup(layout, 1);
        sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
        sequencer.start();
        let mut scheduler = sequencer.offline().unwrap();

        let changes: Vec<_> = (0..5)
            .map(|_| match scheduler.run_cycle() {
                CycleOutcome::Tick { position, step_changed } => (position.tick, step_changed),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            changes,
            vec![(0, true), (1, false), (0, true), (1, false), (0, true)]
        );

        let note = MidiNote::new(0, 36, 72);
        let ons = sink
            .packets()
            .iter()
            .filter(|packet| **packet == MidiPacket::note_on(note))
            .count();
        assert_eq!(ons, 3);
    }

    #[test]
    fn late_deadline_is_clamped_to_now() {
        let tick = Duration::from_millis(10);
        let now = Instant::now() + Duration::from_secs(1);
        let late = now - tick * 5;

        let next = next_deadline(Some(late), tick, now);
        assert_eq!(next, now);

        // With the clock frozen, only the late deadline is overdue.
        let mut deadline = late;
        let mut cycles = 0;
        while deadline < now {
            cycles += 1;
            deadline = next_deadline(Some(deadline), tick, now);
        }
        assert_eq!(cycles, 1);
        assert_eq!(next_deadline(Some(deadline), tick, now), now + tick);
    }

    #[test]
    fn on_time_deadlines_advance_by_one_tick() {
        let tick = Duration::from_millis(10);
        let start = Instant::now();
        assert_eq!(next_deadline(None, tick, start), start + tick);
        let due = start + tick;
        assert_eq!(next_deadline(Some(due), tick, due), due + tick);
        assert_eq!(
            next_deadline(Some(due), tick, due + Duration::from_millis(3)),
            due + tick
        );
    }

    #[test]
    fn tick_update_runs_before_step_update() {
        let (sequencer, sink) = setup(tiny(), 2);
        sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
        sequencer.set_active(ElementId::Step { track: 0, step: 1 }, true);
        sequencer.start();
        let mut scheduler = sequencer.offline().unwrap();
        for _ in 0..3 {
            scheduler.run_cycle();
        }
        let note = MidiNote::new(0, 36, 72);
        assert_eq!(
            sink.frames()[2],
            vec![MidiPacket::note_off(note), MidiPacket::note_on(note)]
        );
    }

    #[test]
    fn pending_rewind_publishes_without_playing() {
        let (sequencer, sink) = setup(tiny(), 8);
        sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
        sequencer.start();
        let mut scheduler = sequencer.offline().unwrap();
        scheduler.run_cycle();
        scheduler.run_cycle();
        sequencer.rewind();
        assert_eq!(
            scheduler.run_cycle(),
            CycleOutcome::Rewound(Position::default())
        );
        assert_eq!(sink.frames().len(), 2);
        assert_eq!(
            scheduler.run_cycle(),
            CycleOutcome::Tick {
                position: Position::default(),
                step_changed: true
            }
        );
    }

    #[test]
    fn resume_does_not_retrigger_current_step() {
        let (sequencer, sink) = setup(tiny(), 8);
        sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
        sequencer.start();
        let mut scheduler = sequencer.offline().unwrap();
        scheduler.run_cycle();
        sequencer.pause();
        assert_eq!(scheduler.run_cycle(), CycleOutcome::Idle);
        sequencer.resume();
        assert!(matches!(
            scheduler.run_cycle(),
            CycleOutcome::Tick {
                step_changed: false,
                ..
            }
        ));
        assert_eq!(sink.packets().len(), 1);
    }

    #[test]
    fn zero_bpm_halts_the_transport() {
        let (sequencer, _) = setup(tiny(), 1);
        sequencer.start();
        sequencer.set_bpm(0);
        let mut scheduler = sequencer.offline().unwrap();
        assert_eq!(scheduler.run_cycle(), CycleOutcome::Idle);
        assert_eq!(sequencer.position().tick, 0);
    }

    #[test]
    fn moving_average_saturates_at_window() {
        let mut average = MovingAverage::new(2);
        assert_eq!(average.add(10), 10);
        assert_eq!(average.add(20), 15);
        assert_eq!(average.add(30), 30);
    }

    #[test]
    fn jitter_stats_track_deviation() {
        let mut stats = JitterStats::new(JitterSettings::default());
        stats.add_tick(Duration::from_millis(2), Duration::from_micros(2_500));
        stats.add_tick(Duration::from_millis(2), Duration::from_micros(1_500));
        assert_eq!(stats.average_tick_jitter(), Duration::from_micros(500));
        assert_eq!(stats.average_step_jitter(), Duration::ZERO);
    }

    #[test]
    fn engine_thread_plays_and_stops() {
        let (sequencer, sink) = setup(PatternLayout::default(), 4);
        sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
        sequencer.set_bpm(300);
        sequencer
            .spawn_engine(0, Duration::from_secs(2))
            .unwrap();
        sequencer.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sequencer.position().tick < 8 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        sequencer.shutdown();

        let packets = sink.packets();
        let note = MidiNote::new(0, 36, 72);
        assert_eq!(packets.first(), Some(&MidiPacket::note_on(note)));
        assert!(packets.contains(&MidiPacket::note_off(note)));
        assert!(!sequencer.is_playing());
    }
}
