//! Tempo and the durations derived from it.

use std::sync::Arc;
use std::time::Duration;

use beatmaker_midi::TempoSink;
use parking_lot::RwLock;

use crate::config::PatternLayout;

const MICROS_PER_MINUTE: u64 = 60_000_000;
const NANOS_PER_MINUTE: u64 = 60_000_000_000;

/// Tempo of the sequencer plus the tick, step, quarter and song durations at
/// that tempo.
///
/// A BPM of zero is invalid: every duration is zero and the transport does
/// not advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerMetrics {
    layout: PatternLayout,
    bpm: u32,
    quarter_us: u64,
    tick_us: u64,
    step_us: u64,
    song_us: u64,
    tick_nanos: u64,
}

impl SequencerMetrics {
    pub fn new(bpm: u32, layout: PatternLayout) -> Self {
        let mut metrics = Self {
            layout,
            bpm: 0,
            quarter_us: 0,
            tick_us: 0,
            step_us: 0,
            song_us: 0,
            tick_nanos: 0,
        };
        metrics.set_bpm(bpm);
        metrics
    }

    pub fn set_bpm(&mut self, bpm: u32) {
        self.bpm = bpm;
        let tpq = self.layout.ticks_per_quarter() as u64;
        if bpm == 0 || tpq == 0 {
            self.quarter_us = 0;
            self.tick_us = 0;
            self.step_us = 0;
            self.song_us = 0;
            self.tick_nanos = 0;
            return;
        }

        let bpm = u64::from(bpm);
        self.quarter_us = MICROS_PER_MINUTE / bpm;
        self.tick_us = self.quarter_us / tpq;
        self.step_us = self.quarter_us * self.layout.ticks_per_step as u64 / tpq;
        self.song_us = self.step_us * self.layout.steps() as u64;
        self.tick_nanos = NANOS_PER_MINUTE / (bpm * tpq);
    }

    pub fn bpm(&self) -> u32 {
        self.bpm
    }

    pub fn layout(&self) -> &PatternLayout {
        &self.layout
    }

    pub fn is_valid(&self) -> bool {
        self.tick_nanos > 0
    }

    pub fn quarter_micros(&self) -> u64 {
        self.quarter_us
    }

    pub fn tick_micros(&self) -> u64 {
        self.tick_us
    }

    pub fn step_micros(&self) -> u64 {
        self.step_us
    }

    pub fn song_micros(&self) -> u64 {
        self.song_us
    }

    pub fn tick_nanos(&self) -> u64 {
        self.tick_nanos
    }

    /// Length of one tick; zero when the metrics are invalid.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_nanos(self.tick_nanos)
    }

    pub fn step_duration(&self) -> Duration {
        Duration::from_nanos(self.tick_nanos * self.layout.ticks_per_step as u64)
    }

    pub fn ticks_to_micros(&self, ticks: u64) -> u64 {
        ticks * self.tick_us
    }

    pub fn micros_to_ticks(&self, micros: u64) -> u64 {
        if self.tick_us == 0 {
            return 0;
        }
        micros / self.tick_us
    }
}

/// Tempo implied by the length of a quarter note in microseconds.
pub fn bpm_from_micros(quarter_micros: u64) -> u32 {
    if quarter_micros < 1 {
        return 0;
    }
    (MICROS_PER_MINUTE / quarter_micros) as u32
}

/// Shared handle to the metrics. Written by the UI side or the MIDI clock,
/// read by the engine once per tick.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    inner: Arc<RwLock<SequencerMetrics>>,
}

impl MetricsHandle {
    pub fn new(bpm: u32, layout: PatternLayout) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SequencerMetrics::new(bpm, layout))),
        }
    }

    /// Snapshot of the current metrics.
    pub fn get(&self) -> SequencerMetrics {
        *self.inner.read()
    }

    pub fn bpm(&self) -> u32 {
        self.inner.read().bpm()
    }

    pub fn set_bpm(&self, bpm: u32) {
        let mut metrics = self.inner.write();
        if metrics.bpm() != bpm {
            metrics.set_bpm(bpm);
            tracing::debug!(bpm, "tempo changed");
        }
    }

    pub fn layout(&self) -> PatternLayout {
        *self.inner.read().layout()
    }
}

impl TempoSink for MetricsHandle {
    fn tempo_changed(&self, bpm: u32) {
        self.set_bpm(bpm);
    }
}
