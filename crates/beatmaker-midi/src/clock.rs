//! Tempo recovery from incoming MIDI realtime clock messages.

use std::sync::Arc;

use crate::{now_micros, MidiTimestamp};

/// Length of one measurement window in microseconds.
pub const MEASUREMENT_WINDOW_US: u64 = 1_000_000;
/// A gap between two clocks longer than this restarts the measurement.
pub const STALL_GAP_US: u64 = 1_000_000;
/// Measure length the recovered tempo is expressed against.
pub const QUARTERS_PER_MEASURE: u32 = 4;
/// Clock messages per measure, 24 per quarter note.
pub const CLOCKS_PER_MEASURE: u64 = 24 * QUARTERS_PER_MEASURE as u64;

/// Receiver of recovered tempo values.
pub trait TempoSink: Send + Sync {
    fn tempo_changed(&self, bpm: u32);
}

/// Derives BPM from the cadence of realtime clock (`0xF8`) messages.
pub struct MidiClock {
    quarters_per_measure: u32,
    window_start: MidiTimestamp,
    count: u64,
    last_update: MidiTimestamp,
    bpm: u32,
    sink: Option<Arc<dyn TempoSink>>,
}

impl MidiClock {
    pub fn new(quarters_per_measure: u32) -> Self {
        Self {
            quarters_per_measure: quarters_per_measure.max(1),
            window_start: 0,
            count: 0,
            last_update: 0,
            bpm: 0,
            sink: None,
        }
    }

    /// Forwards every changed estimate to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn TempoSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn set_sink(&mut self, sink: Option<Arc<dyn TempoSink>>) {
        self.sink = sink;
    }

    /// Last recovered tempo, 0 until one full window has been measured.
    pub fn bpm(&self) -> u32 {
        self.bpm
    }

    /// Restarts measurement; the next clock opens a new window.
    pub fn reset(&mut self) {
        self.window_start = 0;
        self.count = 0;
        self.last_update = 0;
    }

    /// Registers one clock message received now.
    pub fn update(&mut self) -> Option<u32> {
        self.update_at(now_micros())
    }

    /// Registers one clock message received at `now` (microseconds).
    ///
    /// Returns the new tempo when the rounded estimate changed.
    pub fn update_at(&mut self, now: MidiTimestamp) -> Option<u32> {
        let gap = now.saturating_sub(self.last_update);
        let stalled = self.last_update == 0 || gap > STALL_GAP_US;
        self.last_update = now;
        if stalled {
            self.window_start = now;
            self.count = 0;
            return None;
        }

        self.count += 1;
        let elapsed = now.saturating_sub(self.window_start);
        if elapsed < MEASUREMENT_WINDOW_US {
            return None;
        }

        let updates_per_second = self.count as f64 / (elapsed as f64 / 1_000_000.0);
        let measured = updates_per_second * 60.0 * f64::from(self.quarters_per_measure)
            / CLOCKS_PER_MEASURE as f64;

        self.window_start = now;
        self.count = 0;

        let rounded = (measured + 0.5) as u32;
        if rounded == self.bpm {
            return None;
        }
        self.bpm = rounded;
        tracing::debug!(bpm = rounded, measured, "midi clock tempo changed");
        if let Some(sink) = &self.sink {
            sink.tempo_changed(rounded);
        }
        Some(rounded)
    }
}
