use std::fmt;

use crate::config::PatternLayout;

/// Playback position, derived from a single tick counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Position {
    pub tick: u64,
    pub step: usize,
    pub quarter: usize,
    pub tick_in_quarter: usize,
    pub quarter_in_measure: usize,
    pub step_in_quarter: usize,
    pub tick_in_step: usize,
}

impl Position {
    pub fn at(tick: u64, layout: &PatternLayout) -> Self {
        let tps = layout.ticks_per_step.max(1) as u64;
        let tpq = layout.ticks_per_quarter().max(1) as u64;
        let qpm = layout.quarters_per_measure.max(1);
        let quarter = (tick / tpq) as usize;
        let tick_in_quarter = tick % tpq;
        Self {
            tick,
            step: (tick / tps) as usize,
            quarter,
            tick_in_quarter: tick_in_quarter as usize,
            quarter_in_measure: quarter % qpm,
            step_in_quarter: (tick_in_quarter / tps) as usize,
            tick_in_step: (tick % tps) as usize,
        }
    }

    /// Whether this is the first tick of a step.
    pub fn is_step_start(&self) -> bool {
        self.tick_in_step == 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>3}.{}.{:<2} (step {:>2}, tick {})",
            self.quarter + 1,
            self.step_in_quarter + 1,
            self.tick_in_step,
            self.step,
            self.tick
        )
    }
}
