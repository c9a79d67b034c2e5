use std::path::{Path, PathBuf};
use std::time::Duration;

use beatmaker_midi::config::{load_json, save_json, settings_file};
use serde::{Deserialize, Serialize};

use crate::SequencerError;

pub const DEFAULT_BPM: u32 = 110;

pub const NUM_TRACKS: usize = 8;
pub const NUM_MEASURES: usize = 1;
pub const NUM_QUARTERS_PER_MEASURE: usize = 4;
pub const STEPS_PER_QUARTER_NOTE: usize = 4;
pub const NUM_STEPS: usize = NUM_MEASURES * NUM_QUARTERS_PER_MEASURE * STEPS_PER_QUARTER_NOTE;
pub const TICKS_PER_STEP: usize = 64;
pub const TICKS_PER_QUARTER_NOTE: usize = STEPS_PER_QUARTER_NOTE * TICKS_PER_STEP;

pub const DEFAULT_MIDI_CHANNEL: u8 = 0;
pub const DEFAULT_NOTE_PITCH: u8 = 36;
/// Default pitch per track, a basic GM drum kit. Tracks past the end use
/// [`DEFAULT_NOTE_PITCH`].
pub const DEFAULT_TRACK_PITCH: [u8; 8] = [36, 37, 38, 39, 40, 42, 46, 49];
pub const DEFAULT_NOTE_VELOCITY: u8 = 72;
/// Note length in ticks.
pub const DEFAULT_NOTE_DURATION: u32 = TICKS_PER_STEP as u32;

/// Grid dimensions of a pattern.
///
/// A pattern has `measures` measures of `quarters_per_measure` quarter notes,
/// each split into `steps_per_quarter` steps of `ticks_per_step` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternLayout {
    pub tracks: usize,
    pub measures: usize,
    pub quarters_per_measure: usize,
    pub steps_per_quarter: usize,
    pub ticks_per_step: usize,
}

impl Default for PatternLayout {
    fn default() -> Self {
        Self {
            tracks: NUM_TRACKS,
            measures: NUM_MEASURES,
            quarters_per_measure: NUM_QUARTERS_PER_MEASURE,
            steps_per_quarter: STEPS_PER_QUARTER_NOTE,
            ticks_per_step: TICKS_PER_STEP,
        }
    }
}

impl PatternLayout {
    pub fn quarters(&self) -> usize {
        self.measures * self.quarters_per_measure
    }

    pub fn steps(&self) -> usize {
        self.quarters() * self.steps_per_quarter
    }

    pub fn ticks_per_quarter(&self) -> usize {
        self.steps_per_quarter * self.ticks_per_step
    }

    pub fn total_ticks(&self) -> u64 {
        (self.steps() * self.ticks_per_step) as u64
    }

    pub fn validate(&self) -> Result<(), SequencerError> {
        let fields = [
            ("tracks", self.tracks),
            ("measures", self.measures),
            ("quarters_per_measure", self.quarters_per_measure),
            ("steps_per_quarter", self.steps_per_quarter),
            ("ticks_per_step", self.ticks_per_step),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(SequencerError::InvalidLayout(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

/// What a rewind does while the transport is paused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewindPolicy {
    /// Reset the position right away.
    #[default]
    Immediate,
    /// Keep the position and rewind on the first tick after resuming.
    OnResume,
}

/// Scheduling diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterSettings {
    pub enabled: bool,
    pub tick_limit_ms: u64,
    pub step_limit_ms: u64,
    pub report_interval_ms: u64,
    /// Number of samples in the moving averages.
    pub window: u64,
}

impl Default for JitterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_limit_ms: 20,
            step_limit_ms: 20,
            report_interval_ms: 5_000,
            window: 10,
        }
    }
}

impl JitterSettings {
    pub fn tick_limit(&self) -> Duration {
        Duration::from_millis(self.tick_limit_ms)
    }

    pub fn step_limit(&self) -> Duration {
        Duration::from_millis(self.step_limit_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Persisted sequencer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerSettings {
    pub bpm: u32,
    pub layout: PatternLayout,
    pub note_duration_ticks: u32,
    /// Start playback as soon as the application is up.
    pub autostart: bool,
    pub rewind_policy: RewindPolicy,
    pub jitter: JitterSettings,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            layout: PatternLayout::default(),
            note_duration_ticks: DEFAULT_NOTE_DURATION,
            autostart: false,
            rewind_policy: RewindPolicy::default(),
            jitter: JitterSettings::default(),
        }
    }
}

impl SequencerSettings {
    pub fn load_from(path: &Path) -> Self {
        load_json(path)
    }

    pub fn save_to(&self, path: &Path) {
        save_json(self, path);
    }
}

pub fn settings_path() -> Option<PathBuf> {
    settings_file("sequencer.json")
}

/// Load settings from the platform config directory. Returns defaults if
/// loading fails.
pub fn load() -> SequencerSettings {
    settings_path()
        .map(|path| SequencerSettings::load_from(&path))
        .unwrap_or_default()
}

pub fn save(settings: &SequencerSettings) {
    if let Some(path) = settings_path() {
        settings.save_to(&path);
    }
}
