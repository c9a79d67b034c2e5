//! Step sequencer engine.
//!
//! A fixed grid of [`Track`]s and steps is played by a dedicated scheduler
//! thread one tick at a time. Generated notes go to a [`MidiSink`], which in
//! a running application is the [`beatmaker_midi::MidiController`].
//!
//! [`MidiSink`]: beatmaker_midi::MidiSink

use beatmaker_midi::MidiError;
use thiserror::Error;

pub mod app;
pub mod capture;
pub mod config;
pub mod control;
pub mod engine;
pub mod listener;
pub mod metrics;
pub mod model;
pub mod position;
pub mod sequencer;

pub use app::Beatmaker;
pub use capture::{CaptureSession, CaptureUpdate};
pub use config::{JitterSettings, PatternLayout, RewindPolicy, SequencerSettings};
pub use control::{TickAdvance, TransportControl, TransportMode};
pub use engine::{CycleOutcome, JitterStats, Scheduler};
pub use listener::{ChannelListener, SequencerEvent, SequencerListener};
pub use metrics::{bpm_from_micros, MetricsHandle, SequencerMetrics};
pub use model::{ElementConfig, ElementData, ElementId, NoteState, Track};
pub use position::Position;
pub use sequencer::Sequencer;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("invalid pattern layout: {0}")]
    InvalidLayout(String),
    #[error("metrics were created for a different pattern layout")]
    LayoutMismatch,
    #[error("the sequencer engine thread is running")]
    EngineRunning,
    #[error(transparent)]
    Midi(#[from] MidiError),
}
