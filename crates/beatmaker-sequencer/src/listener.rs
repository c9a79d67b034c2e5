use beatmaker_midi::MidiNote;
use crossbeam_channel::Sender;

use crate::position::Position;

/// Observer of playback and capture.
///
/// Position updates are delivered on the engine thread once per tick, so
/// implementations must return quickly.
pub trait SequencerListener: Send + Sync {
    fn on_position(&self, _position: Position, _step_changed: bool) {}

    /// A capture finished. An empty list means "reset to default".
    fn on_capture_finished(&self, _notes: &[MidiNote]) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerEvent {
    Position {
        position: Position,
        step_changed: bool,
    },
    CaptureFinished(Vec<MidiNote>),
}

/// Forwards sequencer notifications to a channel.
///
/// Tick updates are skipped unless `ticks` is set; step changes and
/// captures are always sent. Sending never blocks the engine: events are
/// dropped when a bounded channel is full.
pub struct ChannelListener {
    tx: Sender<SequencerEvent>,
    ticks: bool,
}

impl ChannelListener {
    pub fn new(tx: Sender<SequencerEvent>) -> Self {
        Self { tx, ticks: false }
    }

    pub fn with_ticks(mut self, ticks: bool) -> Self {
        self.ticks = ticks;
        self
    }
}

impl SequencerListener for ChannelListener {
    fn on_position(&self, position: Position, step_changed: bool) {
        if step_changed || self.ticks {
            let _ = self.tx.try_send(SequencerEvent::Position {
                position,
                step_changed,
            });
        }
    }

    fn on_capture_finished(&self, notes: &[MidiNote]) {
        let _ = self.tx.try_send(SequencerEvent::CaptureFinished(notes.to_vec()));
    }
}
