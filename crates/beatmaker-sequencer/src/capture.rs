use std::collections::BTreeMap;
use std::sync::Weak;

use beatmaker_midi::{MidiEvent, MidiInputListener, MidiNote};

use crate::sequencer::Core;

/// Outcome of feeding one note to a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureUpdate {
    /// No capture running, or the note is on another channel.
    Ignored,
    Recorded,
    /// The capture ended. A release ends it without notes.
    Finished(Vec<MidiNote>),
}

/// Records the notes of a chord played on a MIDI keyboard.
///
/// The first note fixes the channel and notes on other channels are
/// ignored. A held pitch keeps its latest velocity. Any release on the
/// channel ends the capture and discards what was held, so only an explicit
/// [`CaptureSession::stop`] hands the chord over.
#[derive(Debug, Default)]
pub struct CaptureSession {
    active: bool,
    channel: Option<u8>,
    notes: BTreeMap<u8, MidiNote>,
}

impl CaptureSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn channel(&self) -> Option<u8> {
        self.channel
    }

    /// Begins a new capture. A capture already running is finished first
    /// and its notes are returned.
    pub fn start(&mut self) -> Option<Vec<MidiNote>> {
        let previous = self.active.then(|| self.stop());
        self.active = true;
        previous
    }

    pub fn input(&mut self, note: MidiNote) -> CaptureUpdate {
        if !self.active {
            return CaptureUpdate::Ignored;
        }
        let channel = *self.channel.get_or_insert(note.channel);
        if note.channel != channel {
            return CaptureUpdate::Ignored;
        }
        if note.velocity > 0 {
            self.notes.insert(note.pitch, note);
            CaptureUpdate::Recorded
        } else {
            self.stop();
            CaptureUpdate::Finished(Vec::new())
        }
    }

    /// Ends the capture and returns the notes by ascending pitch.
    pub fn stop(&mut self) -> Vec<MidiNote> {
        self.active = false;
        self.channel = None;
        std::mem::take(&mut self.notes).into_values().collect()
    }
}

/// Feeds note input from the MIDI dispatcher into the sequencer's capture.
///
/// Holds the sequencer weakly so the dispatcher does not keep it alive.
pub(crate) struct CaptureInput {
    pub(crate) core: Weak<Core>,
}

impl MidiInputListener for CaptureInput {
    fn on_event(&self, event: &MidiEvent) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match *event {
            MidiEvent::NoteOn {
                channel,
                pitch,
                velocity,
            } => core.capture_input(MidiNote::new(channel, pitch, velocity)),
            MidiEvent::NoteOff { channel, pitch, .. } => {
                if core.is_capture_active() {
                    core.capture_input(MidiNote::new(channel, pitch, 0));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_ends_capture_without_notes() {
        let mut capture = CaptureSession::new();
        capture.start();
        assert_eq!(capture.input(MidiNote::new(2, 60, 90)), CaptureUpdate::Recorded);
        assert_eq!(capture.input(MidiNote::new(2, 64, 90)), CaptureUpdate::Recorded);
        assert_eq!(
            capture.input(MidiNote::new(2, 60, 0)),
            CaptureUpdate::Finished(Vec::new())
        );
        assert!(!capture.is_active());
        assert!(capture.stop().is_empty());
    }

    #[test]
    fn first_note_locks_the_channel() {
        let mut capture = CaptureSession::new();
        capture.start();
        capture.input(MidiNote::new(3, 60, 90));
        assert_eq!(capture.channel(), Some(3));
        assert_eq!(capture.input(MidiNote::new(4, 62, 90)), CaptureUpdate::Ignored);
        assert_eq!(capture.input(MidiNote::new(4, 60, 0)), CaptureUpdate::Ignored);
        assert_eq!(capture.stop(), vec![MidiNote::new(3, 60, 90)]);
    }

    #[test]
    fn stop_returns_notes_by_pitch() {
        let mut capture = CaptureSession::new();
        capture.start();
        capture.input(MidiNote::new(0, 64, 90));
        capture.input(MidiNote::new(0, 60, 80));
        assert_eq!(
            capture.stop(),
            vec![MidiNote::new(0, 60, 80), MidiNote::new(0, 64, 90)]
        );
    }

    #[test]
    fn last_velocity_wins() {
        let mut capture = CaptureSession::new();
        capture.start();
        capture.input(MidiNote::new(0, 60, 10));
        capture.input(MidiNote::new(0, 60, 99));
        assert_eq!(capture.stop(), vec![MidiNote::new(0, 60, 99)]);
    }

    #[test]
    fn inactive_session_ignores_input() {
        let mut capture = CaptureSession::new();
        assert_eq!(capture.input(MidiNote::new(0, 60, 90)), CaptureUpdate::Ignored);
        assert!(capture.stop().is_empty());
    }

    #[test]
    fn restart_finishes_running_capture() {
        let mut capture = CaptureSession::new();
        assert_eq!(capture.start(), None);
        capture.input(MidiNote::new(1, 40, 90));
        assert_eq!(capture.start(), Some(vec![MidiNote::new(1, 40, 90)]));
        assert!(capture.is_active());
        assert_eq!(capture.channel(), None);
    }
}
