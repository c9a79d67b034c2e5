use std::fmt;

use serde::{Deserialize, Serialize};

const NOTE_NAMES: [&str; 12] = [
    "A-", "A#", "B-", "C-", "C#", "D-", "D#", "E-", "F-", "F#", "G-", "G#",
];

/// A MIDI note: channel (0-15), pitch (0-127) and velocity (0-127).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiNote {
    pub channel: u8,
    pub pitch: u8,
    pub velocity: u8,
}

impl MidiNote {
    pub fn new(channel: u8, pitch: u8, velocity: u8) -> Self {
        Self {
            channel,
            pitch,
            velocity,
        }
    }

    /// Same note moved to another channel.
    pub fn on_channel(self, channel: u8) -> Self {
        Self { channel, ..self }
    }

    /// Tracker style name of this note's pitch, see [`note_name`].
    pub fn name(&self) -> String {
        note_name(self.pitch)
    }
}

impl fmt::Display for MidiNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (ch {}, vel {})",
            self.name(),
            self.channel,
            self.velocity
        )
    }
}

/// Tracker style note name counted from the lowest piano key (A0 = 21),
/// e.g. `C-3` for middle C. Pitches below the piano range yield `"??"`.
pub fn note_name(pitch: u8) -> String {
    let Some(offset) = pitch.checked_sub(21) else {
        return "??".to_string();
    };
    let name = NOTE_NAMES[usize::from(offset % 12)];
    format!("{name}{}", offset / 12)
}
