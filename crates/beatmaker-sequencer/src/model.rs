//! Tracks, steps and the notes they play.

use std::collections::BTreeMap;

use beatmaker_midi::{MidiNote, MidiPacket, MidiSink};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::config::{
    DEFAULT_MIDI_CHANNEL, DEFAULT_NOTE_PITCH, DEFAULT_NOTE_VELOCITY, DEFAULT_TRACK_PITCH,
};

/// The channel and notes an element plays when triggered.
///
/// A config without notes plays nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementConfig {
    channel: u8,
    notes: SmallVec<[MidiNote; 4]>,
}

impl Default for ElementConfig {
    fn default() -> Self {
        Self::single(
            DEFAULT_MIDI_CHANNEL,
            DEFAULT_NOTE_PITCH,
            DEFAULT_NOTE_VELOCITY,
        )
    }
}

impl ElementConfig {
    /// Config without notes.
    pub fn empty(channel: u8) -> Self {
        Self {
            channel: channel & 0x0f,
            notes: SmallVec::new(),
        }
    }

    pub fn single(channel: u8, pitch: u8, velocity: u8) -> Self {
        let mut config = Self::empty(channel);
        config.set_note(MidiNote::new(channel, pitch, velocity));
        config
    }

    pub fn chord(channel: u8, notes: impl IntoIterator<Item = MidiNote>) -> Self {
        let mut config = Self::empty(channel);
        config.set_notes(notes);
        config
    }

    /// Default config of the track at `index`.
    pub fn for_track(index: usize) -> Self {
        let pitch = DEFAULT_TRACK_PITCH
            .get(index)
            .copied()
            .unwrap_or(DEFAULT_NOTE_PITCH);
        Self::single(DEFAULT_MIDI_CHANNEL, pitch, DEFAULT_NOTE_VELOCITY)
    }

    /// Back to the default channel and single default note.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel & 0x0f;
    }

    pub fn notes(&self) -> &[MidiNote] {
        &self.notes
    }

    pub fn has_notes(&self) -> bool {
        !self.notes.is_empty()
    }

    /// The note when the config holds exactly one.
    pub fn single_note(&self) -> Option<MidiNote> {
        match self.notes.as_slice() {
            [note] => Some(*note),
            _ => None,
        }
    }

    pub fn set_note(&mut self, note: MidiNote) {
        self.notes.clear();
        self.notes.push(note);
    }

    pub fn set_notes(&mut self, notes: impl IntoIterator<Item = MidiNote>) {
        self.notes.clear();
        self.notes.extend(notes);
    }

    pub fn add_note(&mut self, note: MidiNote) {
        self.notes.push(note);
    }

    pub fn clear_notes(&mut self) {
        self.notes.clear();
    }
}

/// Addresses a track or one of its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementId {
    Track(usize),
    Step { track: usize, step: usize },
}

impl ElementId {
    pub fn track(&self) -> usize {
        match *self {
            ElementId::Track(track) | ElementId::Step { track, .. } => track,
        }
    }

    /// The owning track of a step.
    pub fn parent(&self) -> Option<ElementId> {
        match *self {
            ElementId::Track(_) => None,
            ElementId::Step { track, .. } => Some(ElementId::Track(track)),
        }
    }
}

/// State shared by every element: an optional config and the active flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementData {
    pub config: Option<ElementConfig>,
    pub active: bool,
}

impl ElementData {
    pub fn clear(&mut self) {
        self.config = None;
        self.active = false;
    }
}

/// A sounding note and the ticks it has left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteState {
    pub note: MidiNote,
    pub remaining: u32,
    pub active: bool,
}

impl NoteState {
    fn new(note: MidiNote, duration: u32) -> Self {
        Self {
            note,
            remaining: duration,
            active: true,
        }
    }
}

/// One lane of the sequencer: its own element data, a fixed row of steps
/// and the notes currently sounding.
pub struct Track {
    index: usize,
    name: RwLock<String>,
    element: RwLock<ElementData>,
    steps: RwLock<Vec<ElementData>>,
    playing: Mutex<BTreeMap<u8, NoteState>>,
    note_duration: u32,
}

impl Track {
    pub fn new(index: usize, steps: usize, note_duration: u32) -> Self {
        Self {
            index,
            name: RwLock::new(format!("Track{index}")),
            element: RwLock::new(ElementData {
                config: Some(ElementConfig::for_track(index)),
                active: false,
            }),
            steps: RwLock::new(vec![ElementData::default(); steps]),
            playing: Mutex::new(BTreeMap::new()),
            note_duration,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn num_steps(&self) -> usize {
        self.steps.read().len()
    }

    pub fn data(&self) -> ElementData {
        self.element.read().clone()
    }

    pub fn config(&self) -> Option<ElementConfig> {
        self.element.read().config.clone()
    }

    pub fn set_config(&self, config: Option<ElementConfig>) {
        self.element.write().config = config;
    }

    pub fn set_active(&self, active: bool) {
        self.element.write().active = active;
    }

    /// Edits the track's own element data in place.
    pub fn update_data<R>(&self, edit: impl FnOnce(&mut ElementData) -> R) -> R {
        edit(&mut self.element.write())
    }

    pub fn step(&self, step: usize) -> Option<ElementData> {
        self.steps.read().get(step).cloned()
    }

    /// Edits one step in place. Returns `None` when `step` is out of range.
    pub fn update_step_data<R>(
        &self,
        step: usize,
        edit: impl FnOnce(&mut ElementData) -> R,
    ) -> Option<R> {
        self.steps.write().get_mut(step).map(edit)
    }

    pub fn is_step_active(&self, step: usize) -> bool {
        self.steps.read().get(step).is_some_and(|data| data.active)
    }

    /// Clears every step.
    pub fn clear(&self) {
        for step in self.steps.write().iter_mut() {
            step.clear();
        }
    }

    /// Config a step plays: its own, or the track's when it has none.
    pub fn effective_config(&self, step: Option<usize>) -> Option<ElementConfig> {
        let own = match step {
            Some(step) => self.steps.read().get(step)?.config.clone(),
            None => None,
        };
        own.or_else(|| self.config())
    }

    /// Notes currently sounding, by pitch.
    pub fn sounding_notes(&self) -> Vec<MidiNote> {
        self.playing
            .lock()
            .values()
            .filter(|state| state.active)
            .map(|state| state.note)
            .collect()
    }

    /// Starts the notes of a step, or of the track itself for `None`.
    ///
    /// A pitch that is still sounding is released first and restarted with a
    /// fresh duration.
    pub fn notes_on(&self, step: Option<usize>, sink: &dyn MidiSink) {
        let Some(config) = self.effective_config(step) else {
            return;
        };
        let mut playing = self.playing.lock();
        for note in config.notes() {
            let note = note.on_channel(config.channel());
            let fresh = NoteState::new(note, self.note_duration);
            match playing.get_mut(&note.pitch) {
                Some(state) => {
                    if state.active {
                        sink.enqueue(MidiPacket::note_off(state.note));
                    }
                    *state = fresh;
                }
                None => {
                    playing.insert(note.pitch, fresh);
                }
            }
            sink.enqueue(MidiPacket::note_on(note));
        }
    }

    /// Counts every sounding note down by one tick and releases the expired
    /// ones.
    pub fn update_notes(&self, sink: &dyn MidiSink) {
        let mut playing = self.playing.lock();
        if playing.is_empty() {
            return;
        }
        playing.retain(|_, state| {
            if !state.active {
                return true;
            }
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining == 0 {
                sink.enqueue(MidiPacket::note_off(state.note));
                return false;
            }
            true
        });
    }

    /// Releases every sounding note.
    pub fn all_notes_off(&self, sink: &dyn MidiSink) {
        let mut playing = self.playing.lock();
        for state in playing.values().filter(|state| state.active) {
            sink.enqueue(MidiPacket::note_off(state.note));
        }
        playing.clear();
    }

    pub fn update_tick(&self, sink: &dyn MidiSink) {
        self.update_notes(sink);
    }

    /// Triggers `step` if it is active.
    pub fn update_step(&self, step: usize, sink: &dyn MidiSink) {
        if self.is_step_active(step) {
            self.notes_on(Some(step), sink);
        }
    }
}
