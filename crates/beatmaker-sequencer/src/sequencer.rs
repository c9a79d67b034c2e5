use std::sync::Arc;
use std::time::Duration;

use beatmaker_midi::{ListenerId, ListenerSet, MidiInputListener, MidiNote, MidiSink};
use parking_lot::Mutex;

use crate::capture::{CaptureInput, CaptureSession, CaptureUpdate};
use crate::config::{JitterSettings, PatternLayout, SequencerSettings};
use crate::control::{TransportControl, TransportMode};
use crate::engine::{EngineThread, Scheduler};
use crate::listener::SequencerListener;
use crate::metrics::MetricsHandle;
use crate::model::{ElementConfig, ElementData, ElementId, Track};
use crate::position::Position;
use crate::SequencerError;

/// State shared by the control surface, the engine thread and the capture
/// input listener.
pub(crate) struct Core {
    pub(crate) layout: PatternLayout,
    pub(crate) control: TransportControl,
    pub(crate) metrics: MetricsHandle,
    pub(crate) tracks: Vec<Track>,
    pub(crate) sink: Arc<dyn MidiSink>,
    pub(crate) jitter: JitterSettings,
    listeners: ListenerSet<dyn SequencerListener>,
    capture: Mutex<CaptureSession>,
}

impl Core {
    pub(crate) fn notify_position(&self, position: Position, step_changed: bool) {
        self.listeners
            .for_each(|listener| listener.on_position(position, step_changed));
    }

    pub(crate) fn all_tracks_off(&self) {
        for track in &self.tracks {
            track.all_notes_off(self.sink.as_ref());
        }
        self.sink.flush();
    }

    pub(crate) fn is_capture_active(&self) -> bool {
        self.capture.lock().is_active()
    }

    pub(crate) fn capture_input(&self, note: MidiNote) {
        let update = self.capture.lock().input(note);
        if let CaptureUpdate::Finished(notes) = update {
            self.capture_finished(&notes);
        }
    }

    fn start_capture(&self) {
        let previous = self.capture.lock().start();
        if let Some(notes) = previous {
            self.capture_finished(&notes);
        }
    }

    fn stop_capture(&self) {
        let notes = {
            let mut capture = self.capture.lock();
            if !capture.is_active() {
                return;
            }
            capture.stop()
        };
        self.capture_finished(&notes);
    }

    fn capture_finished(&self, notes: &[MidiNote]) {
        let pitches: Vec<u8> = notes.iter().map(|note| note.pitch).collect();
        tracing::debug!(?pitches, "capture finished");
        self.listeners
            .for_each(|listener| listener.on_capture_finished(notes));
    }

    fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }
}

/// The step sequencer: a grid of tracks and steps, its transport and the
/// engine thread playing it.
///
/// Every method can be called from any thread. Out of range track or step
/// indices are ignored.
pub struct Sequencer {
    core: Arc<Core>,
    engine: Mutex<Option<EngineThread>>,
}

impl Sequencer {
    pub fn new(
        settings: &SequencerSettings,
        metrics: MetricsHandle,
        sink: Arc<dyn MidiSink>,
    ) -> Result<Self, SequencerError> {
        let layout = settings.layout;
        layout.validate()?;
        if metrics.layout() != layout {
            return Err(SequencerError::LayoutMismatch);
        }

        let tracks = (0..layout.tracks)
            .map(|index| Track::new(index, layout.steps(), settings.note_duration_ticks))
            .collect();
        tracing::debug!(
            tracks = layout.tracks,
            steps = layout.steps(),
            ticks = layout.total_ticks(),
            "allocated sequencer"
        );

        Ok(Self {
            core: Arc::new(Core {
                layout,
                control: TransportControl::new(layout, settings.rewind_policy),
                metrics,
                tracks,
                sink,
                jitter: settings.jitter,
                listeners: ListenerSet::new(),
                capture: Mutex::new(CaptureSession::new()),
            }),
            engine: Mutex::new(None),
        })
    }

    /// Spawns the engine thread. Does nothing if it is already running.
    pub fn spawn_engine(&self, priority: i32, join_timeout: Duration) -> Result<(), SequencerError> {
        let mut engine = self.engine.lock();
        if engine.is_none() {
            *engine = Some(EngineThread::spawn(
                Scheduler::new(Arc::clone(&self.core)),
                priority,
                join_timeout,
            )?);
        }
        Ok(())
    }

    pub fn is_engine_running(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// Stops playback and the engine thread. Sounding notes are released
    /// by the engine on its way out.
    pub fn shutdown(&self) {
        let engine = self.engine.lock().take();
        if let Some(mut engine) = engine {
            engine.stop();
        } else {
            self.core.control.stop();
        }
    }

    /// A scheduler driven by the caller instead of the engine thread, for
    /// offline rendering and tests.
    pub fn offline(&self) -> Result<Scheduler, SequencerError> {
        if self.is_engine_running() {
            return Err(SequencerError::EngineRunning);
        }
        Ok(Scheduler::new(Arc::clone(&self.core)))
    }

    pub fn start(&self) {
        tracing::debug!("sequencer start");
        self.core.control.start();
    }

    pub fn stop(&self) {
        tracing::debug!("sequencer stop");
        self.core.control.stop();
    }

    pub fn pause(&self) {
        self.core.control.pause();
    }

    pub fn resume(&self) {
        self.core.control.resume();
    }

    /// Rewinds to the first tick. While not playing, listeners immediately
    /// get a position update with `step_changed` set.
    pub fn rewind(&self) {
        self.core.control.rewind();
        if !self.core.control.is_playing() {
            self.core.notify_position(self.core.control.position(), true);
        }
    }

    /// Moves to `tick` while not playing.
    pub fn seek(&self, tick: u64) -> bool {
        self.core.control.seek(tick)
    }

    pub fn mode(&self) -> TransportMode {
        self.core.control.mode()
    }

    pub fn is_playing(&self) -> bool {
        self.core.control.is_playing()
    }

    pub fn position(&self) -> Position {
        self.core.control.position()
    }

    pub fn control(&self) -> &TransportControl {
        &self.core.control
    }

    pub fn metrics(&self) -> MetricsHandle {
        self.core.metrics.clone()
    }

    pub fn bpm(&self) -> u32 {
        self.core.metrics.bpm()
    }

    pub fn set_bpm(&self, bpm: u32) {
        self.core.metrics.set_bpm(bpm);
    }

    pub fn layout(&self) -> &PatternLayout {
        &self.core.layout
    }

    pub fn num_tracks(&self) -> usize {
        self.core.tracks.len()
    }

    pub fn num_steps(&self) -> usize {
        self.core.layout.steps()
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.core.track(index)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.core.tracks
    }

    pub fn element(&self, id: ElementId) -> Option<ElementData> {
        match id {
            ElementId::Track(track) => self.core.track(track).map(Track::data),
            ElementId::Step { track, step } => self.core.track(track)?.step(step),
        }
    }

    /// The element's own config.
    pub fn config(&self, id: ElementId) -> Option<ElementConfig> {
        self.element(id)?.config
    }

    /// The config the element plays, falling back to its track's.
    pub fn effective_config(&self, id: ElementId) -> Option<ElementConfig> {
        match id {
            ElementId::Track(track) => self.core.track(track)?.effective_config(None),
            ElementId::Step { track, step } => self.core.track(track)?.effective_config(Some(step)),
        }
    }

    pub fn set_config(&self, id: ElementId, config: Option<ElementConfig>) -> bool {
        self.edit(id, |data| data.config = config)
    }

    pub fn set_active(&self, id: ElementId, active: bool) -> bool {
        self.edit(id, |data| data.active = active)
    }

    /// Flips the active flag and returns the new value.
    pub fn toggle(&self, id: ElementId) -> Option<bool> {
        let mut active = None;
        self.edit(id, |data| {
            data.active = !data.active;
            active = Some(data.active);
        });
        active
    }

    pub fn is_active(&self, id: ElementId) -> bool {
        self.element(id).is_some_and(|data| data.active)
    }

    pub fn has_data(&self, track: usize, step: usize) -> bool {
        self.is_active(ElementId::Step { track, step })
    }

    /// Resets the element's config and deactivates it. Clearing a track
    /// clears all of its steps.
    pub fn clear_element(&self, id: ElementId) -> bool {
        match id {
            ElementId::Track(track) => match self.core.track(track) {
                Some(track) => {
                    track.clear();
                    true
                }
                None => false,
            },
            ElementId::Step { .. } => self.edit(id, ElementData::clear),
        }
    }

    /// Clears every step of every track.
    pub fn clear_pattern(&self) {
        for track in &self.core.tracks {
            track.clear();
        }
    }

    fn edit(&self, id: ElementId, edit: impl FnOnce(&mut ElementData)) -> bool {
        match id {
            ElementId::Track(track) => match self.core.track(track) {
                Some(track) => {
                    track.update_data(edit);
                    true
                }
                None => false,
            },
            ElementId::Step { track, step } => self
                .core
                .track(track)
                .and_then(|track| track.update_step_data(step, edit))
                .is_some(),
        }
    }

    /// Releases every sounding note and flushes the sink.
    pub fn all_notes_off(&self) {
        self.core.all_tracks_off();
    }

    pub fn start_capture(&self) {
        self.core.start_capture();
    }

    pub fn stop_capture(&self) {
        self.core.stop_capture();
    }

    pub fn is_capture_active(&self) -> bool {
        self.core.is_capture_active()
    }

    /// Feeds a note to the running capture. Velocity 0 is a release.
    pub fn capture_input(&self, note: MidiNote) {
        self.core.capture_input(note);
    }

    /// Listener to register with the MIDI dispatcher so played notes reach
    /// the capture.
    pub fn capture_listener(&self) -> Arc<dyn MidiInputListener> {
        Arc::new(CaptureInput {
            core: Arc::downgrade(&self.core),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn SequencerListener>) -> ListenerId {
        self.core.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.listeners.remove(id)
    }

    pub fn clear_listeners(&self) {
        self.core.listeners.clear();
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
