//! Application context wiring the MIDI controller to the sequencer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use beatmaker_midi::{ListenerId, MidiController, MidiSettings, TempoSink, TransportProvider};
use parking_lot::Mutex;

use crate::config::SequencerSettings;
use crate::metrics::MetricsHandle;
use crate::sequencer::Sequencer;

/// Owns the controller and the sequencer for the lifetime of the process.
///
/// The controller feeds recovered tempo into the shared metrics and is the
/// sequencer's output sink; the sequencer's capture listens to the
/// controller's input.
pub struct Beatmaker {
    midi_settings: MidiSettings,
    settings: SequencerSettings,
    metrics: MetricsHandle,
    controller: Arc<MidiController>,
    sequencer: Sequencer,
    capture_listener: Mutex<Option<ListenerId>>,
}

impl Beatmaker {
    pub fn create(
        provider: Box<dyn TransportProvider>,
        midi_settings: MidiSettings,
        settings: SequencerSettings,
        midi_settings_path: Option<PathBuf>,
    ) -> Result<Self> {
        settings
            .layout
            .validate()
            .context("invalid sequencer settings")?;

        let metrics = MetricsHandle::new(settings.bpm, settings.layout);
        let tempo_sink: Arc<dyn TempoSink> = Arc::new(metrics.clone());

        let mut controller = MidiController::new(provider, midi_settings.clone(), Some(tempo_sink));
        if let Some(path) = midi_settings_path {
            controller = controller.with_settings_path(path);
        }
        let controller = Arc::new(controller);

        let sequencer = Sequencer::new(&settings, metrics.clone(), controller.clone())
            .context("failed to create sequencer")?;
        let capture = controller.add_input_listener(sequencer.capture_listener());

        tracing::info!(
            bpm = settings.bpm,
            tracks = settings.layout.tracks,
            steps = settings.layout.steps(),
            "beatmaker created"
        );
        Ok(Self {
            midi_settings,
            settings,
            metrics,
            controller,
            sequencer,
            capture_listener: Mutex::new(Some(capture)),
        })
    }

    /// Starts MIDI I/O and the engine thread, then playback if configured.
    pub fn startup(&self) -> Result<()> {
        self.controller
            .start()
            .context("failed to start MIDI controller")?;
        self.sequencer
            .spawn_engine(
                self.midi_settings.priorities.sequencer,
                self.midi_settings.join_timeout(),
            )
            .context("failed to start sequencer engine")?;
        if self.settings.autostart {
            self.sequencer.start();
        }
        tracing::info!(connected = self.controller.is_connected(), "beatmaker started");
        Ok(())
    }

    pub fn pause(&self) {
        self.controller.pause();
    }

    pub fn resume(&self) {
        self.controller.resume();
    }

    /// Stops the engine, then MIDI I/O. Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(capture) = self.capture_listener.lock().take() else {
            return;
        };
        self.sequencer.shutdown();
        self.controller.remove_input_listener(capture);
        self.controller.stop();
        tracing::info!("beatmaker shut down");
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn controller(&self) -> &Arc<MidiController> {
        &self.controller
    }

    pub fn metrics(&self) -> &MetricsHandle {
        &self.metrics
    }

    pub fn settings(&self) -> &SequencerSettings {
        &self.settings
    }

    pub fn midi_settings(&self) -> &MidiSettings {
        &self.midi_settings
    }
}

impl Drop for Beatmaker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use beatmaker_midi::{MidiNote, MidiPacket, MockProvider, MockTransport};

    use super::*;
    use crate::config::PatternLayout;
    use crate::model::ElementId;

    fn context(autostart: bool) -> (Beatmaker, Arc<MockTransport>) {
        let provider = Arc::new(MockProvider::new());
        let keys = Arc::new(MockTransport::new("mock:keys", "Keys"));
        provider.plug(keys.clone());
        let settings = SequencerSettings {
            bpm: 240,
            autostart,
            ..SequencerSettings::default()
        };
        let app = Beatmaker::create(Box::new(provider), MidiSettings::default(), settings, None).unwrap();
        (app, keys)
    }

    #[test]
    fn invalid_layout_is_rejected() {
        let settings = SequencerSettings {
            layout: PatternLayout {
                tracks: 0,
                ..PatternLayout::default()
            },
            ..SequencerSettings::default()
        };
        let result = Beatmaker::create(
            Box::new(Arc::new(MockProvider::new())),
            MidiSettings::default(),
            settings,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn startup_connects_and_autostarts() {
        let (app, keys) = context(true);
        app.sequencer()
            .set_active(ElementId::Step { track: 0, step: 0 }, true);
        app.startup().unwrap();
        assert!(app.controller().is_connected());
        assert!(app.sequencer().is_playing());

        let note_on = MidiPacket::note_on(MidiNote::new(0, 36, 72));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !keys.sent_packets().contains(&note_on) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(keys.sent_packets().contains(&note_on));
        app.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (app, _keys) = context(false);
        app.startup().unwrap();
        app.shutdown();
        app.shutdown();
        assert!(!app.sequencer().is_engine_running());
        assert!(!app.controller().is_connected());
    }

    #[test]
    fn pause_and_resume_reach_the_controller() {
        let (app, _keys) = context(false);
        app.startup().unwrap();
        app.pause();
        assert!(app.controller().is_paused());
        app.resume();
        assert!(!app.controller().is_paused());
    }
}
