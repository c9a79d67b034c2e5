use std::sync::Arc;

use beatmaker_midi::{MemorySink, MidiNote, MidiPacket};
use beatmaker_sequencer::{
    CycleOutcome, ElementConfig, ElementId, MetricsHandle, Scheduler, Sequencer,
    SequencerSettings,
};

fn sequencer(settings: &SequencerSettings) -> (Sequencer, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let metrics = MetricsHandle::new(settings.bpm, settings.layout);
    let sequencer = Sequencer::new(settings, metrics, sink.clone()).unwrap();
    (sequencer, sink)
}

fn run(scheduler: &mut Scheduler, cycles: usize) -> Vec<CycleOutcome> {
    (0..cycles).map(|_| scheduler.run_cycle()).collect()
}

fn mentions(frame: &[MidiPacket], pitch: u8) -> bool {
    frame.iter().any(|packet| packet.midi1 == pitch)
}

#[test]
fn first_step_note_spans_its_duration() {
    let settings = SequencerSettings::default();
    assert_eq!(settings.bpm, 110);
    assert_eq!(settings.layout.tracks, 8);
    assert_eq!(settings.layout.steps(), 16);
    assert_eq!(settings.note_duration_ticks, 64);

    let (sequencer, sink) = sequencer(&settings);
    sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
    sequencer.start();
    let mut scheduler = sequencer.offline().unwrap();
    run(&mut scheduler, 65);

    let note = MidiNote::new(0, 36, 72);
    let frames = sink.frames();
    assert_eq!(frames.len(), 65);
    assert_eq!(frames[0], vec![MidiPacket::note_on(note)]);
    assert!(frames[1..64].iter().all(|frame| !mentions(frame, 36)));
    assert_eq!(frames[64], vec![MidiPacket::note_off(note)]);
}

#[test]
fn pattern_wraps_with_a_single_overrun() {
    let settings = SequencerSettings::default();
    let total = settings.layout.total_ticks() as usize;
    let (sequencer, sink) = sequencer(&settings);
    sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
    sequencer.start();
    let mut scheduler = sequencer.offline().unwrap();

    run(&mut scheduler, total);
    assert_eq!(sequencer.position().tick, total as u64 - 1);
    assert!(!sequencer.control().is_overrun());

    let wrapped = scheduler.run_cycle();
    assert!(matches!(
        wrapped,
        CycleOutcome::Tick { position, step_changed: true } if position.tick == 0
    ));
    assert!(sequencer.control().is_overrun());

    scheduler.run_cycle();
    assert!(!sequencer.control().is_overrun());

    let note_on = MidiPacket::note_on(MidiNote::new(0, 36, 72));
    let ons = sink.packets().iter().filter(|packet| **packet == note_on).count();
    assert_eq!(ons, 2);
}

#[test]
fn stop_then_start_returns_to_the_first_tick() {
    let (sequencer, _) = sequencer(&SequencerSettings::default());
    sequencer.start();
    let mut scheduler = sequencer.offline().unwrap();
    run(&mut scheduler, 100);
    assert_eq!(sequencer.position().tick, 99);

    sequencer.stop();
    sequencer.start();
    assert_eq!(sequencer.position().tick, 0);
    assert!(matches!(
        scheduler.run_cycle(),
        CycleOutcome::Tick { position, step_changed: true } if position.tick == 0
    ));
}

#[test]
fn pause_then_resume_keeps_the_position() {
    let (sequencer, _) = sequencer(&SequencerSettings::default());
    sequencer.start();
    let mut scheduler = sequencer.offline().unwrap();
    run(&mut scheduler, 70);
    let before = sequencer.position();

    sequencer.pause();
    assert_eq!(run(&mut scheduler, 10), vec![CycleOutcome::Idle; 10]);
    sequencer.resume();
    assert_eq!(sequencer.position(), before);
}

#[test]
fn retrigger_releases_before_playing_again() {
    let settings = SequencerSettings {
        note_duration_ticks: 128,
        ..SequencerSettings::default()
    };
    let (sequencer, sink) = sequencer(&settings);
    sequencer.set_active(ElementId::Step { track: 2, step: 0 }, true);
    sequencer.set_active(ElementId::Step { track: 2, step: 1 }, true);
    sequencer.start();
    let mut scheduler = sequencer.offline().unwrap();
    run(&mut scheduler, 65);

    let note = MidiNote::new(0, 38, 72);
    assert_eq!(
        sink.frames()[64],
        vec![MidiPacket::note_off(note), MidiPacket::note_on(note)]
    );
    let ons = sink
        .packets()
        .iter()
        .filter(|packet| **packet == MidiPacket::note_on(note))
        .count();
    let offs = sink
        .packets()
        .iter()
        .filter(|packet| **packet == MidiPacket::note_off(note))
        .count();
    assert_eq!((ons, offs), (2, 1));
}

#[test]
fn step_config_overrides_track_config() {
    let (sequencer, sink) = sequencer(&SequencerSettings::default());
    sequencer.set_config(
        ElementId::Step { track: 0, step: 0 },
        Some(ElementConfig::chord(
            9,
            [MidiNote::new(0, 60, 100), MidiNote::new(0, 64, 90)],
        )),
    );
    sequencer.set_active(ElementId::Step { track: 0, step: 0 }, true);
    sequencer.start();
    let mut scheduler = sequencer.offline().unwrap();
    scheduler.run_cycle();

    assert_eq!(
        sink.frames()[0],
        vec![
            MidiPacket::note_on(MidiNote::new(9, 60, 100)),
            MidiPacket::note_on(MidiNote::new(9, 64, 90)),
        ]
    );
}

#[test]
fn stopping_releases_sounding_notes() {
    let (sequencer, sink) = sequencer(&SequencerSettings::default());
    sequencer.set_active(ElementId::Step { track: 1, step: 0 }, true);
    sequencer.start();
    let mut scheduler = sequencer.offline().unwrap();
    run(&mut scheduler, 3);

    sequencer.stop();
    scheduler.all_tracks_off();
    assert_eq!(
        sink.packets().last(),
        Some(&MidiPacket::note_off(MidiNote::new(0, 37, 72)))
    );
    assert!(sequencer.track(1).unwrap().sounding_notes().is_empty());
}
