use std::sync::Arc;
use std::time::Duration;

use beatmaker_midi::{MemorySink, MidiDispatcher, MidiNote, MidiPacket, MidiQueue};
use beatmaker_sequencer::{ElementId, MetricsHandle, Sequencer, SequencerSettings};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn midi_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("midi");

    group.bench_function("queue_push_drain_256", |b| {
        let queue = MidiQueue::new(256);
        let packets: Vec<_> = (0..256u16)
            .map(|i| MidiPacket::note_on(MidiNote::new((i % 16) as u8, (i % 128) as u8, 100)))
            .collect();
        b.iter(|| {
            queue.push_batch(&packets);
            let drained = queue.drain().count();
            black_box(drained);
        });
    });

    group.bench_function("decode_dispatch_1024", |b| {
        let dispatcher = MidiDispatcher::default();
        let mut stream = vec![0u8; 1024 * 4];
        for (i, frame) in stream.chunks_exact_mut(4).enumerate() {
            MidiPacket::from_message(0x90 | (i % 16) as u8, (i % 128) as u8, 64).serialize(frame, 0);
        }
        b.iter(|| {
            let mut packet = MidiPacket::default();
            let mut offset = 0;
            while packet.deserialize(&stream, offset, stream.len()) > 0 {
                dispatcher.dispatch(black_box(&packet));
                offset += 4;
            }
        });
    });

    group.finish();
}

fn scheduler_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencer");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("full_pattern_cycle_8_tracks", |b| {
        let settings = SequencerSettings::default();
        let sink = Arc::new(MemorySink::new());
        let metrics = MetricsHandle::new(settings.bpm, settings.layout);
        let sequencer = Sequencer::new(&settings, metrics, sink.clone()).expect("sequencer");
        for track in 0..sequencer.num_tracks() {
            for step in (track % 4..sequencer.num_steps()).step_by(4) {
                sequencer.set_active(ElementId::Step { track, step }, true);
            }
        }
        sequencer.start();
        let mut scheduler = sequencer.offline().expect("offline scheduler");
        let ticks = settings.layout.total_ticks();

        b.iter(|| {
            for _ in 0..ticks {
                black_box(scheduler.run_cycle());
            }
            sink.clear();
        });
    });

    group.finish();
}

criterion_group!(benches, midi_path, scheduler_cycle);
criterion_main!(benches);
