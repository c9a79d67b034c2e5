//! Decoding of USB-MIDI packets into events and fan-out to listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{MidiClock, TempoSink, QUARTERS_PER_MEASURE};
use crate::listeners::{ListenerId, ListenerSet};
use crate::packet::{cin, MidiPacket};

/// Controller numbers from this value upwards are channel mode messages.
pub const CHANNEL_MODE_FIRST_CONTROLLER: u8 = 120;

/// Semantic MIDI input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOff { channel: u8, pitch: u8, velocity: u8 },
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    PolyKeyPress { channel: u8, key: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ChannelMode { channel: u8, message: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// Signed bend, centred on zero (-8192..=8191).
    PitchBend { channel: u8, value: i16 },
    TuneRequest,
    Clock,
    Start,
    Continue,
    Stop,
    ActiveSensing,
    Reset,
}

impl MidiEvent {
    /// Decodes a cable 0 packet. Returns `None` for code index numbers and
    /// single bytes that carry no event (reserved, system common, sysex).
    pub fn decode(packet: &MidiPacket) -> Option<Self> {
        let channel = packet.midi0 & 0x0f;
        let (data1, data2) = (packet.midi1, packet.midi2);
        let event = match packet.cin {
            cin::NOTE_OFF => MidiEvent::NoteOff {
                channel,
                pitch: data1,
                velocity: data2,
            },
            cin::NOTE_ON if data2 == 0 => MidiEvent::NoteOff {
                channel,
                pitch: data1,
                velocity: 0,
            },
            cin::NOTE_ON => MidiEvent::NoteOn {
                channel,
                pitch: data1,
                velocity: data2,
            },
            cin::POLY_KEY_PRESS => MidiEvent::PolyKeyPress {
                channel,
                key: data1,
                pressure: data2,
            },
            cin::CONTROL_CHANGE if data1 >= CHANNEL_MODE_FIRST_CONTROLLER => {
                MidiEvent::ChannelMode {
                    channel,
                    message: data1,
                    value: data2,
                }
            }
            cin::CONTROL_CHANGE => MidiEvent::ControlChange {
                channel,
                controller: data1,
                value: data2,
            },
            cin::PROGRAM_CHANGE => MidiEvent::ProgramChange {
                channel,
                program: data1,
            },
            cin::CHANNEL_PRESSURE => MidiEvent::ChannelPressure {
                channel,
                pressure: data1,
            },
            cin::PITCH_BEND => MidiEvent::PitchBend {
                channel,
                value: (i16::from(data2) * 128 + i16::from(data1)) - 8192,
            },
            cin::SINGLE_BYTE => match packet.midi0 {
                0xF6 => MidiEvent::TuneRequest,
                0xF8 => MidiEvent::Clock,
                0xFA => MidiEvent::Start,
                0xFB => MidiEvent::Continue,
                0xFC => MidiEvent::Stop,
                0xFE => MidiEvent::ActiveSensing,
                0xFF => MidiEvent::Reset,
                _ => return None,
            },
            _ => return None,
        };
        Some(event)
    }
}

/// Receiver of decoded MIDI input.
///
/// Both methods run on the dispatch thread.
pub trait MidiInputListener: Send + Sync {
    /// Sees every packet before decoding. Returning `true` claims the packet
    /// and stops any further processing of it.
    fn on_packet(&self, _packet: &MidiPacket) -> bool {
        false
    }

    fn on_event(&self, event: &MidiEvent);
}

/// Counters describing what the dispatcher has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub claimed: u64,
    pub foreign_cable: u64,
    pub unhandled: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    claimed: AtomicU64,
    foreign_cable: AtomicU64,
    unhandled: AtomicU64,
}

/// Routes packets to registered [`MidiInputListener`]s and feeds realtime
/// clock messages into the tempo estimator.
pub struct MidiDispatcher {
    listeners: ListenerSet<dyn MidiInputListener>,
    clock: Mutex<MidiClock>,
    counters: Counters,
}

impl MidiDispatcher {
    pub fn new(clock: MidiClock) -> Self {
        Self {
            listeners: ListenerSet::new(),
            clock: Mutex::new(clock),
            counters: Counters::default(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MidiInputListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    pub fn reset_clock(&self) {
        self.clock.lock().reset();
    }

    pub fn set_tempo_sink(&self, sink: Option<Arc<dyn TempoSink>>) {
        self.clock.lock().set_sink(sink);
    }

    /// Last tempo recovered from incoming clock messages.
    pub fn recovered_bpm(&self) -> u32 {
        self.clock.lock().bpm()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            claimed: self.counters.claimed.load(Ordering::Relaxed),
            foreign_cable: self.counters.foreign_cable.load(Ordering::Relaxed),
            unhandled: self.counters.unhandled.load(Ordering::Relaxed),
        }
    }

    pub fn dispatch(&self, packet: &MidiPacket) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        if self.listeners.any(|listener| listener.on_packet(packet)) {
            self.counters.claimed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if packet.cable != 0 {
            // Other cables carry auxiliary protocols such as Mackie Control.
            self.counters.foreign_cable.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(cable = packet.cable, "ignoring packet on foreign cable");
            return;
        }

        let Some(event) = MidiEvent::decode(packet) else {
            self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(cin = packet.cin, status = packet.midi0, "unhandled midi packet");
            return;
        };

        match event {
            MidiEvent::Clock => {
                self.clock.lock().update();
            }
            MidiEvent::ActiveSensing => {}
            MidiEvent::ControlChange { controller: 64, .. } => {}
            _ => tracing::trace!(?event, "midi input"),
        }

        self.listeners.for_each(|listener| listener.on_event(&event));
    }
}

impl Default for MidiDispatcher {
    fn default() -> Self {
        Self::new(MidiClock::new(QUARTERS_PER_MEASURE))
    }
}
