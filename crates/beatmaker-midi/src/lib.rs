//! MIDI I/O for the Beatmaker step sequencer.
//!
//! Packets travel as 4-byte USB-MIDI frames. Transports deliver raw frames,
//! the [`MidiController`] moves them through bounded [`MidiQueue`]s and hands
//! them to the [`MidiDispatcher`], which decodes them into [`MidiEvent`]s.

use std::time::Instant;

use once_cell::sync::Lazy;
use thiserror::Error;

pub mod backend_midir;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod hotplug;
pub mod listeners;
pub mod mock;
pub mod note;
pub mod output;
pub mod packet;
pub mod queue;
pub mod thread;
pub mod transport;

pub use clock::{MidiClock, TempoSink};
pub use config::{MidiSettings, ThreadPriorities};
pub use controller::{ControllerEvent, InterfaceInfo, MidiController, OutputStats};
pub use dispatcher::{DispatchStats, MidiDispatcher, MidiEvent, MidiInputListener};
pub use listeners::{ListenerId, ListenerSet};
pub use mock::{MockProvider, MockTransport};
pub use note::MidiNote;
pub use output::{MemorySink, MidiSink};
pub use packet::MidiPacket;
pub use queue::MidiQueue;
pub use transport::{MidiPort, MidiTransport, PortDirection, TransportProvider};

/// Monotonic timestamp in microseconds. Zero means "unset".
pub type MidiTimestamp = u64;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds elapsed on the process-wide monotonic clock.
///
/// Never returns zero so the value can always be used as a packet timestamp.
pub fn now_micros() -> MidiTimestamp {
    (EPOCH.elapsed().as_micros() as MidiTimestamp).max(1)
}

/// Errors that can be produced while dealing with MIDI transports.
#[derive(Debug, Error)]
pub enum MidiError {
    /// No interface with the given alias or id is known.
    #[error("unknown MIDI interface `{0}`")]
    UnknownInterface(String),
    /// An operation required a connected interface.
    #[error("no MIDI interface connected")]
    NotConnected,
    /// The interface does not expose a port in the requested direction.
    #[error("MIDI interface has no {0} port")]
    NoPort(PortDirection),
    /// The platform refused access to the interface.
    #[error("access to MIDI interface `{0}` denied")]
    PermissionDenied(String),
    /// The transport accepted fewer bytes than requested.
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },
    /// Backend specific failure with additional context.
    #[error("backend error: {0}")]
    Backend(String),
    /// Worker thread could not be spawned.
    #[error("failed to spawn MIDI worker: {0}")]
    Spawn(#[from] std::io::Error),
}
