//! Capability contract implemented by platform MIDI transports.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::MidiError;

/// Default time between two interface rescans for hardware providers.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Largest transfer a port accepts unless it reports otherwise.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// One endpoint of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiPort {
    pub direction: PortDirection,
    pub index: usize,
    pub max_packet_size: usize,
}

impl MidiPort {
    pub fn new(direction: PortDirection, index: usize) -> Self {
        Self {
            direction,
            index,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Alias for an interface name, with a `#N` suffix once `counter` is non-zero.
pub fn alias_for(name: &str, counter: usize) -> String {
    if counter == 0 {
        name.to_string()
    } else {
        format!("{name} #{counter}")
    }
}

/// A MIDI interface the controller can open and exchange USB-MIDI frames with.
///
/// Implementations are shared between the controller and its I/O threads,
/// so every method takes `&self`. `send` and `receive` move whole 4-byte
/// packets; `receive` returns `Ok(0)` when nothing arrived within `timeout`.
pub trait MidiTransport: Send + Sync {
    /// Stable identifier, unique among the interfaces of one provider.
    fn id(&self) -> &str;

    /// Current display alias, see [`MidiTransport::set_alias`].
    fn alias(&self) -> String;

    /// Rebuilds the alias from the interface name and a disambiguation
    /// counter, see [`alias_for`].
    fn set_alias(&self, counter: usize);

    fn open(&self) -> Result<(), MidiError>;

    fn close(&self);

    fn is_connected(&self) -> bool;

    /// Refreshes the input and output port lists.
    fn detect_ports(&self);

    fn default_input(&self) -> Option<MidiPort>;

    fn default_output(&self) -> Option<MidiPort>;

    fn send(&self, port: &MidiPort, bytes: &[u8], timeout: Duration) -> Result<usize, MidiError>;

    fn receive(
        &self,
        port: &MidiPort,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, MidiError>;
}

/// Enumerates the interfaces currently present on the system.
pub trait TransportProvider: Send + Sync {
    fn query(&self) -> Result<Vec<Arc<dyn MidiTransport>>, MidiError>;

    /// How often the controller should rescan. `None` disables the
    /// background timer; rescans then happen on start and on demand.
    fn poll_interval(&self) -> Option<Duration> {
        Some(DEFAULT_RESCAN_INTERVAL)
    }
}
