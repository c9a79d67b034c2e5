//! In-process transport used for tests and the `--mock` mode of the CLI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::packet::{MidiPacket, PACKET_SIZE};
use crate::transport::{alias_for, MidiPort, MidiTransport, PortDirection, TransportProvider};
use crate::MidiError;

/// Transport that loops nothing to hardware.
///
/// Inbound packets are injected with [`MockTransport::inject`]; when a clock
/// interval is configured and nothing was injected, `receive` produces a
/// realtime clock message once per interval. Every byte sent is recorded.
pub struct MockTransport {
    id: String,
    name: String,
    alias: Mutex<String>,
    connected: AtomicBool,
    ports_detected: AtomicBool,
    deny_open: AtomicBool,
    clock_interval: Option<Duration>,
    inbound_tx: Sender<MidiPacket>,
    inbound_rx: Receiver<MidiPacket>,
    sent: Mutex<Vec<u8>>,
}

impl MockTransport {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            id: id.into(),
            alias: Mutex::new(name.clone()),
            name,
            connected: AtomicBool::new(false),
            ports_detected: AtomicBool::new(false),
            deny_open: AtomicBool::new(false),
            clock_interval: None,
            inbound_tx,
            inbound_rx,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Emits a realtime clock message every `interval` while idle.
    pub fn with_clock(mut self, interval: Duration) -> Self {
        self.clock_interval = Some(interval);
        self
    }

    /// Makes the next `open` calls fail as if the platform denied access.
    pub fn deny_open(&self, deny: bool) {
        self.deny_open.store(deny, Ordering::Relaxed);
    }

    /// Queues a packet to be returned by a later `receive`.
    pub fn inject(&self, packet: MidiPacket) {
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.inbound_tx.send(packet);
    }

    /// Raw bytes sent so far.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent.lock().clone()
    }

    /// Packets sent so far, decoded from the recorded bytes.
    pub fn sent_packets(&self) -> Vec<MidiPacket> {
        self.sent
            .lock()
            .chunks_exact(PACKET_SIZE)
            .filter_map(MidiPacket::from_frame)
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn port(&self, direction: PortDirection) -> Option<MidiPort> {
        self.ports_detected
            .load(Ordering::Relaxed)
            .then(|| MidiPort::new(direction, 0))
    }
}

impl MidiTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn alias(&self) -> String {
        self.alias.lock().clone()
    }

    fn set_alias(&self, counter: usize) {
        *self.alias.lock() = alias_for(&self.name, counter);
    }

    fn open(&self) -> Result<(), MidiError> {
        if self.deny_open.load(Ordering::Relaxed) {
            return Err(MidiError::PermissionDenied(self.alias()));
        }
        self.detect_ports();
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.ports_detected.store(false, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn detect_ports(&self) {
        self.ports_detected.store(true, Ordering::Relaxed);
    }

    fn default_input(&self) -> Option<MidiPort> {
        self.port(PortDirection::Input)
    }

    fn default_output(&self) -> Option<MidiPort> {
        self.port(PortDirection::Output)
    }

    fn send(&self, port: &MidiPort, bytes: &[u8], _timeout: Duration) -> Result<usize, MidiError> {
        if port.direction != PortDirection::Output {
            return Err(MidiError::NoPort(PortDirection::Output));
        }
        self.sent.lock().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn receive(
        &self,
        port: &MidiPort,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, MidiError> {
        if port.direction != PortDirection::Input {
            return Err(MidiError::NoPort(PortDirection::Input));
        }
        let wait = self
            .clock_interval
            .map_or(timeout, |interval| interval.min(timeout));
        let first = match self.inbound_rx.recv_timeout(wait) {
            Ok(packet) => packet,
            Err(RecvTimeoutError::Timeout) => match self.clock_interval {
                Some(_) => MidiPacket::realtime(0xF8),
                None => return Ok(0),
            },
            Err(RecvTimeoutError::Disconnected) => return Ok(0),
        };

        let mut written = first.serialize(buffer, 0);
        while written + PACKET_SIZE <= buffer.len() {
            let Ok(packet) = self.inbound_rx.try_recv() else {
                break;
            };
            written += packet.serialize(buffer, written);
        }
        Ok(written)
    }
}

/// Provider whose interface list is edited by hand.
#[derive(Default)]
pub struct MockProvider {
    interfaces: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes an interface visible to the next rescan.
    pub fn plug(&self, transport: Arc<MockTransport>) {
        let mut interfaces = self.interfaces.lock();
        interfaces.retain(|existing| existing.id() != transport.id());
        interfaces.push(transport);
    }

    /// Removes an interface from the next rescan.
    pub fn unplug(&self, id: &str) {
        self.interfaces.lock().retain(|existing| existing.id() != id);
    }
}

impl TransportProvider for MockProvider {
    fn query(&self) -> Result<Vec<Arc<dyn MidiTransport>>, MidiError> {
        Ok(self
            .interfaces
            .lock()
            .iter()
            .map(|transport| Arc::clone(transport) as Arc<dyn MidiTransport>)
            .collect())
    }

    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

impl TransportProvider for Arc<MockProvider> {
    fn query(&self) -> Result<Vec<Arc<dyn MidiTransport>>, MidiError> {
        self.as_ref().query()
    }

    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}
