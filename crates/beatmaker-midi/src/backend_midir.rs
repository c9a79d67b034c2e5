use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;

use crate::packet::{cin, frame_message, MidiPacket, PACKET_SIZE};
use crate::transport::{
    alias_for, MidiPort, MidiTransport, PortDirection, TransportProvider, DEFAULT_RESCAN_INTERVAL,
};
use crate::MidiError;

const CLIENT_NAME: &str = "beatmaker-midi";

#[derive(Debug, Default, Clone, Copy)]
struct PortPair {
    input: Option<usize>,
    output: Option<usize>,
}

/// Enumerates the system's MIDI ports and pairs inputs and outputs by name.
fn scan_ports() -> anyhow::Result<BTreeMap<String, PortPair>> {
    let mut pairs: BTreeMap<String, PortPair> = BTreeMap::new();

    let input = MidiInput::new(CLIENT_NAME).context("initialise midir for input enumeration")?;
    for (index, port) in input.ports().iter().enumerate() {
        let name = input
            .port_name(port)
            .unwrap_or_else(|_| format!("Port {index}"));
        pairs.entry(name).or_default().input = Some(index);
    }

    let output = MidiOutput::new(CLIENT_NAME).context("initialise midir for output enumeration")?;
    for (index, port) in output.ports().iter().enumerate() {
        let name = output
            .port_name(port)
            .unwrap_or_else(|_| format!("Port {index}"));
        pairs.entry(name).or_default().output = Some(index);
    }
    Ok(pairs)
}

fn backend_error(err: anyhow::Error) -> MidiError {
    MidiError::Backend(format!("{err:#}"))
}

/// Provider backed by the platform MIDI API through `midir`.
pub struct MidirProvider {
    poll_interval: Duration,
}

impl Default for MidirProvider {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_RESCAN_INTERVAL,
        }
    }
}

impl MidirProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl TransportProvider for MidirProvider {
    fn query(&self) -> Result<Vec<Arc<dyn MidiTransport>>, MidiError> {
        let pairs = scan_ports().map_err(backend_error)?;
        Ok(pairs
            .into_keys()
            .map(|name| Arc::new(MidirTransport::new(name)) as Arc<dyn MidiTransport>)
            .collect())
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }
}

/// One named device, with at most one input and one output port.
pub struct MidirTransport {
    id: String,
    name: String,
    alias: Mutex<String>,
    ports: Mutex<PortPair>,
    connected: AtomicBool,
    input: Mutex<Option<MidiInputConnection<()>>>,
    output: Mutex<Option<MidiOutputConnection>>,
    /// Bytes of a system exclusive message still being assembled for output.
    sysex: Mutex<Vec<u8>>,
    inbound_tx: Sender<MidiPacket>,
    inbound_rx: Receiver<MidiPacket>,
}

impl MidirTransport {
    pub fn new(name: String) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            id: format!("midir:{name}"),
            alias: Mutex::new(name.clone()),
            name,
            ports: Mutex::new(PortPair::default()),
            connected: AtomicBool::new(false),
            input: Mutex::new(None),
            output: Mutex::new(None),
            sysex: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx,
        }
    }

    fn connect_input(&self, index: usize) -> anyhow::Result<MidiInputConnection<()>> {
        let mut input = MidiInput::new(CLIENT_NAME).context("initialise midir for input")?;
        input.ignore(Ignore::None);
        let ports = input.ports();
        let port = ports
            .get(index)
            .with_context(|| format!("input port {index} of `{}` disappeared", self.name))?;
        let tx = self.inbound_tx.clone();
        input
            .connect(
                port,
                "beatmaker-midi-in",
                move |_timestamp, message, _| {
                    for packet in frame_message(message) {
                        let _ = tx.send(packet);
                    }
                },
                (),
            )
            .map_err(|err| anyhow::anyhow!("failed to connect midi input: {err}"))
    }

    fn connect_output(&self, index: usize) -> anyhow::Result<MidiOutputConnection> {
        let output = MidiOutput::new(CLIENT_NAME).context("initialise midir for output")?;
        let ports = output.ports();
        let port = ports
            .get(index)
            .with_context(|| format!("output port {index} of `{}` disappeared", self.name))?;
        output
            .connect(port, "beatmaker-midi-out")
            .map_err(|err| anyhow::anyhow!("failed to connect midi output: {err}"))
    }

    /// Sends one packet, assembling system exclusive chunks into whole
    /// messages first.
    fn send_packet(
        &self,
        connection: &mut MidiOutputConnection,
        packet: &MidiPacket,
    ) -> anyhow::Result<()> {
        let mut sysex = self.sysex.lock();
        let continues_sysex = !sysex.is_empty()
            && matches!(
                packet.cin,
                cin::SYSEX_START | cin::SYSEX_END_1 | cin::SYSEX_END_2 | cin::SYSEX_END_3
            );
        if packet.cin == cin::SYSEX_START || continues_sysex {
            sysex.extend_from_slice(&packet.message_bytes());
            if packet.cin == cin::SYSEX_START {
                return Ok(());
            }
            let message = std::mem::take(&mut *sysex);
            return connection
                .send(&message)
                .map_err(|err| anyhow::anyhow!("sysex send failed: {err}"));
        }

        let bytes = packet.message_bytes();
        if bytes.is_empty() {
            return Ok(());
        }
        connection
            .send(&bytes)
            .map_err(|err| anyhow::anyhow!("send failed: {err}"))
    }
}

impl MidiTransport for MidirTransport {
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
        if self.is_connected() {
            return Ok(());
        }
        self.detect_ports();
        let ports = *self.ports.lock();
        if ports.input.is_none() && ports.output.is_none() {
            return Err(MidiError::UnknownInterface(self.name.clone()));
        }

        let input = ports
            .input
            .map(|index| self.connect_input(index))
            .transpose()
            .map_err(backend_error)?;
        let output = ports
            .output
            .map(|index| self.connect_output(index))
            .transpose()
            .map_err(backend_error)?;

        while self.inbound_rx.try_recv().is_ok() {}
        *self.input.lock() = input;
        *self.output.lock() = output;
        self.connected.store(true, Ordering::Release);
        tracing::debug!(name = %self.name, "opened midir connections");
        Ok(())
    }

    fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(connection) = self.input.lock().take() {
            connection.close();
        }
        if let Some(connection) = self.output.lock().take() {
            connection.close();
        }
        self.sysex.lock().clear();
        tracing::debug!(name = %self.name, "closed midir connections");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn detect_ports(&self) {
        match scan_ports() {
            Ok(pairs) => {
                *self.ports.lock() = pairs.get(&self.name).copied().unwrap_or_default();
            }
            Err(err) => tracing::debug!(?err, name = %self.name, "port detection failed"),
        }
    }

    fn default_input(&self) -> Option<MidiPort> {
        self.ports
            .lock()
            .input
            .map(|index| MidiPort::new(PortDirection::Input, index))
    }

    fn default_output(&self) -> Option<MidiPort> {
        self.ports
            .lock()
            .output
            .map(|index| MidiPort::new(PortDirection::Output, index))
    }

    fn send(&self, port: &MidiPort, bytes: &[u8], _timeout: Duration) -> Result<usize, MidiError> {
        if port.direction != PortDirection::Output {
            return Err(MidiError::NoPort(PortDirection::Output));
        }
        let mut output = self.output.lock();
        let connection = output.as_mut().ok_or(MidiError::NotConnected)?;

        let mut sent = 0;
        for frame in bytes.chunks_exact(PACKET_SIZE) {
            let Some(packet) = MidiPacket::from_frame(frame) else {
                break;
            };
            self.send_packet(connection, &packet).map_err(backend_error)?;
            sent += PACKET_SIZE;
        }
        Ok(sent)
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
        if !self.is_connected() {
            return Err(MidiError::NotConnected);
        }
        let first = match self.inbound_rx.recv_timeout(timeout) {
            Ok(packet) => packet,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => return Err(MidiError::NotConnected),
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
