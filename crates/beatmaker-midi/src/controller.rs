//! Interface discovery, connection lifecycle and MIDI I/O threads.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::clock::{MidiClock, TempoSink, QUARTERS_PER_MEASURE};
use crate::config::{MidiSettings, ThreadPriorities};
use crate::dispatcher::{MidiDispatcher, MidiInputListener};
use crate::hotplug::RescanTimer;
use crate::listeners::ListenerId;
use crate::output::{write_coalesced, MidiSink, WriteReport};
use crate::packet::{MidiPacket, PACKET_SIZE};
use crate::queue::MidiQueue;
use crate::thread::{join_bounded, spawn_worker};
use crate::transport::{MidiPort, MidiTransport, PortDirection, TransportProvider};
use crate::{now_micros, MidiError};

const EVENT_BACKLOG: usize = 256;
const PAUSED_POLL: Duration = Duration::from_millis(100);
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Lifecycle notifications published by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    InterfaceAdded { id: String, alias: String },
    InterfaceRemoved { id: String, alias: String },
    Connected { alias: String },
    Disconnected { alias: String },
    ConnectFailed { alias: String, reason: String },
}

/// Snapshot of a known interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub id: String,
    pub alias: String,
    pub connected: bool,
}

/// Output path counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub transfers: u64,
    pub bytes: u64,
    /// Largest observed age of a packet at transmission, in microseconds.
    pub max_latency_us: u64,
    pub write_errors: u64,
    /// Packets rejected because the pending output buffer was full.
    pub dropped: u64,
    /// Trailing input bytes that did not form a whole packet.
    pub truncated_input_bytes: u64,
}

#[derive(Default)]
struct Counters {
    transfers: AtomicU64,
    bytes: AtomicU64,
    max_latency_us: AtomicU64,
    write_errors: AtomicU64,
    dropped: AtomicU64,
    truncated_input_bytes: AtomicU64,
}

impl Counters {
    fn record(&self, result: &Result<WriteReport, MidiError>) {
        match result {
            Ok(report) => {
                self.transfers
                    .fetch_add(report.transfers as u64, Ordering::Relaxed);
                self.bytes.fetch_add(report.bytes as u64, Ordering::Relaxed);
                self.max_latency_us
                    .fetch_max(report.max_latency_us, Ordering::Relaxed);
                tracing::trace!(
                    bytes = report.bytes,
                    max_latency_us = report.max_latency_us,
                    "midi output sent"
                );
            }
            Err(err) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%err, "midi output I/O error");
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Options {
    output_async: bool,
    output_queue_capacity: usize,
    input_queue_capacity: usize,
    io_timeout: Duration,
    dispatch_wait: Duration,
    join_timeout: Duration,
    priorities: ThreadPriorities,
}

impl From<&MidiSettings> for Options {
    fn from(settings: &MidiSettings) -> Self {
        Self {
            output_async: settings.output_async,
            output_queue_capacity: settings.output_queue_capacity.max(1),
            input_queue_capacity: settings.input_queue_capacity.max(1),
            io_timeout: settings.io_timeout(),
            dispatch_wait: settings.dispatch_wait(),
            join_timeout: settings.join_timeout(),
            priorities: settings.priorities,
        }
    }
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

struct Session {
    transport: Arc<dyn MidiTransport>,
    running: Arc<AtomicBool>,
    workers: Vec<Worker>,
    input_queue: Arc<MidiQueue>,
    output_queue: Option<Arc<MidiQueue>>,
}

/// Where output goes for the current session.
struct Route {
    transport: Arc<dyn MidiTransport>,
    port: Option<MidiPort>,
    queue: Option<Arc<MidiQueue>>,
}

struct Shared {
    provider: Box<dyn TransportProvider>,
    options: Options,
    settings: Mutex<MidiSettings>,
    settings_path: Option<PathBuf>,
    dispatcher: Arc<MidiDispatcher>,
    rescan_lock: Mutex<()>,
    interfaces: Mutex<BTreeMap<String, Arc<dyn MidiTransport>>>,
    session: Mutex<Option<Session>>,
    pending: Mutex<Vec<MidiPacket>>,
    paused: Arc<AtomicBool>,
    counters: Arc<Counters>,
    events_tx: Sender<ControllerEvent>,
    events_rx: Receiver<ControllerEvent>,
}

/// Owns the MIDI interfaces and the threads moving data to and from them.
///
/// Input flows transport → input thread → [`MidiQueue`] → dispatch thread →
/// [`MidiDispatcher`]. Output is collected with
/// [`MidiController::enqueue_output`] and written on
/// [`MidiController::flush_output`], either directly or through an output
/// thread when async output is enabled.
pub struct MidiController {
    shared: Arc<Shared>,
    rescan_timer: Mutex<Option<RescanTimer>>,
}

impl MidiController {
    pub fn new(
        provider: Box<dyn TransportProvider>,
        settings: MidiSettings,
        tempo_sink: Option<Arc<dyn TempoSink>>,
    ) -> Self {
        let mut clock = MidiClock::new(QUARTERS_PER_MEASURE);
        clock.set_sink(tempo_sink);
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_BACKLOG);
        let options = Options::from(&settings);
        tracing::debug!("created midi controller");
        Self {
            shared: Arc::new(Shared {
                provider,
                options,
                pending: Mutex::new(Vec::with_capacity(options.output_queue_capacity)),
                settings: Mutex::new(settings),
                settings_path: None,
                dispatcher: Arc::new(MidiDispatcher::new(clock)),
                rescan_lock: Mutex::new(()),
                interfaces: Mutex::new(BTreeMap::new()),
                session: Mutex::new(None),
                paused: Arc::new(AtomicBool::new(false)),
                counters: Arc::new(Counters::default()),
                events_tx,
                events_rx,
            }),
            rescan_timer: Mutex::new(None),
        }
    }

    /// Persists the preferred interface to `path` whenever it changes.
    ///
    /// Must be called before the controller is shared.
    pub fn with_settings_path(mut self, path: PathBuf) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.settings_path = Some(path);
        }
        self
    }

    /// Scans for interfaces and starts the periodic rescan timer.
    pub fn start(&self) -> Result<(), MidiError> {
        tracing::debug!("start midi controller");
        self.shared.paused.store(false, Ordering::Release);
        self.shared.rescan();

        let Some(interval) = self.shared.provider.poll_interval() else {
            return Ok(());
        };
        let mut timer = self.rescan_timer.lock();
        if timer.is_none() {
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            *timer = Some(RescanTimer::spawn(
                interval,
                self.shared.options.priorities.background,
                self.shared.options.join_timeout,
                move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.rescan();
                    }
                },
            )?);
        }
        Ok(())
    }

    /// Stops rescanning, disconnects and forgets every interface.
    pub fn stop(&self) {
        tracing::debug!("stop midi controller");
        let timer = self.rescan_timer.lock().take();
        drop(timer);
        self.shared.paused.store(false, Ordering::Release);
        self.shared.disconnect_current();
        let interfaces = std::mem::take(&mut *self.shared.interfaces.lock());
        for transport in interfaces.values() {
            transport.close();
        }
    }

    /// Suspends rescans and makes the I/O loops idle.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Diffs the provider's interfaces against the known set right now.
    pub fn rescan(&self) {
        self.shared.rescan();
    }

    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        let current = self.current_id();
        self.shared
            .interfaces
            .lock()
            .values()
            .map(|transport| InterfaceInfo {
                id: transport.id().to_string(),
                alias: transport.alias(),
                connected: current.as_deref() == Some(transport.id()),
            })
            .collect()
    }

    /// Alias of the connected interface.
    pub fn current_interface(&self) -> Option<String> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.transport.alias())
    }

    fn current_id(&self) -> Option<String> {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|session| session.transport.id().to_string())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.session.lock().is_some()
    }

    /// Connects the interface with this alias and remembers it as preferred.
    pub fn connect_alias(&self, alias: &str) -> Result<(), MidiError> {
        let transport = self
            .shared
            .interfaces
            .lock()
            .values()
            .find(|transport| transport.alias() == alias)
            .cloned()
            .ok_or_else(|| MidiError::UnknownInterface(alias.to_string()))?;
        if self.current_id().as_deref() == Some(transport.id()) {
            return Ok(());
        }
        self.shared.disconnect_current();
        self.shared.connect(&transport)?;
        self.shared.remember_preference(alias);
        Ok(())
    }

    pub fn disconnect(&self) {
        self.shared.disconnect_current();
    }

    pub fn preferred_interface(&self) -> String {
        self.shared.settings.lock().preferred_interface.clone()
    }

    pub fn dispatcher(&self) -> Arc<MidiDispatcher> {
        Arc::clone(&self.shared.dispatcher)
    }

    pub fn add_input_listener(&self, listener: Arc<dyn MidiInputListener>) -> ListenerId {
        self.shared.dispatcher.add_listener(listener)
    }

    pub fn remove_input_listener(&self, id: ListenerId) -> bool {
        self.shared.dispatcher.remove_listener(id)
    }

    /// Receiver of lifecycle events. Events are dropped once the backlog is
    /// full and nobody reads them.
    pub fn events(&self) -> Receiver<ControllerEvent> {
        self.shared.events_rx.clone()
    }

    pub fn output_stats(&self) -> OutputStats {
        let counters = &self.shared.counters;
        OutputStats {
            transfers: counters.transfers.load(Ordering::Relaxed),
            bytes: counters.bytes.load(Ordering::Relaxed),
            max_latency_us: counters.max_latency_us.load(Ordering::Relaxed),
            write_errors: counters.write_errors.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            truncated_input_bytes: counters.truncated_input_bytes.load(Ordering::Relaxed),
        }
    }

    /// Sends one packet now, or hands it to the output thread in async mode.
    ///
    /// Returns the number of bytes written; 0 when it was queued.
    pub fn send(&self, packet: MidiPacket) -> Result<usize, MidiError> {
        self.shared.send_batch(std::slice::from_ref(&packet))
    }

    pub fn send_batch(&self, packets: &[MidiPacket]) -> Result<usize, MidiError> {
        self.shared.send_batch(packets)
    }

    /// Adds a packet to the pending output buffer, stamping it with the
    /// current time if it has no timestamp. Dropped when the buffer is full.
    pub fn enqueue_output(&self, packet: MidiPacket) {
        let mut pending = self.shared.pending.lock();
        if pending.len() >= self.shared.options.output_queue_capacity {
            self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let packet = if packet.timestamp == 0 {
            packet.with_timestamp(now_micros())
        } else {
            packet
        };
        pending.push(packet);
    }

    /// Transmits everything enqueued since the last flush as one batch.
    pub fn flush_output(&self) {
        let mut pending = self.shared.pending.lock();
        if pending.is_empty() {
            return;
        }
        match self.shared.send_batch(&pending) {
            Ok(_) => {}
            Err(MidiError::NotConnected) => {
                tracing::trace!(count = pending.len(), "discarding output, no interface")
            }
            Err(err) => tracing::debug!(%err, "midi output flush failed"),
        }
        pending.clear();
    }

    pub fn clear_output(&self) {
        self.shared.pending.lock().clear();
    }

    /// Plays or releases a two-note test chord on channels 0 and 1.
    pub fn play_test_tone(&self, pressed: bool) -> Result<usize, MidiError> {
        let velocity = if pressed { 0x40 } else { 0x00 };
        self.send_batch(&[
            MidiPacket::from_message(0x90, 0x40, velocity),
            MidiPacket::from_message(0x91, 0x45, velocity),
        ])
    }
}

impl MidiSink for MidiController {
    fn enqueue(&self, packet: MidiPacket) {
        self.enqueue_output(packet);
    }

    fn flush(&self) {
        self.flush_output();
    }
}

impl Drop for MidiController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn publish(&self, event: ControllerEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn rescan(&self) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let _scan = self.rescan_lock.lock();
        if self.drop_lost_session() {
            return;
        }

        let current = match self.provider.query() {
            Ok(current) => current,
            Err(err) => {
                tracing::debug!(%err, "midi interface query failed");
                return;
            }
        };
        let current_ids: HashSet<&str> = current.iter().map(|transport| transport.id()).collect();

        let (added, removed): (Vec<_>, Vec<_>) = {
            let known = self.interfaces.lock();
            let added = current
                .iter()
                .filter(|transport| !known.contains_key(transport.id()))
                .cloned()
                .collect();
            let removed = known
                .values()
                .filter(|transport| !current_ids.contains(transport.id()))
                .cloned()
                .collect();
            (added, removed)
        };

        for transport in &added {
            transport.detect_ports();
        }
        for transport in &removed {
            self.on_removed(transport);
        }
        if added.is_empty() && removed.is_empty() {
            return;
        }

        {
            let mut known = self.interfaces.lock();
            for transport in &removed {
                transport.close();
                known.remove(transport.id());
            }
            for transport in &added {
                known.insert(transport.id().to_string(), Arc::clone(transport));
            }
            assign_aliases(known.values());
        }

        for transport in &added {
            self.on_added(transport);
        }
    }

    /// Tears down the session when its transport dropped the connection and
    /// forgets the interface, so the next rescan rediscovers it.
    fn drop_lost_session(&self) -> bool {
        let lost = self
            .session
            .lock()
            .as_ref()
            .filter(|session| !session.transport.is_connected())
            .map(|session| Arc::clone(&session.transport));
        let Some(transport) = lost else {
            return false;
        };
        tracing::warn!(alias = %transport.alias(), "midi interface lost its connection");
        self.on_removed(&transport);

        let mut known = self.interfaces.lock();
        known.remove(transport.id());
        assign_aliases(known.values());
        true
    }

    fn on_added(&self, transport: &Arc<dyn MidiTransport>) {
        let alias = transport.alias();
        tracing::info!(alias = %alias, id = transport.id(), "added midi interface");
        self.publish(ControllerEvent::InterfaceAdded {
            id: transport.id().to_string(),
            alias: alias.clone(),
        });

        let preferred = self.settings.lock().preferred_interface.clone();
        let connected = self.session.lock().is_some();
        if connected || !(preferred.is_empty() || preferred == alias) {
            return;
        }
        if self.connect(transport).is_ok() {
            self.remember_preference(&alias);
        }
    }

    fn on_removed(&self, transport: &Arc<dyn MidiTransport>) {
        let alias = transport.alias();
        tracing::info!(alias = %alias, id = transport.id(), "removed midi interface");
        self.publish(ControllerEvent::InterfaceRemoved {
            id: transport.id().to_string(),
            alias,
        });
        let is_current = self
            .session
            .lock()
            .as_ref()
            .is_some_and(|session| session.transport.id() == transport.id());
        if is_current {
            self.disconnect_current();
        }
    }

    fn remember_preference(&self, alias: &str) {
        let mut settings = self.settings.lock();
        if settings.preferred_interface == alias {
            return;
        }
        settings.preferred_interface = alias.to_string();
        if let Some(path) = &self.settings_path {
            settings.save_to(path);
        }
    }

    fn connect(&self, transport: &Arc<dyn MidiTransport>) -> Result<(), MidiError> {
        let alias = transport.alias();
        if transport.is_connected() {
            return Ok(());
        }
        if let Err(err) = transport.open() {
            tracing::warn!(alias = %alias, %err, "failed to open midi interface");
            self.publish(ControllerEvent::ConnectFailed {
                alias,
                reason: err.to_string(),
            });
            return Err(err);
        }

        let running = Arc::new(AtomicBool::new(true));
        let input_queue = Arc::new(MidiQueue::new(self.options.input_queue_capacity));
        let mut workers = Vec::new();
        let output_queue = match self.spawn_workers(transport, &running, &input_queue, &mut workers) {
            Ok(queue) => queue,
            Err(err) => {
                running.store(false, Ordering::Release);
                for worker in workers {
                    join_bounded(worker.handle, self.options.join_timeout, worker.name);
                }
                transport.close();
                tracing::warn!(alias = %alias, %err, "failed to start midi workers");
                self.publish(ControllerEvent::ConnectFailed {
                    alias,
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        *self.session.lock() = Some(Session {
            transport: Arc::clone(transport),
            running,
            workers,
            input_queue,
            output_queue,
        });
        tracing::info!(alias = %alias, "opened midi interface");
        self.publish(ControllerEvent::Connected { alias });
        Ok(())
    }

    fn spawn_workers(
        &self,
        transport: &Arc<dyn MidiTransport>,
        running: &Arc<AtomicBool>,
        input_queue: &Arc<MidiQueue>,
        workers: &mut Vec<Worker>,
    ) -> Result<Option<Arc<MidiQueue>>, MidiError> {
        let options = self.options;

        if let Some(port) = transport.default_input() {
            let input = InputLoop {
                transport: Arc::clone(transport),
                port,
                queue: Arc::clone(input_queue),
                dispatcher: Arc::clone(&self.dispatcher),
                running: Arc::clone(running),
                paused: Arc::clone(&self.paused),
                counters: Arc::clone(&self.counters),
                timeout: options.io_timeout,
            };
            let name = "beatmaker-midi-input";
            let handle = spawn_worker(name, options.priorities.midi_input, move || input.run())?;
            workers.push(Worker { name, handle });
        }

        {
            let queue = Arc::clone(input_queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            let running = Arc::clone(running);
            let wait = options.dispatch_wait;
            let name = "beatmaker-midi-dispatch";
            let handle = spawn_worker(name, options.priorities.midi_dispatch, move || {
                while running.load(Ordering::Acquire) {
                    if queue.wait_for_data(wait) {
                        while let Some(packet) = queue.pop() {
                            dispatcher.dispatch(&packet);
                        }
                    }
                }
            })?;
            workers.push(Worker { name, handle });
        }

        if !options.output_async {
            return Ok(None);
        }
        let Some(port) = transport.default_output() else {
            return Ok(None);
        };
        let queue = Arc::new(MidiQueue::new(options.output_queue_capacity));
        let output = OutputLoop {
            transport: Arc::clone(transport),
            port,
            queue: Arc::clone(&queue),
            running: Arc::clone(running),
            paused: Arc::clone(&self.paused),
            counters: Arc::clone(&self.counters),
            timeout: options.io_timeout,
        };
        let name = "beatmaker-midi-output";
        let handle = spawn_worker(name, options.priorities.midi_output, move || output.run())?;
        workers.push(Worker { name, handle });
        Ok(Some(queue))
    }

    fn disconnect_current(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        let alias = session.transport.alias();
        tracing::debug!(alias = %alias, "disconnect midi interface");

        session.running.store(false, Ordering::Release);
        for worker in session.workers {
            join_bounded(worker.handle, self.options.join_timeout, worker.name);
        }
        session.input_queue.clear();
        if let Some(queue) = &session.output_queue {
            queue.clear();
        }
        self.pending.lock().clear();
        session.transport.close();
        self.publish(ControllerEvent::Disconnected { alias });
    }

    fn route(&self) -> Option<Route> {
        self.session.lock().as_ref().map(|session| Route {
            transport: Arc::clone(&session.transport),
            port: session.transport.default_output(),
            queue: session.output_queue.clone(),
        })
    }

    fn send_batch(&self, packets: &[MidiPacket]) -> Result<usize, MidiError> {
        let route = self.route().ok_or(MidiError::NotConnected)?;
        if let Some(queue) = route.queue {
            queue.push_batch(packets);
            return Ok(0);
        }
        let port = route
            .port
            .ok_or(MidiError::NoPort(PortDirection::Output))?;
        let result = write_coalesced(
            route.transport.as_ref(),
            &port,
            packets.iter().copied(),
            self.options.io_timeout,
        );
        self.counters.record(&result);
        result.map(|report| report.bytes)
    }
}

/// Gives every interface a unique alias, appending `#N` on collisions.
fn assign_aliases<'a>(transports: impl Iterator<Item = &'a Arc<dyn MidiTransport>>) {
    let mut taken = HashSet::new();
    for transport in transports {
        let mut counter = 0;
        transport.set_alias(counter);
        while taken.contains(&transport.alias()) {
            counter += 1;
            transport.set_alias(counter);
        }
        taken.insert(transport.alias());
    }
}

fn all_notes_off() -> Vec<MidiPacket> {
    (0..16).map(MidiPacket::all_notes_off).collect()
}

struct InputLoop {
    transport: Arc<dyn MidiTransport>,
    port: MidiPort,
    queue: Arc<MidiQueue>,
    dispatcher: Arc<MidiDispatcher>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    counters: Arc<Counters>,
    timeout: Duration,
}

impl InputLoop {
    fn run(self) {
        self.dispatcher.reset_clock();
        let mut buffer = vec![0u8; self.port.max_packet_size.max(PACKET_SIZE)];

        while self.running.load(Ordering::Acquire) && self.transport.is_connected() {
            let received = match self.transport.receive(&self.port, &mut buffer, self.timeout) {
                Ok(received) => received,
                Err(err) => {
                    if !self.transport.is_connected() {
                        break;
                    }
                    tracing::debug!(%err, "midi input I/O error");
                    thread::sleep(READ_ERROR_BACKOFF);
                    continue;
                }
            };
            if received == 0 || self.paused.load(Ordering::Acquire) {
                continue;
            }

            let now = now_micros();
            let mut offset = 0;
            while offset < received {
                let mut packet = MidiPacket::default();
                let consumed = packet.deserialize(&buffer, offset, received);
                if consumed == 0 {
                    self.counters
                        .truncated_input_bytes
                        .fetch_add((received - offset) as u64, Ordering::Relaxed);
                    break;
                }
                offset += consumed;
                self.queue.push(packet.with_timestamp(now));
            }
        }
        tracing::debug!("midi input thread finished");
    }
}

struct OutputLoop {
    transport: Arc<dyn MidiTransport>,
    port: MidiPort,
    queue: Arc<MidiQueue>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    counters: Arc<Counters>,
    timeout: Duration,
}

impl OutputLoop {
    fn run(self) {
        self.write(all_notes_off());

        while self.running.load(Ordering::Acquire) && self.transport.is_connected() {
            if self.paused.load(Ordering::Acquire) {
                thread::sleep(PAUSED_POLL);
                continue;
            }
            if self.queue.wait_for_data(self.timeout) {
                let result = write_coalesced(
                    self.transport.as_ref(),
                    &self.port,
                    self.queue.drain(),
                    self.timeout,
                );
                self.counters.record(&result);
            }
        }

        tracing::debug!("send all notes off before closing midi output");
        self.write(all_notes_off());
    }

    fn write(&self, packets: Vec<MidiPacket>) {
        let result = write_coalesced(self.transport.as_ref(), &self.port, packets, self.timeout);
        self.counters.record(&result);
    }
}
