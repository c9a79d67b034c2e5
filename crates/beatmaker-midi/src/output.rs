//! Output side: the sink seam used by the sequencer and the coalescing writer.

use std::time::Duration;

use parking_lot::Mutex;

use crate::packet::MidiPacket;
use crate::transport::{MidiPort, MidiTransport};
use crate::{now_micros, MidiError};

/// Destination for packets generated by the sequencer.
///
/// Packets are collected with `enqueue` and transmitted together on `flush`.
pub trait MidiSink: Send + Sync {
    fn enqueue(&self, packet: MidiPacket);

    fn flush(&self);
}

/// Sink that keeps everything in memory, one frame per `flush`.
///
/// Useful for offline rendering and for asserting on generated output.
#[derive(Default)]
pub struct MemorySink {
    pending: Mutex<Vec<MidiPacket>>,
    frames: Mutex<Vec<Vec<MidiPacket>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every flushed frame, including empty ones.
    pub fn frames(&self) -> Vec<Vec<MidiPacket>> {
        self.frames.lock().clone()
    }

    /// All flushed packets in order.
    pub fn packets(&self) -> Vec<MidiPacket> {
        self.frames.lock().iter().flatten().copied().collect()
    }

    /// Packets enqueued but not yet flushed.
    pub fn pending(&self) -> Vec<MidiPacket> {
        self.pending.lock().clone()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
        self.frames.lock().clear();
    }
}

impl MidiSink for MemorySink {
    fn enqueue(&self, packet: MidiPacket) {
        self.pending.lock().push(packet);
    }

    fn flush(&self) {
        let frame = std::mem::take(&mut *self.pending.lock());
        self.frames.lock().push(frame);
    }
}

/// Result of one coalesced write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub bytes: usize,
    pub transfers: usize,
    /// Largest age in microseconds of the oldest packet in any transfer.
    pub max_latency_us: u64,
}

/// Packs packets into transfers of at most `port.max_packet_size` bytes and
/// sends them.
///
/// Any transfer the transport accepts only partially aborts the write with
/// [`MidiError::ShortWrite`].
pub fn write_coalesced<I>(
    transport: &dyn MidiTransport,
    port: &MidiPort,
    packets: I,
    timeout: Duration,
) -> Result<WriteReport, MidiError>
where
    I: IntoIterator<Item = MidiPacket>,
{
    let mut buffer = vec![0u8; port.max_packet_size.max(crate::packet::PACKET_SIZE)];
    let mut report = WriteReport::default();
    let mut filled = 0;
    let mut earliest = 0u64;
    let mut packets = packets.into_iter().peekable();

    while let Some(packet) = packets.next() {
        if packet.timestamp != 0 && (earliest == 0 || packet.timestamp < earliest) {
            earliest = packet.timestamp;
        }
        let written = packet.serialize(&mut buffer, filled);
        if written == 0 {
            break;
        }
        filled += written;

        let full = filled + crate::packet::PACKET_SIZE > buffer.len();
        if full || packets.peek().is_none() {
            let sent = transport.send(port, &buffer[..filled], timeout)?;
            if sent != filled {
                return Err(MidiError::ShortWrite {
                    sent,
                    expected: filled,
                });
            }
            report.bytes += filled;
            report.transfers += 1;
            if earliest != 0 {
                report.max_latency_us = report
                    .max_latency_us
                    .max(now_micros().saturating_sub(earliest));
            }
            filled = 0;
            earliest = 0;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::mock::MockTransport;
    use crate::note::MidiNote;
    use crate::transport::PortDirection;

    fn notes(count: u8) -> Vec<MidiPacket> {
        (0..count)
            .map(|pitch| MidiPacket::note_on(MidiNote::new(0, pitch, 100)).with_timestamp(now_micros()))
            .collect()
    }

    #[test]
    fn memory_sink_records_one_frame_per_flush() {
        let sink = MemorySink::new();
        sink.enqueue(MidiPacket::realtime(0xFA));
        sink.flush();
        sink.flush();
        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![MidiPacket::realtime(0xFA)]);
        assert!(frames[1].is_empty());
    }

    #[test]
    fn coalesces_into_port_sized_transfers() {
        let mock = MockTransport::new("mock.0", "Mock");
        mock.open().unwrap();
        let mut port = mock.default_output().unwrap();
        port.max_packet_size = 8;
        let report = write_coalesced(&mock, &port, notes(5), Duration::ZERO).unwrap();
        assert_eq!(report.bytes, 20);
        assert_eq!(report.transfers, 3);
        assert_eq!(mock.sent_packets().len(), 5);
    }

    struct HalfWriter(AtomicUsize);

    impl MidiTransport for HalfWriter {
        fn id(&self) -> &str {
            "half"
        }
        fn alias(&self) -> String {
            "half".into()
        }
        fn set_alias(&self, _counter: usize) {}
        fn open(&self) -> Result<(), MidiError> {
            Ok(())
        }
        fn close(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn detect_ports(&self) {}
        fn default_input(&self) -> Option<MidiPort> {
            None
        }
        fn default_output(&self) -> Option<MidiPort> {
            Some(MidiPort::new(PortDirection::Output, 0))
        }
        fn send(&self, _port: &MidiPort, bytes: &[u8], _timeout: Duration) -> Result<usize, MidiError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(bytes.len() / 2)
        }
        fn receive(&self, _port: &MidiPort, _buffer: &mut [u8], _timeout: Duration) -> Result<usize, MidiError> {
            Ok(0)
        }
    }

    #[test]
    fn short_write_aborts_batch() {
        let transport = HalfWriter(AtomicUsize::new(0));
        let port = MidiPort::new(PortDirection::Output, 0);
        let result = write_coalesced(&transport, &port, notes(3), Duration::ZERO);
        assert!(matches!(
            result,
            Err(MidiError::ShortWrite {
                sent: 6,
                expected: 12
            })
        ));
        assert_eq!(transport.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn empty_batch_sends_nothing() {
        let mock = MockTransport::new("mock.0", "Mock");
        mock.open().unwrap();
        let port = mock.default_output().unwrap();
        let report = write_coalesced(&mock, &port, Vec::new(), Duration::ZERO).unwrap();
        assert_eq!(report, WriteReport::default());
        assert!(mock.sent_bytes().is_empty());
    }
}
