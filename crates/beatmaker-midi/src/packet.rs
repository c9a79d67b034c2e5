//! USB-MIDI event packets.
//!
//! Every packet is exactly four bytes on the wire: the first byte carries the
//! virtual cable number in the high nibble and the code index number (CIN) in
//! the low nibble, the remaining three bytes are the raw MIDI message padded
//! with zeros.

use smallvec::SmallVec;

use crate::note::MidiNote;
use crate::MidiTimestamp;

/// Size of a serialized packet in bytes.
pub const PACKET_SIZE: usize = 4;

/// Code index numbers defined by the USB-MIDI class specification.
pub mod cin {
    pub const MISC: u8 = 0x0;
    pub const CABLE_EVENT: u8 = 0x1;
    pub const SYSTEM_COMMON_2: u8 = 0x2;
    pub const SYSTEM_COMMON_3: u8 = 0x3;
    pub const SYSEX_START: u8 = 0x4;
    pub const SYSEX_END_1: u8 = 0x5;
    pub const SYSEX_END_2: u8 = 0x6;
    pub const SYSEX_END_3: u8 = 0x7;
    pub const NOTE_OFF: u8 = 0x8;
    pub const NOTE_ON: u8 = 0x9;
    pub const POLY_KEY_PRESS: u8 = 0xA;
    pub const CONTROL_CHANGE: u8 = 0xB;
    pub const PROGRAM_CHANGE: u8 = 0xC;
    pub const CHANNEL_PRESSURE: u8 = 0xD;
    pub const PITCH_BEND: u8 = 0xE;
    pub const SINGLE_BYTE: u8 = 0xF;
}

/// Controller number of the "all notes off" channel mode message.
pub const CC_ALL_NOTES_OFF: u8 = 0x7B;

/// One USB-MIDI event packet plus its local receive/enqueue timestamp.
///
/// The timestamp never goes over the wire; zero means it has not been set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MidiPacket {
    pub timestamp: MidiTimestamp,
    pub cable: u8,
    pub cin: u8,
    pub midi0: u8,
    pub midi1: u8,
    pub midi2: u8,
}

impl MidiPacket {
    /// Builds a packet, masking cable and CIN to four bits.
    pub fn new(cable: u8, cin: u8, midi0: u8, midi1: u8, midi2: u8) -> Self {
        Self {
            timestamp: 0,
            cable: cable & 0x0f,
            cin: cin & 0x0f,
            midi0,
            midi1,
            midi2,
        }
    }

    /// Packet for a raw channel or system message on cable 0, deriving the
    /// CIN from the status byte.
    pub fn from_message(status: u8, data1: u8, data2: u8) -> Self {
        Self::new(0, status >> 4, status, data1, data2)
    }

    pub fn note_on(note: MidiNote) -> Self {
        Self::new(
            0,
            cin::NOTE_ON,
            0x90 | (note.channel & 0x0f),
            note.pitch & 0x7f,
            note.velocity & 0x7f,
        )
    }

    pub fn note_off(note: MidiNote) -> Self {
        Self::new(
            0,
            cin::NOTE_OFF,
            0x80 | (note.channel & 0x0f),
            note.pitch & 0x7f,
            0,
        )
    }

    /// "All notes off" channel mode message for one channel.
    pub fn all_notes_off(channel: u8) -> Self {
        Self::new(
            0,
            cin::CONTROL_CHANGE,
            0xB0 | (channel & 0x0f),
            CC_ALL_NOTES_OFF,
            0,
        )
    }

    /// Single-byte system realtime message such as clock (`0xF8`) or start (`0xFA`).
    pub fn realtime(byte: u8) -> Self {
        Self::new(0, cin::SINGLE_BYTE, byte, 0, 0)
    }

    pub fn with_timestamp(mut self, timestamp: MidiTimestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// MIDI channel of a channel voice message.
    pub fn channel(&self) -> u8 {
        self.midi0 & 0x0f
    }

    /// Writes the 4-byte frame at `offset`.
    ///
    /// Returns the number of bytes written, or 0 when fewer than four bytes
    /// are available in `buffer` after `offset`.
    pub fn serialize(&self, buffer: &mut [u8], offset: usize) -> usize {
        let Some(frame) = buffer.get_mut(offset..offset.saturating_add(PACKET_SIZE)) else {
            return 0;
        };
        frame[0] = ((self.cable & 0x0f) << 4) | (self.cin & 0x0f);
        frame[1] = self.midi0;
        frame[2] = self.midi1;
        frame[3] = self.midi2;
        PACKET_SIZE
    }

    /// Reads a 4-byte frame at `offset`, considering only the first `length`
    /// bytes of `buffer` as valid.
    ///
    /// Returns the number of bytes consumed, or 0 when fewer than four valid
    /// bytes remain. The timestamp is cleared; the caller stamps it.
    pub fn deserialize(&mut self, buffer: &[u8], offset: usize, length: usize) -> usize {
        let end = length.min(buffer.len());
        if end < offset.saturating_add(PACKET_SIZE) {
            return 0;
        }
        let frame = &buffer[offset..offset + PACKET_SIZE];
        self.timestamp = 0;
        self.cable = frame[0] >> 4;
        self.cin = frame[0] & 0x0f;
        self.midi0 = frame[1];
        self.midi1 = frame[2];
        self.midi2 = frame[3];
        PACKET_SIZE
    }

    /// Convenience wrapper around [`MidiPacket::deserialize`] for a single frame.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        let mut packet = Self::default();
        (packet.deserialize(frame, 0, frame.len()) == PACKET_SIZE).then_some(packet)
    }

    pub fn to_frame(&self) -> [u8; PACKET_SIZE] {
        let mut frame = [0u8; PACKET_SIZE];
        self.serialize(&mut frame, 0);
        frame
    }

    /// The raw MIDI bytes carried by this packet, sized by its CIN.
    pub fn message_bytes(&self) -> SmallVec<[u8; 3]> {
        let bytes = [self.midi0, self.midi1, self.midi2];
        SmallVec::from_slice(&bytes[..message_len(self.cin)])
    }
}

/// Number of meaningful MIDI bytes for a code index number.
pub fn message_len(code: u8) -> usize {
    match code & 0x0f {
        cin::MISC | cin::CABLE_EVENT => 0,
        cin::SYSEX_END_1 | cin::SINGLE_BYTE => 1,
        cin::SYSTEM_COMMON_2 | cin::SYSEX_END_2 | cin::PROGRAM_CHANGE | cin::CHANNEL_PRESSURE => 2,
        _ => 3,
    }
}

/// Splits one raw MIDI message into USB-MIDI packets on cable 0.
///
/// Sysex is framed in 3-byte chunks; single-byte system messages use CIN
/// `0xF`. A message starting with a data byte (running status) produces no
/// packets.
pub fn frame_message(bytes: &[u8]) -> SmallVec<[MidiPacket; 2]> {
    let mut packets = SmallVec::new();
    let Some(&status) = bytes.first() else {
        return packets;
    };
    let data = |index: usize| bytes.get(index).copied().unwrap_or(0);

    match status {
        0xF0 => {
            let terminated = bytes.last() == Some(&0xF7);
            let mut chunks = bytes.chunks(3).peekable();
            while let Some(chunk) = chunks.next() {
                let last = chunks.peek().is_none();
                let code = if last && terminated {
                    cin::SYSEX_END_1 + chunk.len() as u8 - 1
                } else {
                    cin::SYSEX_START
                };
                let byte = |index: usize| chunk.get(index).copied().unwrap_or(0);
                packets.push(MidiPacket::new(0, code, byte(0), byte(1), byte(2)));
            }
        }
        0xF1 | 0xF3 => packets.push(MidiPacket::new(0, cin::SYSTEM_COMMON_2, status, data(1), 0)),
        0xF2 => packets.push(MidiPacket::new(
            0,
            cin::SYSTEM_COMMON_3,
            status,
            data(1),
            data(2),
        )),
        0xF4..=0xFF => packets.push(MidiPacket::realtime(status)),
        0x80..=0xEF => packets.push(MidiPacket::from_message(status, data(1), data(2))),
        _ => {}
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_packs_cable_and_code_index() {
        let packet = MidiPacket::new(0x3, cin::NOTE_ON, 0x91, 60, 100);
        let mut buffer = [0u8; 8];
        assert_eq!(packet.serialize(&mut buffer, 2), 4);
        assert_eq!(&buffer[2..6], &[0x39, 0x91, 60, 100]);
    }

    #[test]
    fn round_trip_preserves_frame() {
        let packet = MidiPacket::new(0x1, cin::PITCH_BEND, 0xE4, 0x12, 0x40);
        let mut buffer = [0u8; 4];
        packet.serialize(&mut buffer, 0);
        let mut decoded = MidiPacket::default();
        assert_eq!(decoded.deserialize(&buffer, 0, 4), 4);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn short_buffers_report_zero() {
        let packet = MidiPacket::note_on(MidiNote::new(0, 36, 72));
        let mut small = [0u8; 3];
        assert_eq!(packet.serialize(&mut small, 0), 0);
        let mut buffer = [0u8; 6];
        assert_eq!(packet.serialize(&mut buffer, 3), 0);

        let mut decoded = MidiPacket::default();
        assert_eq!(decoded.deserialize(&[0x09, 0x90, 60, 1, 0x09], 0, 3), 0);
        assert_eq!(decoded.deserialize(&[0x09, 0x90, 60, 1, 0x09], 2, 5), 0);
    }

    #[test]
    fn deserialize_reads_code_index_at_offset() {
        let buffer = [0x0F, 0xF8, 0, 0, 0x09, 0x90, 60, 100];
        let mut decoded = MidiPacket::default();
        assert_eq!(decoded.deserialize(&buffer, 4, buffer.len()), 4);
        assert_eq!(decoded.cin, cin::NOTE_ON);
        assert_eq!(decoded.midi1, 60);
    }

    #[test]
    fn note_constructors_match_wire_layout() {
        let note = MidiNote::new(2, 38, 72);
        assert_eq!(MidiPacket::note_on(note).to_frame(), [0x09, 0x92, 38, 72]);
        assert_eq!(MidiPacket::note_off(note).to_frame(), [0x08, 0x82, 38, 0]);
        assert_eq!(MidiPacket::all_notes_off(0).to_frame(), [0x0B, 0xB0, 0x7B, 0]);
    }

    #[test]
    fn message_bytes_follow_code_index_length() {
        assert_eq!(
            MidiPacket::from_message(0xC3, 5, 0).message_bytes().as_slice(),
            &[0xC3, 5]
        );
        assert_eq!(MidiPacket::realtime(0xF8).message_bytes().as_slice(), &[0xF8]);
        assert!(MidiPacket::new(0, cin::MISC, 1, 2, 3).message_bytes().is_empty());
    }

    #[test]
    fn frames_sysex_in_three_byte_chunks() {
        let packets = frame_message(&[0xF0, 0x43, 0x10, 0x4C, 0x00, 0xF7]);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].cin, cin::SYSEX_START);
        assert_eq!(packets[1].cin, cin::SYSEX_END_3);

        let packets = frame_message(&[0xF0, 0x7E, 0xF7]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].cin, cin::SYSEX_END_3);

        let packets = frame_message(&[0xF0, 0x7E, 0x01, 0xF7]);
        assert_eq!(packets[1].cin, cin::SYSEX_END_1);
        assert_eq!(packets[1].midi0, 0xF7);
    }

    #[test]
    fn frames_channel_and_realtime_messages() {
        let note = frame_message(&[0x93, 64, 90]);
        assert_eq!(note.as_slice(), &[MidiPacket::new(0, cin::NOTE_ON, 0x93, 64, 90)]);

        let clock = frame_message(&[0xF8]);
        assert_eq!(clock[0].cin, cin::SINGLE_BYTE);

        assert!(frame_message(&[0x40, 0x10]).is_empty());
        assert!(frame_message(&[]).is_empty());
    }
}
