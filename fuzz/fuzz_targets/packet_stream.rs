#![no_main]

use beatmaker_midi::packet::PACKET_SIZE;
use beatmaker_midi::{MidiDispatcher, MidiPacket};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let dispatcher = MidiDispatcher::default();
    let mut offset = 0;
    let mut packet = MidiPacket::default();
    while packet.deserialize(data, offset, data.len()) == PACKET_SIZE {
        let mut frame = [0u8; PACKET_SIZE];
        assert_eq!(packet.serialize(&mut frame, 0), PACKET_SIZE);
        assert_eq!(&frame[..], &data[offset..offset + PACKET_SIZE]);
        let _ = packet.message_bytes();
        dispatcher.dispatch(&packet);
        offset += PACKET_SIZE;
    }
});
